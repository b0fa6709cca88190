//! Decoding the chunks of one section on a pool of worker threads.
//!
//! The chunk index is walked on the calling thread first, so its node cache is never
//! shared. A producer feeds stored chunks to the workers over a bounded channel; workers
//! only read and decode, and the calling thread stitches each decoded chunk into the
//! destination as it arrives.
use bytes::Bytes;
use crossbeam_channel::bounded;

use crate::array::TypedArray;
use crate::chunk::ChunkEntry;
use crate::reader::ChunkedArrayReader;
use crate::stitch::Stitcher;
use crate::storage::ReadAt;
use crate::tiling::IndexSpace;

impl<R: ReadAt + Sync + ?Sized> ChunkedArrayReader<'_, R> {
    /// Like [read_section](Self::read_section), decoding chunks on `config.workers` threads.
    pub fn read_section_concurrent(&mut self, want: &IndexSpace) -> crate::Result<TypedArray> {
        let workers = self.config.workers;
        let nbytes = self.check_section(want)?;
        if workers <= 1 || nbytes == 0 || !self.descriptor.storage.is_chunked() {
            return self.read_section(want);
        }

        let index = self.index()?;
        let entries = index.list_chunks_for_region(want)?;
        let tiling = index.tiling().clone();
        let (missing, stored): (Vec<ChunkEntry>, Vec<ChunkEntry>) =
            entries.into_iter().partition(ChunkEntry::is_missing);
        log::debug!(
            "{}: reading {want} with {workers} workers, {} stored and {} missing chunks",
            self.descriptor.name,
            stored.len(),
            missing.len()
        );

        let element_size = self.descriptor.element_size;
        let mut dst = vec![0u8; nbytes];
        let mut transfers = 0;
        for entry in &missing {
            let chunk = tiling.chunk_space(entry.origin());
            transfers += Stitcher::new(&chunk, want).transfer_fill(
                self.descriptor.fill_value.as_ref(),
                element_size,
                &mut dst,
            );
        }

        let decoder = self.decoder()?;
        let stitched = std::thread::scope(|scope| -> crate::Result<usize> {
            let (job_tx, job_rx) = bounded::<usize>(workers * 2);
            let (done_tx, done_rx) = bounded::<(usize, crate::Result<Bytes>)>(workers * 2);

            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let decoder = &decoder;
                let stored = &stored;
                scope.spawn(move || {
                    for i in job_rx {
                        let decoded = decoder.decode(&stored[i]);
                        if done_tx.send((i, decoded)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(done_tx);

            let n = stored.len();
            scope.spawn(move || {
                for i in 0..n {
                    if job_tx.send(i).is_err() {
                        break;
                    }
                }
            });

            let mut transfers = 0;
            // returning early drops the receiver, which stops the workers
            for (i, decoded) in done_rx {
                let data = decoded?;
                let chunk = tiling.chunk_space(stored[i].origin());
                transfers += Stitcher::new(&chunk, want).transfer(&data, element_size, &mut dst);
            }
            Ok(transfers)
        })?;

        self.stats.chunks_missing += missing.len() as u64;
        self.stats.chunks_decoded += stored.len() as u64;
        self.stats.transfers += (transfers + stitched) as u64;
        self.wrap(want.shape().to_vec(), dst)
    }
}
