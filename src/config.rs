use serde::{Deserialize, Serialize};

/// Tunables for reading chunked variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderConfig {
    /// Largest buffer, in bytes, a single read or decoded chunk may need.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: u64,
    /// Recompute fletcher32 checksums instead of only stripping them.
    #[serde(default)]
    pub verify_checksums: bool,
    /// Size of the input buffer handed to the inflater.
    #[serde(default = "default_inflate_buffer_size")]
    pub inflate_buffer_size: usize,
    /// Worker threads for concurrent reads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Approximate element count of each piece when streaming a variable without chunks.
    #[serde(default = "default_max_stream_elements")]
    pub max_stream_elements: u64,
}

fn default_max_buffer_bytes() -> u64 {
    i32::MAX as u64
}

fn default_inflate_buffer_size() -> usize {
    20_000
}

fn default_workers() -> usize {
    4
}

fn default_max_stream_elements() -> u64 {
    100_000
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
            verify_checksums: false,
            inflate_buffer_size: default_inflate_buffer_size(),
            workers: default_workers(),
            max_stream_elements: default_max_stream_elements(),
        }
    }
}

impl ReaderConfig {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_max_buffer_bytes(mut self, max_buffer_bytes: u64) -> Self {
        self.max_buffer_bytes = max_buffer_bytes;
        self
    }

    pub fn with_verify_checksums(mut self, verify_checksums: bool) -> Self {
        self.verify_checksums = verify_checksums;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_stream_elements(mut self, max_stream_elements: u64) -> Self {
        self.max_stream_elements = max_stream_elements;
        self
    }
}
