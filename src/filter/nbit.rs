//! N-bit unpacking for the legacy dialect.
//!
//! Packed data is a big-endian bitstream of `bit_length`-bit fields, one per element.
//! Each field is put back at bits `start_bit - bit_length + 1 ..= start_bit` of a full-width
//! integer; the remaining bits come from the fill and sign-extension flags.
use crate::chunk::NBitParams;
use crate::storage::Endian;

struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    /// Read `n` (<= 64) bits, most significant first.
    fn read(&mut self, n: u32) -> u64 {
        let mut value = 0u64;
        for _ in 0..n {
            let byte = self.data[self.bit / 8];
            let b = (byte >> (7 - (self.bit % 8))) & 1;
            value = (value << 1) | u64::from(b);
            self.bit += 1;
        }
        value
    }
}

fn low_bits(n: u32) -> u64 {
    if n >= 64 { u64::MAX } else { (1u64 << n) - 1 }
}

/// Expand `packed` into `uncompressed_length` bytes of full-width elements in `endian` order.
pub fn unpack(
    packed: &[u8],
    params: &NBitParams,
    uncompressed_length: u64,
    endian: Endian,
) -> crate::Result<Vec<u8>> {
    let size = usize::from(params.element_size);
    if !(1..=8).contains(&size) {
        return Err(crate::Error::general(format!(
            "n-bit element size must be 1..=8 bytes, got {size}"
        )));
    }
    let elem_bits = 8 * size as u32;
    let NBitParams {
        sign_extend,
        fill_one,
        start_bit,
        bit_length,
        ..
    } = *params;
    if bit_length == 0 || start_bit >= elem_bits || bit_length > start_bit + 1 {
        return Err(crate::Error::general(format!(
            "n-bit field of {bit_length} bits ending at bit {start_bit} does not fit a {size}-byte element"
        )));
    }

    let count = usize::try_from(uncompressed_length / size as u64)
        .map_err(|_| crate::Error::general("n-bit output too large"))?;
    let needed_bits = count as u128 * u128::from(bit_length);
    if needed_bits > packed.len() as u128 * 8 {
        return Err(crate::Error::general(format!(
            "n-bit input has {} bytes, {count} elements of {bit_length} bits need {}",
            packed.len(),
            needed_bits.div_ceil(8)
        )));
    }

    let offset = start_bit + 1 - bit_length;
    let full = low_bits(elem_bits);
    let low_mask = low_bits(offset);
    let field_mask = low_bits(bit_length) << offset;
    let high_mask = full & !(field_mask | low_mask);

    let mut out = vec![0u8; count * size];
    let mut bits = BitReader::new(packed);
    for elem in out.chunks_exact_mut(size) {
        let field = bits.read(bit_length);
        let mut value = field << offset;
        if fill_one {
            value |= low_mask;
        }
        let top = if sign_extend {
            (field >> (bit_length - 1)) & 1 == 1
        } else {
            fill_one
        };
        if top {
            value |= high_mask;
        }
        endian.write_uint(elem, value & full, size);
    }
    Ok(out)
}
