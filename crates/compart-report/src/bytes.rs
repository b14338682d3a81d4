//! Checked fixed-offset decoding over byte slices
//!
//! Every field read names what it is reading; out-of-bounds reads become
//! `CorruptHeader` errors instead of panics. Values are stored in the byte
//! order of the machine that wrote them, so decoding is native-endian with
//! an optional swap.

use crate::error::{ReportError, Result};

/// Bounds-checked reader for fixed-layout records.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    swap: bool,
    source: &'a str,
}

impl<'a> ByteReader<'a> {
    /// Reader over `data`; `source` names the file or store in errors.
    pub fn new(data: &'a [u8], source: &'a str) -> Self {
        Self { data, swap: false, source }
    }

    /// Same bytes, decoded with the opposite byte order when `swap` is set.
    pub fn swapped(self, swap: bool) -> Self {
        Self { swap, ..self }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn field<const N: usize>(&self, offset: usize, name: &str) -> Result<[u8; N]> {
        let bytes = offset
            .checked_add(N)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                ReportError::corrupt(
                    self.source,
                    format!(
                        "field '{}' at offset {} ({} bytes) beyond record of {} bytes",
                        name,
                        offset,
                        N,
                        self.data.len()
                    ),
                )
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        if self.swap {
            out.reverse();
        }
        Ok(out)
    }

    pub fn f64_at(&self, offset: usize, name: &str) -> Result<f64> {
        self.field::<8>(offset, name).map(f64::from_ne_bytes)
    }

    pub fn f32_at(&self, offset: usize, name: &str) -> Result<f32> {
        self.field::<4>(offset, name).map(f32::from_ne_bytes)
    }

    pub fn i32_at(&self, offset: usize, name: &str) -> Result<i32> {
        self.field::<4>(offset, name).map(i32::from_ne_bytes)
    }

    pub fn u32_at(&self, offset: usize, name: &str) -> Result<u32> {
        self.field::<4>(offset, name).map(u32::from_ne_bytes)
    }

    pub fn u64_at(&self, offset: usize, name: &str) -> Result<u64> {
        self.field::<8>(offset, name).map(u64::from_ne_bytes)
    }

    /// Non-negative `i32` count field.
    pub fn count_at(&self, offset: usize, name: &str) -> Result<usize> {
        let value = self.i32_at(offset, name)?;
        usize::try_from(value)
            .map_err(|_| ReportError::corrupt(self.source, format!("negative {}: {}", name, value)))
    }

    /// NUL-terminated string in a fixed `width`-byte slot. Byte order does not apply.
    pub fn cstr_at(&self, offset: usize, width: usize, name: &str) -> Result<String> {
        let slot = offset
            .checked_add(width)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                ReportError::corrupt(self.source, format!("string '{}' at offset {} truncated", name, offset))
            })?;
        let len = slot.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&slot[..len]).trim().to_string())
    }
}

/// Decode native-order `f32`s from `bytes` into `out`, swapping if asked.
///
/// `bytes.len()` must be `4 * out.len()`.
pub fn decode_f32s(bytes: &[u8], swap: bool, out: &mut [f32]) {
    debug_assert_eq!(bytes.len(), out.len() * 4);
    for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        let mut raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
        if swap {
            raw.reverse();
        }
        *value = f32::from_ne_bytes(raw);
    }
}

/// Native-order bytes of `values`.
pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_ne_bytes());
    }
    out
}
