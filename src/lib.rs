#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

pub mod cache;
pub mod config;
pub mod dram;
pub mod fifo;
pub mod mem_fetch;
pub mod morton;
pub mod mshr;
pub mod rop;
pub mod sim;
pub mod tag_array;
pub mod ticket;
pub mod workload;

#[cfg(test)]
pub mod testing;

pub use cache::{LineId, ReservationFailure};
pub use rop::CompressedCache;

pub type address = u64;

/// Reads a little-endian word at `offset`.
#[inline]
#[must_use]
pub fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Writes a little-endian word at `offset`.
#[inline]
pub fn write_u32_le(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
