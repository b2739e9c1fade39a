//! Lossless delta compression of color and depth lines.
//!
//! A line is a sequence of little-endian 32-bit words grouped into pixels
//! of `lanes` words. Pixels are visited in Morton order; the first pixel is
//! stored verbatim and every other word as the difference to the same lane
//! of the previously visited pixel, using a fixed number of signed bits per
//! compression level.

use crate::morton;
use bitvec::prelude::*;

pub const NUM_LEVELS: usize = 4;

/// Signed bits per delta for every compression level.
pub const LEVEL_BITS: [usize; NUM_LEVELS] = [16, 8, 4, 0];

/// Words per pixel of a pixel format.
#[must_use]
pub fn lanes(bytes_per_pixel: usize, msaa_samples: usize) -> usize {
    (bytes_per_pixel / 4).max(1) * msaa_samples
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressor {
    line_size: usize,
    lanes: usize,
    pixels: usize,
    /// pixel visiting order
    order: Vec<usize>,
}

impl Compressor {
    #[must_use]
    pub fn new(line_size: usize, bytes_per_pixel: usize, msaa_samples: usize) -> Self {
        let lanes = lanes(bytes_per_pixel, msaa_samples);
        let words = line_size / 4;
        assert!(
            lanes > 0 && words % lanes == 0,
            "compressor: {lanes} lanes do not divide a {line_size} byte line"
        );
        let pixels = words / lanes;
        Self {
            line_size,
            lanes,
            pixels,
            order: morton::order(pixels),
        }
    }

    /// Compressed size in bytes of a line at `level`.
    #[must_use]
    pub fn compressed_size(&self, level: u8) -> usize {
        let bits = LEVEL_BITS[usize::from(level)];
        let base = 4 * self.lanes;
        let deltas = (self.pixels - 1) * self.lanes * bits;
        (base + deltas.div_ceil(8)).next_multiple_of(4)
    }

    fn word(&self, line: &[u8], pixel: usize, lane: usize) -> u32 {
        crate::read_u32_le(line, (pixel * self.lanes + lane) * 4)
    }

    /// Deltas along the visiting order, pixel major.
    fn deltas(&self, line: &[u8]) -> Vec<i32> {
        self.order
            .windows(2)
            .flat_map(|pair| {
                (0..self.lanes).map(move |lane| {
                    let prev = self.word(line, pair[0], lane);
                    let current = self.word(line, pair[1], lane);
                    current.wrapping_sub(prev) as i32
                })
            })
            .collect()
    }

    /// Compresses a line using the best level that fits.
    ///
    /// # Returns
    /// The level and the compressed bytes, or `None` if no level is
    /// smaller than the line.
    #[must_use]
    pub fn compress(&self, line: &[u8]) -> Option<(u8, Vec<u8>)> {
        assert_eq!(
            line.len(),
            self.line_size,
            "compressor: compress of a partial line"
        );
        let deltas = self.deltas(line);
        let level = (0..NUM_LEVELS as u8).rev().find(|&level| {
            let bits = LEVEL_BITS[usize::from(level)];
            self.compressed_size(level) < self.line_size && deltas.iter().all(|&delta| fits(delta, bits))
        })?;

        let bits = LEVEL_BITS[usize::from(level)];
        let size = self.compressed_size(level);
        let mut compressed = Vec::with_capacity(size);
        let first = self.order[0];
        for lane in 0..self.lanes {
            compressed.extend_from_slice(&self.word(line, first, lane).to_le_bytes());
        }
        if bits > 0 {
            let mut packed = bitvec![u8, Lsb0; 0; deltas.len() * bits];
            for (chunk, &delta) in packed.chunks_exact_mut(bits).zip(&deltas) {
                chunk.store_le(delta as u32);
            }
            compressed.extend_from_slice(packed.as_raw_slice());
        }
        compressed.resize(size, 0);
        log::trace!(
            "compressor: {} byte line => level {} ({} bytes)",
            self.line_size,
            level,
            size
        );
        Some((level, compressed))
    }

    /// Restores a line compressed at `level`.
    #[must_use]
    pub fn decompress(&self, compressed: &[u8], level: u8) -> Vec<u8> {
        let bits = LEVEL_BITS[usize::from(level)];
        assert!(
            compressed.len() >= self.compressed_size(level),
            "compressor: {} bytes are too few for level {}",
            compressed.len(),
            level
        );
        let mut line = vec![0u8; self.line_size];
        let base = 4 * self.lanes;
        let packed = compressed[base..].view_bits::<Lsb0>();

        let first = self.order[0];
        for lane in 0..self.lanes {
            let word = crate::read_u32_le(compressed, lane * 4);
            crate::write_u32_le(&mut line, (first * self.lanes + lane) * 4, word);
        }
        for (step, pair) in self.order.windows(2).enumerate() {
            for lane in 0..self.lanes {
                let delta = if bits == 0 {
                    0
                } else {
                    let start = (step * self.lanes + lane) * bits;
                    sign_extend(packed[start..start + bits].load_le::<u32>(), bits)
                };
                let prev = self.word(&line, pair[0], lane);
                let offset = (pair[1] * self.lanes + lane) * 4;
                crate::write_u32_le(&mut line, offset, prev.wrapping_add(delta as u32));
            }
        }
        line
    }
}

fn fits(delta: i32, bits: usize) -> bool {
    match bits {
        0 => delta == 0,
        32.. => true,
        _ => {
            let limit = 1i64 << (bits - 1);
            (-limit..limit).contains(&i64::from(delta))
        }
    }
}

fn sign_extend(raw: u32, bits: usize) -> i32 {
    let shift = 32 - bits as u32;
    ((raw << shift) as i32) >> shift
}
