//! Morton (Z-order) curve.
//!
//! Bits are interleaved with two 256 entry tables computed at compile time:
//! `SPREAD` moves bit `i` of a byte to bit `2i`, `COMPACT` gathers the even
//! bits of a byte into a nibble.

const fn build_spread() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut value = 0;
    while value < 256 {
        let mut spread = 0u16;
        let mut bit = 0;
        while bit < 8 {
            spread |= (((value >> bit) & 1) as u16) << (2 * bit);
            bit += 1;
        }
        table[value] = spread;
        value += 1;
    }
    table
}

const fn build_compact() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut value = 0;
    while value < 256 {
        let mut compact = 0u8;
        let mut bit = 0;
        while bit < 4 {
            compact |= (((value >> (2 * bit)) & 1) as u8) << bit;
            bit += 1;
        }
        table[value] = compact;
        value += 1;
    }
    table
}

pub const SPREAD: [u16; 256] = build_spread();
pub const COMPACT: [u8; 256] = build_compact();

#[inline]
fn spread(value: u16) -> u32 {
    u32::from(SPREAD[usize::from(value & 0xff)]) | (u32::from(SPREAD[usize::from(value >> 8)]) << 16)
}

#[inline]
fn compact(code: u32) -> u16 {
    code.to_le_bytes()
        .iter()
        .enumerate()
        .fold(0, |acc, (i, &byte)| acc | (u16::from(COMPACT[usize::from(byte)]) << (4 * i)))
}

/// Interleaves `x` (even bits) and `y` (odd bits).
#[inline]
#[must_use]
pub fn encode(x: u16, y: u16) -> u32 {
    spread(x) | (spread(y) << 1)
}

#[inline]
#[must_use]
pub fn decode(code: u32) -> (u16, u16) {
    (compact(code), compact(code >> 1))
}

/// Visiting order of `pixels` row major pixels along the Morton curve.
///
/// The pixels form a tile `2^ceil(k/2)` wide and `2^floor(k/2)` high for
/// `pixels = 2^k`. Other pixel counts are visited in row major order.
#[must_use]
pub fn order(pixels: usize) -> Vec<usize> {
    if !pixels.is_power_of_two() || pixels > 1 << 16 {
        return (0..pixels).collect();
    }
    let width = 1usize << pixels.ilog2().div_ceil(2);
    (0..pixels)
        .map(|code| {
            let (x, y) = decode(code as u32);
            usize::from(y) * width + usize::from(x)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{decode, encode, order, COMPACT, SPREAD};

    #[test]
    fn test_tables() {
        assert_eq!(SPREAD[0b1011], 0b100_0101);
        assert_eq!(SPREAD[0xff], 0x5555);
        assert_eq!(COMPACT[0b100_0101], 0b1011);
        assert_eq!(COMPACT[0xaa], 0);
        for value in 0..=255u8 {
            assert_eq!(COMPACT[usize::from(SPREAD[usize::from(value)] as u8)], value & 0xf);
        }
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode(0, 0), 0);
        assert_eq!(encode(1, 0), 1);
        assert_eq!(encode(0, 1), 2);
        assert_eq!(encode(3, 3), 15);
        for (x, y) in [(0u16, 0u16), (5, 9), (255, 1), (1234, 4321), (u16::MAX, 0)] {
            assert_eq!(decode(encode(x, y)), (x, y));
        }
    }

    #[test]
    fn test_order() {
        assert_eq!(order(1), vec![0]);
        assert_eq!(order(4), vec![0, 1, 2, 3]);
        assert_eq!(
            order(16),
            vec![0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15]
        );
        assert_eq!(order(6), vec![0, 1, 2, 3, 4, 5]);

        let mut visited = order(32);
        visited.sort_unstable();
        assert_eq!(visited, (0..32).collect::<Vec<_>>());
    }
}
