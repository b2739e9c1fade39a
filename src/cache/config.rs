use crate::config;

use serde::{Deserialize, Serialize};

/// A cache replacement policy
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumIter,
)]
pub enum ReplacementPolicy {
    LRU,        // L
    PSEUDO_LRU, // P
    FIFO,       // F
    NONE,       // N
}

/// Derived cache geometry.
///
/// Holds the shift amounts and masks used to split an address into
/// tag, set index and line offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Cache replacement policy.
    pub replacement_policy: ReplacementPolicy,

    /// Cache line size.
    pub line_size: usize,

    /// Cache associativity.
    pub associativity: usize,

    /// Number of sets.
    pub num_sets: usize,

    /// Number of lines.
    ///
    /// NOTE: CAN BE COMPUTED from sets and associativity.
    pub total_lines: usize,
    pub line_size_log2: u32,
    pub num_sets_log2: u32,
}

impl From<&config::Cache> for Config {
    fn from(config: &config::Cache) -> Self {
        Self {
            replacement_policy: config.replacement_policy,
            associativity: config.ways,
            num_sets: config.num_sets,
            total_lines: config.num_sets * config.ways,
            line_size: config.line_size,
            line_size_log2: config.line_size.trailing_zeros(),
            num_sets_log2: config.num_sets.trailing_zeros(),
        }
    }
}

impl Config {
    #[inline]
    #[must_use]
    pub fn offset_mask(&self) -> u64 {
        self.line_size as u64 - 1
    }

    #[inline]
    #[must_use]
    pub fn set_mask(&self) -> u64 {
        self.num_sets as u64 - 1
    }

    /// Byte offset within the line.
    #[inline]
    #[must_use]
    pub fn offset(&self, addr: crate::address) -> usize {
        (addr & self.offset_mask()) as usize
    }

    /// Set index.
    ///
    /// A cache with a single line per way has no set bits (fully associative).
    #[inline]
    #[must_use]
    pub fn set_index(&self, addr: crate::address) -> usize {
        ((addr >> self.line_size_log2) & self.set_mask()) as usize
    }

    #[inline]
    #[must_use]
    pub fn tag(&self, addr: crate::address) -> crate::address {
        addr >> (self.line_size_log2 + self.num_sets_log2)
    }

    /// Address of the first byte of the line holding `addr`.
    #[inline]
    #[must_use]
    pub fn line_addr(&self, addr: crate::address) -> crate::address {
        addr & !self.offset_mask()
    }

    /// Rebuilds a line address from a tag and a set index.
    #[inline]
    #[must_use]
    pub fn addr_of(&self, tag: crate::address, set: usize) -> crate::address {
        (tag << (self.line_size_log2 + self.num_sets_log2))
            | ((set as u64) << self.line_size_log2)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::config;

    #[test]
    fn test_address_split() {
        let config = Config::from(&config::Cache {
            ways: 4,
            num_sets: 16,
            line_size: 64,
            ..config::Cache::default()
        });
        let addr = 0x1234_5678;
        assert_eq!(config.offset(addr), 0x38);
        assert_eq!(config.set_index(addr), 0x9);
        assert_eq!(config.tag(addr), 0x1234_5678 >> 10);
        assert_eq!(
            config.addr_of(config.tag(addr), config.set_index(addr)),
            config.line_addr(addr)
        );
    }

    #[test]
    fn test_fully_associative() {
        let config = Config::from(&config::Cache {
            ways: 8,
            num_sets: 1,
            line_size: 32,
            ..config::Cache::default()
        });
        for addr in [0u64, 0x20, 0x1000, 0xffe0] {
            assert_eq!(config.set_index(addr), 0);
            assert_eq!(config.addr_of(config.tag(addr), 0), addr);
        }
    }
}
