use crate::{address, cache};
use serde::{Deserialize, Serialize};

/// Configuration error.
///
/// Every constructor validates its configuration up front. An invalid
/// configuration is a defect of the caller, never a transient condition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{component}: {what} must be non-zero")]
    Zero {
        component: &'static str,
        what: &'static str,
    },
    #[error("{component}: {what} must be a power of two (got {value})")]
    NotPowerOfTwo {
        component: &'static str,
        what: &'static str,
        value: usize,
    },
    #[error("{component}: replacement policy {policy:?} is not supported with {ways} ways")]
    UnsupportedPolicy {
        component: &'static str,
        policy: cache::config::ReplacementPolicy,
        ways: usize,
    },
    #[error("{component}: {what} ({value}) must be a multiple of {multiple}")]
    NotMultiple {
        component: &'static str,
        what: &'static str,
        value: usize,
        multiple: usize,
    },
    #[error("{component}: {what} ({value}) is out of range [{min}, {max}]")]
    OutOfRange {
        component: &'static str,
        what: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
}

fn non_zero(component: &'static str, what: &'static str, value: usize) -> Result<(), Error> {
    if value == 0 {
        return Err(Error::Zero { component, what });
    }
    Ok(())
}

fn power_of_two(component: &'static str, what: &'static str, value: usize) -> Result<(), Error> {
    non_zero(component, what, value)?;
    if !value.is_power_of_two() {
        return Err(Error::NotPowerOfTwo {
            component,
            what,
            value,
        });
    }
    Ok(())
}

/// Geometry of a set associative cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cache {
    /// Number of ways.
    pub ways: usize,
    /// Number of lines per way (number of sets).
    pub num_sets: usize,
    /// Line size in bytes.
    pub line_size: usize,
    pub replacement_policy: cache::config::ReplacementPolicy,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            ways: 4,
            num_sets: 16,
            line_size: 256,
            replacement_policy: cache::config::ReplacementPolicy::LRU,
        }
    }
}

impl std::fmt::Display for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let size = human_bytes::human_bytes(self.total_bytes() as f64);
        write!(
            f,
            "{size} ({} set, {}-way, {} byte line, {:?})",
            self.num_sets, self.ways, self.line_size, self.replacement_policy
        )
    }
}

impl Cache {
    /// The total size of the cache in bytes.
    #[inline]
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.line_size * self.num_sets * self.ways
    }

    /// Number of lines in total.
    #[inline]
    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.num_sets * self.ways
    }

    pub fn validate(&self, component: &'static str) -> Result<(), Error> {
        non_zero(component, "number of ways", self.ways)?;
        power_of_two(component, "number of lines", self.num_sets)?;
        power_of_two(component, "line size", self.line_size)?;
        if self.line_size < 4 {
            return Err(Error::NotMultiple {
                component,
                what: "line size",
                value: self.line_size,
                multiple: 4,
            });
        }
        if self.replacement_policy == cache::config::ReplacementPolicy::PSEUDO_LRU
            && !self.ways.is_power_of_two()
        {
            return Err(Error::UnsupportedPolicy {
                component,
                policy: self.replacement_policy,
                ways: self.ways,
            });
        }
        Ok(())
    }
}

/// Configuration of a compressed (color / depth) cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressedCache {
    pub cache: Cache,

    /// Number of ports for reading lines.
    pub read_ports: usize,
    /// Number of ports for writing lines.
    pub write_ports: usize,
    /// Bytes transferred by a port per cycle.
    pub port_width: usize,

    /// Number of outstanding fill/spill requests.
    pub request_queue_size: usize,
    /// Number of in-flight fills.
    pub input_buffers: usize,
    /// Number of in-flight spills.
    pub output_buffers: usize,

    pub compression: bool,
    pub compressor_latency: u64,
    pub decompressor_latency: u64,

    /// Number of stamp units sharing the buffer.
    pub stamp_units: usize,
    /// Bytes assigned to a stamp unit before moving to the next one.
    pub stamp_unit_stride: usize,
    /// Stamp unit served by this cache.
    pub stamp_unit: usize,
    /// Maximum number of blocks with tracked compression state.
    pub max_blocks: usize,
    /// Blocks reset to the clear state per cycle.
    pub blocks_per_cycle: usize,

    /// Number of memory tickets (in-flight memory transactions).
    pub memory_tickets: usize,
    /// Maximum bytes per memory transaction.
    pub max_transaction_size: usize,
    /// Bytes moved over the memory bus per cycle.
    pub bus_width: usize,

    pub buffer_address: address,
    pub state_address: address,
    pub bytes_per_pixel: usize,
    pub msaa_samples: usize,
    /// Clear value (first `bytes_per_pixel` bytes are used).
    pub clear_value: Vec<u8>,
}

impl Default for CompressedCache {
    fn default() -> Self {
        Self {
            cache: Cache::default(),
            read_ports: 1,
            write_ports: 1,
            port_width: 64,
            request_queue_size: 8,
            input_buffers: 4,
            output_buffers: 4,
            compression: true,
            compressor_latency: 4,
            decompressor_latency: 2,
            stamp_units: 1,
            stamp_unit_stride: 256,
            stamp_unit: 0,
            max_blocks: 4096,
            blocks_per_cycle: 64,
            memory_tickets: 16,
            max_transaction_size: 64,
            bus_width: 16,
            buffer_address: 0,
            state_address: 0x0100_0000,
            bytes_per_pixel: 4,
            msaa_samples: 1,
            clear_value: vec![0; 4],
        }
    }
}

impl std::fmt::Display for CompressedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} r/w ports={}/{} ({} B) compression={} tickets={}",
            self.cache,
            self.read_ports,
            self.write_ports,
            self.port_width,
            self.compression,
            self.memory_tickets,
        )
    }
}

/// Largest supported pixel (bytes per pixel times samples).
pub const MAX_PIXEL_BYTES: usize = 128;

impl CompressedCache {
    /// Bytes of the persisted block state table, padded to the transaction size.
    #[must_use]
    pub fn state_table_bytes(&self) -> usize {
        let words = self.max_blocks.div_ceil(8);
        (words * 4).next_multiple_of(self.max_transaction_size.max(1))
    }

    pub fn validate(&self) -> Result<(), Error> {
        const COMPONENT: &str = "compressed cache";
        self.cache.validate(COMPONENT)?;
        non_zero(COMPONENT, "read ports", self.read_ports)?;
        non_zero(COMPONENT, "write ports", self.write_ports)?;
        non_zero(COMPONENT, "port width", self.port_width)?;
        non_zero(COMPONENT, "request queue size", self.request_queue_size)?;
        non_zero(COMPONENT, "input buffers", self.input_buffers)?;
        non_zero(COMPONENT, "output buffers", self.output_buffers)?;
        non_zero(COMPONENT, "stamp units", self.stamp_units)?;
        non_zero(COMPONENT, "stamp unit stride", self.stamp_unit_stride)?;
        non_zero(COMPONENT, "blocks per cycle", self.blocks_per_cycle)?;
        non_zero(COMPONENT, "memory tickets", self.memory_tickets)?;
        non_zero(COMPONENT, "bus width", self.bus_width)?;
        power_of_two(COMPONENT, "max transaction size", self.max_transaction_size)?;
        if self.stamp_unit >= self.stamp_units {
            return Err(Error::OutOfRange {
                component: COMPONENT,
                what: "stamp unit",
                value: self.stamp_unit,
                min: 0,
                max: self.stamp_units - 1,
            });
        }
        if self.stamp_unit_stride % self.cache.line_size != 0 {
            return Err(Error::NotMultiple {
                component: COMPONENT,
                what: "stamp unit stride",
                value: self.stamp_unit_stride,
                multiple: self.cache.line_size,
            });
        }
        self.validate_pixel(self.bytes_per_pixel, self.msaa_samples)?;
        if self.clear_value.len() < self.bytes_per_pixel {
            return Err(Error::OutOfRange {
                component: COMPONENT,
                what: "clear value length",
                value: self.clear_value.len(),
                min: self.bytes_per_pixel,
                max: MAX_PIXEL_BYTES,
            });
        }
        Ok(())
    }

    /// Validates a pixel format (also used when the format changes at runtime).
    pub fn validate_pixel(&self, bytes_per_pixel: usize, msaa_samples: usize) -> Result<(), Error> {
        const COMPONENT: &str = "compressed cache";
        power_of_two(COMPONENT, "bytes per pixel", bytes_per_pixel)?;
        power_of_two(COMPONENT, "msaa samples", msaa_samples)?;
        let pixel_bytes = bytes_per_pixel * msaa_samples;
        if pixel_bytes > MAX_PIXEL_BYTES.min(self.cache.line_size) {
            return Err(Error::OutOfRange {
                component: COMPONENT,
                what: "pixel size",
                value: pixel_bytes,
                min: 1,
                max: MAX_PIXEL_BYTES.min(self.cache.line_size),
            });
        }
        let lanes = crate::rop::compression::lanes(bytes_per_pixel, msaa_samples);
        let words = self.cache.line_size / 4;
        if words % lanes != 0 {
            return Err(Error::NotMultiple {
                component: COMPONENT,
                what: "words per line",
                value: words,
                multiple: lanes,
            });
        }
        Ok(())
    }
}

/// Configuration of the simple memory model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Memory {
    /// Cycles between a read request and its reply.
    pub latency: u64,
    /// Maximum number of pending read replies.
    pub reply_queue_size: usize,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            latency: 20,
            reply_queue_size: 16,
        }
    }
}

/// Top level simulation configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Simulation {
    pub cache: CompressedCache,
    pub memory: Memory,
}

#[cfg(test)]
mod tests {
    use super::{Cache, CompressedCache, Error};
    use crate::cache::config::ReplacementPolicy;
    use color_eyre::eyre;

    #[test]
    fn test_default_is_valid() -> eyre::Result<()> {
        CompressedCache::default().validate()?;
        Ok(())
    }

    #[test]
    fn test_zero_sized_cache() {
        let config = Cache {
            ways: 0,
            ..Cache::default()
        };
        assert_eq!(
            config.validate("test"),
            Err(Error::Zero {
                component: "test",
                what: "number of ways"
            })
        );

        let config = Cache {
            line_size: 0,
            ..Cache::default()
        };
        assert!(matches!(config.validate("test"), Err(Error::Zero { .. })));

        let config = Cache {
            num_sets: 0,
            ..Cache::default()
        };
        assert!(matches!(config.validate("test"), Err(Error::Zero { .. })));
    }

    #[test]
    fn test_line_holds_a_word() {
        for line_size in [1, 2] {
            let config = Cache {
                line_size,
                ..Cache::default()
            };
            assert_eq!(
                config.validate("test"),
                Err(Error::NotMultiple {
                    component: "test",
                    what: "line size",
                    value: line_size,
                    multiple: 4,
                })
            );
        }
        let config = Cache {
            line_size: 4,
            ..Cache::default()
        };
        assert_eq!(config.validate("test"), Ok(()));
    }

    #[test]
    fn test_pixel_lanes_divide_the_line() {
        let config = CompressedCache::default();
        // 128 single byte samples on a line of 64 words
        assert_eq!(config.validate_pixel(1, 64), Ok(()));
        assert!(matches!(
            config.validate_pixel(1, 128),
            Err(Error::NotMultiple {
                what: "words per line",
                value: 64,
                multiple: 128,
                ..
            })
        ));

        let config = CompressedCache {
            cache: Cache {
                line_size: 16,
                ..Cache::default()
            },
            ..CompressedCache::default()
        };
        assert!(matches!(
            config.validate_pixel(2, 8),
            Err(Error::NotMultiple { multiple: 8, .. })
        ));
        assert_eq!(config.validate_pixel(2, 4), Ok(()));
    }

    #[test]
    fn test_stamp_unit_in_range() {
        let config = CompressedCache {
            stamp_units: 2,
            stamp_unit: 2,
            ..CompressedCache::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::OutOfRange {
                what: "stamp unit",
                max: 1,
                ..
            })
        ));
        let config = CompressedCache {
            stamp_units: 2,
            stamp_unit: 1,
            ..CompressedCache::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_pseudo_lru_needs_power_of_two_ways() {
        let config = Cache {
            ways: 3,
            replacement_policy: ReplacementPolicy::PSEUDO_LRU,
            ..Cache::default()
        };
        assert!(matches!(
            config.validate("test"),
            Err(Error::UnsupportedPolicy { ways: 3, .. })
        ));
        let config = Cache {
            ways: 3,
            replacement_policy: ReplacementPolicy::LRU,
            ..Cache::default()
        };
        assert_eq!(config.validate("test"), Ok(()));
    }

    #[test]
    fn test_state_table_bytes() {
        let config = CompressedCache {
            max_blocks: 100,
            max_transaction_size: 64,
            ..CompressedCache::default()
        };
        // 100 blocks -> 13 words -> 52 bytes -> padded to 64
        assert_eq!(config.state_table_bytes(), 64);
    }

    #[test]
    fn test_deserialize_partial_yaml() -> eyre::Result<()> {
        let yaml = r"
cache:
  cache:
    ways: 8
    replacement_policy: FIFO
  compression: false
memory:
  latency: 5
";
        let config: super::Simulation = serde_yaml::from_str(yaml)?;
        assert_eq!(config.cache.cache.ways, 8);
        assert_eq!(config.cache.cache.replacement_policy, ReplacementPolicy::FIFO);
        assert_eq!(config.cache.cache.line_size, 256);
        assert!(!config.cache.compression);
        assert_eq!(config.memory.latency, 5);
        assert_eq!(config.memory.reply_queue_size, 16);
        Ok(())
    }
}
