use serde::{Deserialize, Serialize};

/// Number of compression levels tracked per block.
pub const NUM_COMPRESSION_LEVELS: usize = 4;

/// Memory traffic statistics.
///
/// Records the transactions a cache sent to (and received from) memory.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub read_transactions: u64,
    pub write_transactions: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Fills synthesized from the clear value without memory traffic.
    pub clear_fills: u64,
    pub uncompressed_fills: u64,
    pub compressed_fills: [u64; NUM_COMPRESSION_LEVELS],
    pub uncompressed_spills: u64,
    pub compressed_spills: [u64; NUM_COMPRESSION_LEVELS],
    /// Bytes of block state table saved or restored.
    pub state_bytes: u64,
}

impl Traffic {
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.bytes_read + self.bytes_written
    }

    #[must_use]
    pub fn total_spills(&self) -> u64 {
        self.uncompressed_spills + self.compressed_spills.iter().sum::<u64>()
    }
}

impl std::ops::AddAssign for Traffic {
    fn add_assign(&mut self, other: Self) {
        self.read_transactions += other.read_transactions;
        self.write_transactions += other.write_transactions;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.clear_fills += other.clear_fills;
        self.uncompressed_fills += other.uncompressed_fills;
        self.uncompressed_spills += other.uncompressed_spills;
        for level in 0..NUM_COMPRESSION_LEVELS {
            self.compressed_fills[level] += other.compressed_fills[level];
            self.compressed_spills[level] += other.compressed_spills[level];
        }
        self.state_bytes += other.state_bytes;
    }
}
