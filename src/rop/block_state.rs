use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

/// Bits per block in the persisted state table.
pub const BITS_PER_BLOCK: usize = 4;
pub const BLOCKS_PER_WORD: usize = 32 / BITS_PER_BLOCK;

/// Compression state of a memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockState {
    /// content is the clear value, nothing stored in memory
    CLEAR,
    UNCOMPRESSED,
    /// stored compressed with the given level
    COMPRESSED(u8),
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::CLEAR => write!(f, "CLEAR"),
            Self::UNCOMPRESSED => write!(f, "UNCOMPRESSED"),
            Self::COMPRESSED(level) => write!(f, "COMPRESSED({level})"),
        }
    }
}

impl BlockState {
    /// Packs the state into 4 bits: state in bits 0-1, level in bits 2-3.
    #[must_use]
    pub fn encode(self) -> u8 {
        match self {
            Self::CLEAR => 0,
            Self::UNCOMPRESSED => 1,
            Self::COMPRESSED(level) => {
                debug_assert!(level < 4, "block state: level {level} out of range");
                2 | ((level & 0x3) << 2)
            }
        }
    }

    #[must_use]
    pub fn decode(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::CLEAR,
            1 => Self::UNCOMPRESSED,
            2 => Self::COMPRESSED((bits >> 2) & 0x3),
            _ => panic!("block state: unsupported state encoding {bits:#06b}"),
        }
    }
}

/// Compression state of every tracked block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    states: Vec<BlockState>,
}

impl Table {
    #[must_use]
    pub fn new(max_blocks: usize, initial: BlockState) -> Self {
        Self {
            states: vec![initial; max_blocks],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    #[must_use]
    pub fn get(&self, block: usize) -> BlockState {
        self.states[block]
    }

    pub fn set(&mut self, block: usize, state: BlockState) {
        self.states[block] = state;
    }

    /// Sets the blocks in `range` (clamped to the table) to `state`.
    ///
    /// Returns the number of blocks set.
    pub fn fill(&mut self, range: std::ops::Range<usize>, state: BlockState) -> usize {
        let end = range.end.min(self.states.len());
        let start = range.start.min(end);
        self.states[start..end].fill(state);
        end - start
    }

    /// Packs the table, 8 blocks per little-endian 32-bit word, zero padded to `size` bytes.
    #[must_use]
    pub fn pack(&self, size: usize) -> Vec<u8> {
        let mut packed = bitvec![u8, Lsb0; 0; size * 8];
        for (block, state) in self.states.iter().enumerate() {
            let start = block * BITS_PER_BLOCK;
            packed[start..start + BITS_PER_BLOCK].store_le(state.encode());
        }
        packed.into_vec()
    }

    /// Loads the table from its packed representation.
    pub fn unpack(&mut self, packed: &[u8]) {
        let bits = packed.view_bits::<Lsb0>();
        assert!(
            bits.len() >= self.states.len() * BITS_PER_BLOCK,
            "block state: packed table of {} bytes too small for {} blocks",
            packed.len(),
            self.states.len()
        );
        for (block, state) in self.states.iter_mut().enumerate() {
            let start = block * BITS_PER_BLOCK;
            *state = BlockState::decode(bits[start..start + BITS_PER_BLOCK].load_le::<u8>());
        }
    }
}
