use super::block_state::BlockState;
use crate::{address, mem_fetch::ByteMask, mshr};
use std::collections::VecDeque;

/// Bounded ring of in-flight entries.
///
/// Entries keep their slot until removed, iteration goes from the
/// oldest to the youngest entry.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    slots: Vec<Option<T>>,
    order: VecDeque<usize>,
}

impl<T> Ring<T> {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(size).collect(),
            order: VecDeque::with_capacity(size),
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.order.len() >= self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Inserts an entry and returns its slot.
    pub fn insert(&mut self, entry: T) -> Option<usize> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(entry);
        self.order.push_back(slot);
        Some(slot)
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, slot: usize) -> Option<T> {
        let entry = self.slots.get_mut(slot)?.take()?;
        self.order.retain(|&s| s != slot);
        Some(entry)
    }

    /// Iterates over `(slot, entry)` from the oldest entry.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.order
            .iter()
            .filter_map(|&slot| self.slots[slot].as_ref().map(|entry| (slot, entry)))
    }

    /// Slot of the oldest entry matching `predicate`.
    pub fn oldest(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.iter()
            .find(|(_, entry)| predicate(entry))
            .map(|(slot, _)| slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadStage {
    /// waiting for data from memory
    FETCHING,
    /// all data received
    RECEIVED,
    DECOMPRESSING,
    /// line data ready to be written into the cache
    DECOMPRESSED,
    /// line write in progress
    WRITING,
}

/// In-flight fill of a cache line.
#[derive(Debug, Clone)]
pub struct ReadEntry {
    pub request: mshr::Request,
    /// tracked block of the line
    pub block: Option<usize>,
    /// block state when the fill was started
    pub state: BlockState,
    /// bytes to read from memory
    pub size: usize,
    pub requested: usize,
    pub received: usize,
    /// memory data, the line data once decompressed
    pub data: Vec<u8>,
    /// the line must be spilled before it is overwritten
    pub write_wait: bool,
    pub stage: ReadStage,
}

impl ReadEntry {
    #[must_use]
    pub fn addr(&self) -> address {
        self.request.in_address
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStage {
    /// waiting for a read port
    PENDING,
    /// line read in progress
    READING,
    COMPRESS,
    COMPRESSING,
    /// writing to memory
    SPILLING,
}

/// In-flight spill of a cache line.
#[derive(Debug, Clone)]
pub struct WriteEntry {
    pub request: mshr::Request,
    pub block: Option<usize>,
    /// line data, compressed once the compressor is done
    pub data: Vec<u8>,
    /// written bytes of a masked line
    pub mask: Option<ByteMask>,
    /// bytes to write to memory
    pub size: usize,
    pub issued: usize,
    pub acked: usize,
    /// read entry waiting for this line to be read
    pub read_link: Option<usize>,
    pub stage: WriteStage,
}

impl WriteEntry {
    #[must_use]
    pub fn addr(&self) -> address {
        self.request.out_address
    }
}

#[cfg(test)]
mod tests {
    use super::Ring;

    #[test]
    fn test_ring_keeps_age_order() {
        let mut ring = Ring::new(3);
        assert_eq!(ring.insert('a'), Some(0));
        assert_eq!(ring.insert('b'), Some(1));
        assert_eq!(ring.insert('c'), Some(2));
        assert!(ring.is_full());
        assert_eq!(ring.insert('d'), None);

        assert_eq!(ring.remove(0), Some('a'));
        // slot 0 is reused, but the new entry is the youngest
        assert_eq!(ring.insert('d'), Some(0));
        let order: Vec<_> = ring.iter().map(|(_, &entry)| entry).collect();
        assert_eq!(order, vec!['b', 'c', 'd']);
        assert_eq!(ring.oldest(|&entry| entry != 'b'), Some(2));
        assert_eq!(ring.remove(0), Some('d'));
        assert_eq!(ring.remove(0), None);
        assert_eq!(ring.len(), 2);
    }
}
