use crate::mem_fetch::ByteMask;
use bitvec::prelude::*;

/// Status of a line as seen by a client.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Status {
    INVALID = 0,
    /// fill or spill in flight, data not resident
    REPLACING,
    /// write buffer line that has not been completely written
    PARTIAL,
    VALID,
    MODIFIED,
}

/// Reservation state of a cache line.
///
/// Tag and valid bit live in the tag array, this holds everything
/// the reservation protocol adds on top.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Line {
    pub dirty: bool,
    /// write buffer semantics: readable only once every byte was written
    pub masked: bool,
    /// a fill and/or spill for this line is outstanding
    pub replacing: bool,
    /// number of outstanding reservations
    pub reserves: u32,
    /// per byte write mask
    pub mask: ByteMask,
}

impl std::fmt::Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Line")
            .field("reserves", &self.reserves)
            .field("dirty", &self.dirty)
            .field("masked", &self.masked)
            .field("replacing", &self.replacing)
            .field("written", &self.mask.count_ones())
            .finish()
    }
}

impl Line {
    #[must_use]
    pub fn new(line_size: usize) -> Self {
        Self {
            dirty: false,
            masked: false,
            replacing: false,
            reserves: 0,
            mask: bitvec![u8, Lsb0; 0; line_size],
        }
    }

    /// Client visible status of the line, given its valid bit.
    #[must_use]
    pub fn status(&self, valid: bool) -> Status {
        match (valid, self.replacing, self.dirty) {
            (false, _, _) => Status::INVALID,
            (true, true, _) => Status::REPLACING,
            (true, false, _) if self.masked && !self.is_fully_written() => Status::PARTIAL,
            (true, false, true) => Status::MODIFIED,
            (true, false, false) => Status::VALID,
        }
    }

    /// Whether every byte of the line was written.
    #[inline]
    #[must_use]
    pub fn is_fully_written(&self) -> bool {
        self.mask.all()
    }

    /// Data of the line can be read by a client.
    #[inline]
    #[must_use]
    pub fn is_readable(&self) -> bool {
        !self.replacing && (!self.masked || self.is_fully_written())
    }

    /// The line may be chosen as a victim.
    #[inline]
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.reserves == 0 && !self.replacing
    }

    pub fn reserve(&mut self, count: u32) {
        self.reserves += count;
    }

    /// Releases one reservation.
    pub fn release(&mut self) {
        assert!(
            self.reserves > 0,
            "line: releasing a reservation on an unreserved line {self}"
        );
        self.reserves -= 1;
    }

    pub fn clear_mask(&mut self) {
        self.mask.fill(false);
    }

    /// Marks `size` bytes starting at `offset` as written.
    ///
    /// When a byte mask is given only the enabled bytes are marked.
    /// Returns the number of bytes marked.
    pub fn mark_written(&mut self, offset: usize, size: usize, byte_mask: Option<&ByteMask>) -> usize {
        let range = &mut self.mask[offset..offset + size];
        match byte_mask {
            Some(byte_mask) => {
                *range |= &byte_mask[..size];
                byte_mask[..size].count_ones()
            }
            None => {
                range.fill(true);
                size
            }
        }
    }

    /// Clears all reservation state (line invalidated).
    pub fn reset(&mut self) {
        self.dirty = false;
        self.masked = false;
        self.replacing = false;
        self.reserves = 0;
        self.clear_mask();
    }
}

#[cfg(test)]
mod tests {
    use super::{Line, Status};
    use bitvec::prelude::*;

    #[test]
    fn test_status() {
        let mut line = Line::new(8);
        assert_eq!(line.status(false), Status::INVALID);
        assert_eq!(line.status(true), Status::VALID);
        line.replacing = true;
        assert_eq!(line.status(true), Status::REPLACING);
        line.replacing = false;
        line.masked = true;
        assert_eq!(line.status(true), Status::PARTIAL);
        line.mark_written(0, 8, None);
        line.dirty = true;
        assert_eq!(line.status(true), Status::MODIFIED);
    }

    #[test]
    fn test_mark_written_with_mask() {
        let mut line = Line::new(8);
        let mask = bitvec![u8, Lsb0; 1, 0, 1, 0];
        assert_eq!(line.mark_written(2, 4, Some(&mask)), 2);
        assert_eq!(line.mask, bitvec![u8, Lsb0; 0, 0, 1, 0, 1, 0, 0, 0]);
        assert!(!line.is_fully_written());
        line.mark_written(0, 8, None);
        assert!(line.is_fully_written());
    }

    #[test]
    #[should_panic(expected = "unreserved line")]
    fn test_release_unreserved_line() {
        let mut line = Line::new(4);
        line.release();
    }
}
