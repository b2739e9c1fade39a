use super::{address, ticket::Ticket};
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

/// Per byte mask of a line or a transaction.
pub type ByteMask = BitVec<u8, Lsb0>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    READ_REQUEST = 0,
    WRITE_REQUEST,
    READ_REPLY,
}

/// What a memory transaction was issued for.
///
/// Travels with the transaction so traces can attribute traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cookie {
    /// fill of a cache line (read entry index)
    Fill(usize),
    /// spill of a cache line (write entry index)
    Spill(usize),
    SaveState,
    RestoreState,
}

impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Fill(entry) => write!(f, "fill[{entry}]"),
            Self::Spill(entry) => write!(f, "spill[{entry}]"),
            Self::SaveState => write!(f, "save-state"),
            Self::RestoreState => write!(f, "restore-state"),
        }
    }
}

/// Memory controller state.
///
/// A bitmask sampled every cycle telling which directions the
/// controller currently accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemState(pub u32);

impl MemState {
    pub const READ_ACCEPT: u32 = 0x1;
    pub const WRITE_ACCEPT: u32 = 0x2;

    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(Self::READ_ACCEPT | Self::WRITE_ACCEPT);

    #[inline]
    #[must_use]
    pub fn accepts_reads(self) -> bool {
        self.0 & Self::READ_ACCEPT != 0
    }

    #[inline]
    #[must_use]
    pub fn accepts_writes(self) -> bool {
        self.0 & Self::WRITE_ACCEPT != 0
    }
}

impl std::fmt::Display for MemState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "MemState({}{})",
            if self.accepts_reads() { "R" } else { "-" },
            if self.accepts_writes() { "W" } else { "-" },
        )
    }
}

/// A memory transaction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MemFetch {
    pub kind: Kind,
    pub addr: address,
    pub size: u32,
    /// payload of write requests and read replies
    pub data: Vec<u8>,
    /// enabled bytes of a write request (all when `None`)
    pub byte_mask: Option<ByteMask>,
    pub ticket: Ticket,
    pub cookie: Cookie,
}

impl std::fmt::Debug for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemFetch")
            .field("kind", &self.kind)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .field("ticket", &self.ticket)
            .field("cookie", &self.cookie)
            .field("masked", &self.byte_mask.is_some())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?}@{:#x}[{}B, {}, {}]",
            self.kind, self.addr, self.size, self.ticket, self.cookie
        )
    }
}

impl MemFetch {
    #[must_use]
    pub fn read_request(addr: address, size: u32, ticket: Ticket, cookie: Cookie) -> Self {
        Self {
            kind: Kind::READ_REQUEST,
            addr,
            size,
            data: Vec::new(),
            byte_mask: None,
            ticket,
            cookie,
        }
    }

    #[must_use]
    pub fn write_request(
        addr: address,
        data: Vec<u8>,
        byte_mask: Option<ByteMask>,
        ticket: Ticket,
        cookie: Cookie,
    ) -> Self {
        debug_assert!(byte_mask.as_ref().map_or(true, |mask| mask.len() == data.len()));
        Self {
            kind: Kind::WRITE_REQUEST,
            addr,
            size: data.len() as u32,
            data,
            byte_mask,
            ticket,
            cookie,
        }
    }

    /// Turns a read request into its reply.
    #[must_use]
    pub fn into_reply(self, data: Vec<u8>) -> Self {
        debug_assert_eq!(self.kind, Kind::READ_REQUEST);
        debug_assert_eq!(data.len(), self.size as usize);
        Self {
            kind: Kind::READ_REPLY,
            data,
            ..self
        }
    }

    #[inline]
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.kind == Kind::WRITE_REQUEST
    }

    #[inline]
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.kind == Kind::READ_REPLY
    }

    /// Bytes carried over the data bus.
    #[inline]
    #[must_use]
    pub fn data_size(&self) -> u32 {
        match self.kind {
            Kind::READ_REQUEST => 0,
            Kind::WRITE_REQUEST | Kind::READ_REPLY => self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cookie, Kind, MemFetch, MemState};
    use crate::ticket::Ticket;

    #[test]
    fn test_mem_state_bits() {
        assert!(MemState::ALL.accepts_reads());
        assert!(MemState::ALL.accepts_writes());
        assert!(!MemState::NONE.accepts_reads());
        let state = MemState(MemState::WRITE_ACCEPT);
        assert!(!state.accepts_reads());
        assert!(state.accepts_writes());
        assert_eq!(state.to_string(), "MemState(-W)");
    }

    #[test]
    fn test_reply_keeps_ticket() {
        let fetch = MemFetch::read_request(0x40, 4, Ticket(3), Cookie::Fill(1));
        assert_eq!(fetch.data_size(), 0);
        let reply = fetch.into_reply(vec![1, 2, 3, 4]);
        assert_eq!(reply.kind, Kind::READ_REPLY);
        assert_eq!(reply.ticket, Ticket(3));
        assert_eq!(reply.cookie, Cookie::Fill(1));
        assert_eq!(reply.data_size(), 4);
    }
}
