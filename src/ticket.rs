use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Identifier of an in-flight memory transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket(pub u32);

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ticket#{}", self.0)
    }
}

/// Fixed pool of memory tickets.
///
/// A memory transaction can only be issued while holding a ticket.
/// `free() + in_flight() == capacity()` at all times.
#[derive(Debug, Clone)]
pub struct Pool {
    free: VecDeque<Ticket>,
    in_flight: Vec<bool>,
}

impl Pool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity as u32).map(Ticket).collect(),
            in_flight: vec![false; capacity],
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn free(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().filter(|&&in_flight| in_flight).count()
    }

    #[must_use]
    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    #[must_use]
    pub fn is_in_flight(&self, ticket: Ticket) -> bool {
        self.in_flight
            .get(ticket.0 as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn acquire(&mut self) -> Option<Ticket> {
        let ticket = self.free.pop_front()?;
        self.in_flight[ticket.0 as usize] = true;
        Some(ticket)
    }

    pub fn release(&mut self, ticket: Ticket) {
        assert!(
            self.is_in_flight(ticket),
            "ticket pool: releasing {ticket} which is not in flight"
        );
        self.in_flight[ticket.0 as usize] = false;
        self.free.push_back(ticket);
    }
}
