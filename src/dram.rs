use crate::{address, config, mem_fetch, mem_fetch::MemFetch};
use std::collections::{HashMap, VecDeque};

pub const PAGE_SIZE: usize = 4096;

/// Fixed latency main memory.
///
/// Read replies are returned in order, one per cycle, `latency` cycles after
/// the request. Writes are applied when accepted.
#[derive(Debug)]
pub struct MainMemory {
    pub name: String,
    config: config::Memory,
    pages: HashMap<u64, Box<[u8]>>,
    latency_queue: VecDeque<(u64, MemFetch)>,
    pub stats: stats::Traffic,
}

impl MainMemory {
    #[must_use]
    pub fn new(name: impl Into<String>, config: &config::Memory) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
            pages: HashMap::new(),
            latency_queue: VecDeque::new(),
            stats: stats::Traffic::default(),
        }
    }

    /// Transactions the memory accepts this cycle.
    #[must_use]
    pub fn state(&self) -> mem_fetch::MemState {
        let mut state = mem_fetch::MemState::WRITE_ACCEPT;
        if self.latency_queue.len() < self.config.reply_queue_size {
            state |= mem_fetch::MemState::READ_ACCEPT;
        }
        mem_fetch::MemState(state)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.latency_queue.is_empty()
    }

    pub fn accept(&mut self, cycle: u64, fetch: MemFetch) {
        match fetch.kind {
            mem_fetch::Kind::READ_REQUEST => {
                self.stats.read_transactions += 1;
                self.stats.bytes_read += u64::from(fetch.size);
                let ready_cycle = cycle + self.config.latency;
                log::trace!("{}: {} ready at cycle {}", self.name, fetch, ready_cycle);
                self.latency_queue.push_back((ready_cycle, fetch));
            }
            mem_fetch::Kind::WRITE_REQUEST => {
                self.stats.write_transactions += 1;
                self.stats.bytes_written += u64::from(fetch.size);
                log::trace!("{}: {}", self.name, fetch);
                self.write(fetch.addr, &fetch.data, fetch.byte_mask.as_ref());
            }
            mem_fetch::Kind::READ_REPLY => {
                panic!("{}: accept({fetch}) of a read reply", self.name)
            }
        }
    }

    /// Returns the read reply that is ready this cycle.
    pub fn cycle(&mut self, cycle: u64) -> Option<MemFetch> {
        let (ready_cycle, _) = self.latency_queue.front()?;
        if *ready_cycle > cycle {
            return None;
        }
        let (_, fetch) = self.latency_queue.pop_front()?;
        let data = self.read(fetch.addr, fetch.size as usize);
        Some(fetch.into_reply(data))
    }

    /// Reads `size` bytes, unwritten memory reads as zero.
    #[must_use]
    pub fn read(&self, addr: address, size: usize) -> Vec<u8> {
        (0..size as u64)
            .map(|i| {
                let addr = addr + i;
                self.pages
                    .get(&(addr / PAGE_SIZE as u64))
                    .map_or(0, |page| page[(addr % PAGE_SIZE as u64) as usize])
            })
            .collect()
    }

    /// Writes `data`, only the bytes enabled in `mask`.
    pub fn write(&mut self, addr: address, data: &[u8], mask: Option<&mem_fetch::ByteMask>) {
        for (i, &byte) in data.iter().enumerate() {
            if mask.is_some_and(|mask| !mask[i]) {
                continue;
            }
            let addr = addr + i as u64;
            let page = self
                .pages
                .entry(addr / PAGE_SIZE as u64)
                .or_insert_with(|| vec![0; PAGE_SIZE].into_boxed_slice());
            page[(addr % PAGE_SIZE as u64) as usize] = byte;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MainMemory;
    use crate::{config, mem_fetch, ticket::Ticket};
    use bitvec::prelude::*;

    #[test]
    fn test_masked_write_across_pages() {
        let mut mem = MainMemory::new("mem", &config::Memory::default());
        let mask = bitvec![u8, Lsb0; 1, 0, 1, 1];
        mem.write(0xffe, &[1, 2, 3, 4], Some(&mask));
        assert_eq!(mem.read(0xffd, 6), vec![0, 1, 0, 3, 4, 0]);
    }

    #[test]
    fn test_read_latency() {
        let config = config::Memory {
            latency: 5,
            reply_queue_size: 1,
        };
        let mut mem = MainMemory::new("mem", &config);
        mem.write(0x100, &[7; 8], None);
        assert!(mem.state().accepts_reads());

        let fetch = mem_fetch::MemFetch::read_request(0x100, 8, Ticket(3), mem_fetch::Cookie::SaveState);
        mem.accept(10, fetch);
        assert!(!mem.state().accepts_reads());
        assert!(mem.state().accepts_writes());
        assert!(mem.cycle(14).is_none());

        let reply = mem.cycle(15).unwrap();
        assert!(reply.is_reply());
        assert_eq!(reply.ticket, Ticket(3));
        assert_eq!(reply.data, vec![7; 8]);
        assert!(mem.is_idle());
        assert_eq!(mem.stats.bytes_read, 8);
    }
}
