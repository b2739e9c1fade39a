//! Compressed render target cache.
//!
//! Wraps a [`ReservationCache`] and moves its lines to and from memory,
//! compressing spilled lines and tracking the compression state of every
//! block of the render target.

pub mod block_state;
pub mod compression;
pub mod entry;
pub mod ports;

#[cfg(test)]
mod tests;

use crate::{
    address,
    cache::{block, LineId, ReservationCache, ReservationFailure},
    config,
    mem_fetch::{ByteMask, Cookie, MemFetch, MemState},
    mshr, ticket,
};
use block_state::BlockState;
use compression::Compressor;
use console::style;
use entry::{ReadEntry, ReadStage, Ring, WriteEntry, WriteStage};
use itertools::Itertools;
use ports::{Ports, Transfer};
use stats::cache::{AccessKind, AccessStat};
use std::collections::VecDeque;

/// What an in-flight memory ticket is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TicketUse {
    Fill {
        entry: usize,
        offset: usize,
        size: usize,
    },
    Spill {
        entry: usize,
        size: usize,
    },
    SaveState {
        size: usize,
    },
    RestoreState {
        offset: usize,
        size: usize,
    },
}

/// Transfer occupying the data bus.
#[derive(Debug, Clone)]
struct BusTransfer {
    ticket: ticket::Ticket,
    until: u64,
    /// read reply being received, `None` for write data
    reply: Option<MemFetch>,
}

/// Block state table operations.
#[derive(Debug, strum::EnumIter, Clone, Copy, Hash, PartialEq, Eq)]
pub enum StateOp {
    SAVE,
    RESTORE,
    RESET,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StateMachine {
    Idle,
    Running {
        op: StateOp,
        /// bytes issued to memory, blocks cleared for reset
        issued: usize,
        /// bytes acknowledged by memory
        done: usize,
        buffer: Vec<u8>,
    },
    /// finished, until the client acknowledges it
    Finished(StateOp),
}

/// The clear value repeated over a line.
fn clear_pattern(line_size: usize, bytes_per_pixel: usize, clear_value: &[u8]) -> Vec<u8> {
    clear_value[..bytes_per_pixel]
        .iter()
        .copied()
        .cycle()
        .take(line_size)
        .collect()
}

#[derive(Debug)]
pub struct CompressedCache {
    pub name: String,
    config: config::CompressedCache,
    cache: ReservationCache,
    blocks: block_state::Table,
    compressor: Compressor,
    clear_pattern: Vec<u8>,

    reads: Ring<ReadEntry>,
    writes: Ring<WriteEntry>,
    read_ports: Ports,
    write_ports: Ports,

    tickets: ticket::Pool,
    ticket_uses: Vec<Option<TicketUse>>,
    replies: VecDeque<MemFetch>,
    bus: Option<BusTransfer>,

    /// entry being decompressed and the cycle it is done
    decompressing: Option<(usize, u64)>,
    /// entry being compressed and the cycle it is done
    compressing: Option<(usize, u64)>,
    state_machine: StateMachine,

    cycle: u64,
    stats: stats::Stats,
}

impl CompressedCache {
    pub fn new(name: impl Into<String>, config: &config::CompressedCache) -> Result<Self, config::Error> {
        config.validate()?;
        let name = name.into();
        let line_size = config.cache.line_size;
        let cache = ReservationCache::new(
            format!("{name}-cache"),
            &config.cache,
            config.request_queue_size,
        )?;
        log::debug!(
            "{}: {} lines of {} bytes, {} blocks tracked, compression={}",
            name,
            config.cache.total_lines(),
            line_size,
            config.max_blocks,
            config.compression
        );
        Ok(Self {
            cache,
            blocks: block_state::Table::new(config.max_blocks, BlockState::UNCOMPRESSED),
            compressor: Compressor::new(line_size, config.bytes_per_pixel, config.msaa_samples),
            clear_pattern: clear_pattern(line_size, config.bytes_per_pixel, &config.clear_value),
            reads: Ring::new(config.input_buffers),
            writes: Ring::new(config.output_buffers),
            read_ports: Ports::new(config.read_ports, config.port_width),
            write_ports: Ports::new(config.write_ports, config.port_width),
            tickets: ticket::Pool::new(config.memory_tickets),
            ticket_uses: vec![None; config.memory_tickets],
            replies: VecDeque::new(),
            bus: None,
            decompressing: None,
            compressing: None,
            state_machine: StateMachine::Idle,
            cycle: 0,
            stats: stats::Stats::default(),
            config: config.clone(),
            name,
        })
    }

    #[must_use]
    pub fn config(&self) -> &config::CompressedCache {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &ReservationCache {
        &self.cache
    }

    #[must_use]
    pub fn tickets(&self) -> &ticket::Pool {
        &self.tickets
    }

    #[must_use]
    pub fn line_size(&self) -> usize {
        self.config.cache.line_size
    }

    #[must_use]
    pub fn line_status(&self, line: LineId) -> block::Status {
        self.cache.status(line)
    }

    /// Tracked block holding `addr`.
    ///
    /// Addresses below the buffer, owned by another stamp unit or past the
    /// last tracked block are untracked.
    #[must_use]
    pub fn block_index(&self, addr: address) -> Option<usize> {
        let offset = addr.checked_sub(self.config.buffer_address)?;
        let stride = self.config.stamp_unit_stride as u64;
        let units = self.config.stamp_units as u64;
        let chunk = offset / stride;
        if chunk % units != self.config.stamp_unit as u64 {
            return None;
        }
        let local = (chunk / units) * stride + offset % stride;
        let block = usize::try_from(local / self.line_size() as u64).ok()?;
        (block < self.blocks.len()).then_some(block)
    }

    /// Compression state of the block holding `addr`.
    ///
    /// Untracked blocks are always UNCOMPRESSED. The state of tracked blocks
    /// is kept while compression is disabled, new spills are then recorded
    /// as UNCOMPRESSED.
    #[must_use]
    pub fn block_state(&self, addr: address) -> BlockState {
        self.block_index(addr)
            .map_or(BlockState::UNCOMPRESSED, |block| self.blocks.get(block))
    }

    /// Statistics of the cache and its memory traffic.
    #[must_use]
    pub fn stats(&self) -> stats::Stats {
        let mut stats = self.stats.clone();
        stats.cache += self.cache.stats.clone();
        stats
    }

    /// Whether no transfer, entry or state operation is in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.reads.is_empty()
            && self.writes.is_empty()
            && self.bus.is_none()
            && self.replies.is_empty()
            && self.cache.num_requests() == 0
            && !matches!(self.state_machine, StateMachine::Running { .. })
    }

    // client interface

    /// Reserves the line for `addr`, loading it from memory on a miss.
    pub fn fetch(&mut self, addr: address, reserves: u32) -> Result<LineId, ReservationFailure> {
        self.cache.fetch(addr, reserves, self.cycle)
    }

    /// Reserves a line for `addr` that will be completely overwritten.
    ///
    /// Blocks stored compressed are fetched instead, a partial write
    /// could not be merged into them.
    pub fn allocate(&mut self, addr: address, reserves: u32) -> Result<LineId, ReservationFailure> {
        let line_addr = self.cache.line_addr_of(addr);
        if self.cache.has_pending_spill(addr)
            || self.writes.iter().any(|(_, entry)| entry.addr() == line_addr)
        {
            log::trace!(
                "{}::allocate({:#x}) => spill of {:#x} pending",
                self.name,
                addr,
                line_addr
            );
            self.stats.cache.inc(
                AccessKind::ALLOCATE,
                AccessStat::ReservationFailure(ReservationFailure::SPILL_PENDING.into()),
                1,
            );
            return Err(ReservationFailure::SPILL_PENDING);
        }
        if let BlockState::COMPRESSED(_) = self.block_state(addr) {
            return self.cache.fetch(addr, reserves, self.cycle);
        }
        self.cache.allocate(addr, reserves, self.cycle)
    }

    /// Reads from a reserved line using a read port.
    ///
    /// # Returns
    /// `false` if no port is free or the line is not ready.
    pub fn read(&mut self, addr: address, line: LineId, data: &mut [u8]) -> bool {
        if !self.read_ports.has_free(self.cycle) {
            self.port_busy(AccessKind::READ);
            return false;
        }
        if !self.cache.read(addr, line, data) {
            return false;
        }
        self.read_ports.start(self.cycle, data.len(), Transfer::Client)
    }

    /// Writes into a reserved line using a write port.
    ///
    /// # Returns
    /// `false` if no port is free or the line is not ready.
    pub fn write(
        &mut self,
        addr: address,
        line: LineId,
        data: &[u8],
        mask: Option<&ByteMask>,
    ) -> bool {
        if !self.write_ports.has_free(self.cycle) {
            self.port_busy(AccessKind::WRITE);
            return false;
        }
        if !self.cache.write(addr, line, data, mask) {
            return false;
        }
        self.write_ports.start(self.cycle, data.len(), Transfer::Client)
    }

    fn port_busy(&mut self, kind: AccessKind) {
        self.stats.cache.inc(
            kind,
            AccessStat::Status(stats::cache::RequestStatus::PORT_BUSY),
            1,
        );
    }

    pub fn unreserve(&mut self, line: LineId) {
        self.cache.unreserve(line);
    }

    /// Writes back every dirty line and invalidates the cache.
    ///
    /// # Returns
    /// `true` while the flush is in progress.
    pub fn flush(&mut self) -> bool {
        let cache_pending = self.cache.flush();
        cache_pending || !self.reads.is_empty() || !self.writes.is_empty() || self.bus.is_some()
    }

    /// Writes the block state table to `state_address`.
    ///
    /// # Returns
    /// `true` while the save is in progress.
    pub fn save_state(&mut self) -> bool {
        self.state_request(StateOp::SAVE)
    }

    /// Loads the block state table from `state_address`.
    ///
    /// # Returns
    /// `true` while the restore is in progress.
    pub fn restore_state(&mut self) -> bool {
        self.state_request(StateOp::RESTORE)
    }

    /// Sets every block to CLEAR, `blocks_per_cycle` blocks per cycle.
    ///
    /// # Returns
    /// `true` while the reset is in progress.
    pub fn reset_state(&mut self) -> bool {
        self.state_request(StateOp::RESET)
    }

    fn state_request(&mut self, op: StateOp) -> bool {
        match &self.state_machine {
            StateMachine::Running { op: running, .. } => {
                if *running != op {
                    log::trace!("{}: {:?} waits for {:?}", self.name, op, running);
                }
                true
            }
            StateMachine::Finished(finished) if *finished == op => {
                self.state_machine = StateMachine::Idle;
                false
            }
            StateMachine::Idle | StateMachine::Finished(_) => {
                let buffer = match op {
                    StateOp::SAVE => self.blocks.pack(self.config.state_table_bytes()),
                    StateOp::RESTORE => vec![0; self.config.state_table_bytes()],
                    StateOp::RESET => Vec::new(),
                };
                log::debug!(
                    "{}: start {:?} of {} blocks at {:#x}",
                    self.name,
                    op,
                    self.blocks.len(),
                    self.config.state_address
                );
                self.state_machine = StateMachine::Running {
                    op,
                    issued: 0,
                    done: 0,
                    buffer,
                };
                true
            }
        }
    }

    /// Switches to another render target buffer.
    ///
    /// The block state table is not touched, restore or reset it as needed.
    pub fn swap(&mut self, buffer_address: address) {
        log::debug!(
            "{}: swap buffer {:#x} => {:#x}",
            self.name,
            self.config.buffer_address,
            buffer_address
        );
        self.config.buffer_address = buffer_address;
    }

    pub fn set_bytes_per_pixel(&mut self, bytes_per_pixel: usize) -> Result<(), config::Error> {
        self.set_pixel_format(bytes_per_pixel, self.config.msaa_samples)
    }

    pub fn set_msaa_samples(&mut self, msaa_samples: usize) -> Result<(), config::Error> {
        self.set_pixel_format(self.config.bytes_per_pixel, msaa_samples)
    }

    fn set_pixel_format(&mut self, bytes_per_pixel: usize, msaa_samples: usize) -> Result<(), config::Error> {
        self.config.validate_pixel(bytes_per_pixel, msaa_samples)?;
        if self.config.clear_value.len() < bytes_per_pixel {
            return Err(config::Error::OutOfRange {
                component: "compressed cache",
                what: "clear value length",
                value: self.config.clear_value.len(),
                min: bytes_per_pixel,
                max: config::MAX_PIXEL_BYTES,
            });
        }
        self.config.bytes_per_pixel = bytes_per_pixel;
        self.config.msaa_samples = msaa_samples;
        let line_size = self.line_size();
        self.compressor = Compressor::new(line_size, bytes_per_pixel, msaa_samples);
        self.clear_pattern = clear_pattern(line_size, bytes_per_pixel, &self.config.clear_value);
        Ok(())
    }

    /// Enables or disables compression of spilled lines.
    ///
    /// Takes effect for every line not yet encoded, including spills
    /// waiting for the compressor.
    pub fn set_compression(&mut self, enabled: bool) {
        log::debug!("{}: compression={}", self.name, enabled);
        self.config.compression = enabled;
    }

    pub fn set_state_address(&mut self, state_address: address) {
        self.config.state_address = state_address;
    }

    pub fn set_clear_value(&mut self, clear_value: &[u8]) -> Result<(), config::Error> {
        if !(self.config.bytes_per_pixel..=config::MAX_PIXEL_BYTES).contains(&clear_value.len()) {
            return Err(config::Error::OutOfRange {
                component: "compressed cache",
                what: "clear value length",
                value: clear_value.len(),
                min: self.config.bytes_per_pixel,
                max: config::MAX_PIXEL_BYTES,
            });
        }
        self.config.clear_value = clear_value.to_vec();
        self.clear_pattern = clear_pattern(
            self.line_size(),
            self.config.bytes_per_pixel,
            clear_value,
        );
        Ok(())
    }

    /// Accepts a read reply from memory.
    pub fn receive(&mut self, fetch: MemFetch) {
        assert!(
            fetch.is_reply(),
            "{}: receive({fetch}) of a fetch that is not a read reply",
            self.name
        );
        assert!(
            self.tickets.is_in_flight(fetch.ticket),
            "{}: receive({fetch}) with a ticket that is not in flight",
            self.name
        );
        log::trace!("{}: received {}", self.name, fetch);
        self.replies.push_back(fetch);
    }

    // cycle

    /// Advances the cache by one cycle.
    ///
    /// # Returns
    /// The memory transaction issued this cycle, if any.
    pub fn cycle(&mut self, cycle: u64, mem_state: MemState) -> Option<MemFetch> {
        self.cycle = cycle;
        self.stats.sim.cycles += 1;

        self.cycle_ports(cycle);
        self.pull_request();
        self.cycle_bus(cycle);
        let issued = self.issue(cycle, mem_state);
        self.cycle_decompressor(cycle);
        self.cycle_compressor(cycle);
        self.cycle_state_machine();

        if self.bus.is_some() {
            self.stats.sim.bus_busy_cycles += 1;
        }
        debug_assert!(
            self.tickets_consistent(),
            "{}: ticket uses out of sync with {:?}",
            self.name,
            self.tickets
        );
        if let Some(fetch) = &issued {
            log::debug!("{}: cycle {} issue {}", self.name, cycle, fetch);
        }
        if log::log_enabled!(log::Level::Debug) && !(self.reads.is_empty() && self.writes.is_empty()) {
            let reads = self
                .reads
                .iter()
                .map(|(slot, entry)| format!("{slot}:{:#x}:{:?}", entry.addr(), entry.stage))
                .join(", ");
            let writes = self
                .writes
                .iter()
                .map(|(slot, entry)| format!("{slot}:{:#x}:{:?}", entry.addr(), entry.stage))
                .join(", ");
            log::debug!(
                "{}: cycle {} reads=[{}] writes=[{}] tickets={}/{}",
                self.name,
                cycle,
                style(&reads).cyan(),
                style(&writes).red(),
                self.tickets.in_flight(),
                self.tickets.capacity(),
            );
        }
        issued
    }

    /// Every in-flight ticket has a recorded use and no free ticket has one.
    fn tickets_consistent(&self) -> bool {
        let used = self.ticket_uses.iter().flatten().count();
        self.tickets.free() + self.tickets.in_flight() == self.tickets.capacity()
            && used == self.tickets.in_flight()
            && self
                .ticket_uses
                .iter()
                .enumerate()
                .all(|(i, used)| used.is_some() == self.tickets.is_in_flight(ticket::Ticket(i as u32)))
    }

    fn cycle_ports(&mut self, cycle: u64) {
        for transfer in self.write_ports.finish(cycle) {
            if let Transfer::LineWrite(slot) = transfer {
                self.finish_line_write(slot);
            }
        }
        for transfer in self.read_ports.finish(cycle) {
            if let Transfer::LineRead(slot) = transfer {
                self.finish_line_read(slot);
            }
        }
        let line_size = self.line_size();
        while self.read_ports.has_free(cycle) {
            let Some(slot) = self
                .writes
                .oldest(|entry| entry.stage == WriteStage::PENDING)
            else {
                break;
            };
            self.read_ports
                .start(cycle, line_size, Transfer::LineRead(slot));
            if let Some(entry) = self.writes.get_mut(slot) {
                entry.stage = WriteStage::READING;
            }
        }
    }

    fn finish_line_write(&mut self, slot: usize) {
        let Some(entry) = self.reads.remove(slot) else {
            panic!("{}: line write of unknown read entry {slot}", self.name);
        };
        self.cache.write_line(entry.request.line, &entry.data);
        self.cache.free_request(entry.request.id, false, true);
        log::debug!(
            "{}: filled {:#x} into {}",
            self.name,
            entry.addr(),
            entry.request.line
        );
    }

    fn finish_line_read(&mut self, slot: usize) {
        let Some(entry) = self.writes.get_mut(slot) else {
            panic!("{}: line read of unknown write entry {slot}", self.name);
        };
        let (data, mask) = self.cache.spill_line(&entry.request);
        entry.data = data;
        entry.mask = mask;
        entry.stage = WriteStage::COMPRESS;
        let id = entry.request.id;
        let read_link = entry.read_link.take();
        self.cache.free_request(id, true, false);
        if let Some(read) = read_link.and_then(|link| self.reads.get_mut(link)) {
            read.write_wait = false;
        }
        if !self.config.compression {
            self.encode_spill(slot);
        }
    }

    fn pull_request(&mut self) {
        let Some(request) = self.cache.peek_request() else {
            return;
        };
        let stall = (request.fill && self.reads.is_full())
            || (request.spill && self.writes.is_full())
            || (request.fill
                && self
                    .writes
                    .iter()
                    .any(|(_, entry)| entry.addr() == request.in_address));
        if stall {
            log::trace!("{}: stall on {}", self.name, request);
            self.stats.sim.request_stall_cycles += 1;
            return;
        }
        let Some(request) = self.cache.get_request() else {
            return;
        };
        log::debug!("{}: pull {}", self.name, request);
        let read_slot = if request.fill {
            self.start_fill(request.clone())
        } else {
            None
        };
        if request.spill {
            self.start_spill(request, read_slot);
        }
    }

    fn start_fill(&mut self, request: mshr::Request) -> Option<usize> {
        let addr = request.in_address;
        let state = self.block_state(addr);
        let size = match state {
            BlockState::CLEAR => {
                self.stats.traffic.clear_fills += 1;
                0
            }
            BlockState::UNCOMPRESSED => {
                self.stats.traffic.uncompressed_fills += 1;
                self.line_size()
            }
            BlockState::COMPRESSED(level) => {
                self.stats.traffic.compressed_fills[usize::from(level)] += 1;
                self.compressor.compressed_size(level)
            }
        };
        let entry = ReadEntry {
            write_wait: request.spill,
            block: self.block_index(addr),
            request,
            state,
            size,
            requested: 0,
            received: 0,
            data: vec![0; size],
            stage: if size == 0 {
                ReadStage::RECEIVED
            } else {
                ReadStage::FETCHING
            },
        };
        log::trace!("{}: fill {:#x} ({}, {} bytes)", self.name, addr, state, size);
        self.reads.insert(entry)
    }

    fn start_spill(&mut self, request: mshr::Request, read_link: Option<usize>) {
        let entry = WriteEntry {
            block: self.block_index(request.out_address),
            request,
            data: Vec::new(),
            mask: None,
            size: self.line_size(),
            issued: 0,
            acked: 0,
            read_link,
            stage: WriteStage::PENDING,
        };
        self.writes.insert(entry);
    }

    fn bus_cycles(&self, bytes: usize) -> u64 {
        bytes.div_ceil(self.config.bus_width).max(1) as u64
    }

    fn cycle_bus(&mut self, cycle: u64) {
        if self.bus.as_ref().is_some_and(|transfer| cycle >= transfer.until) {
            if let Some(transfer) = self.bus.take() {
                self.complete_transfer(transfer);
            }
        }
        if self.bus.is_none() {
            if let Some(reply) = self.replies.pop_front() {
                let until = cycle + self.bus_cycles(reply.data.len());
                self.bus = Some(BusTransfer {
                    ticket: reply.ticket,
                    until,
                    reply: Some(reply),
                });
            }
        }
    }

    fn complete_transfer(&mut self, transfer: BusTransfer) {
        let ticket = transfer.ticket;
        let Some(ticket_use) = self.ticket_uses[ticket.0 as usize].take() else {
            panic!("{}: bus transfer with unused {}", self.name, ticket);
        };
        self.tickets.release(ticket);

        match (ticket_use, transfer.reply) {
            (TicketUse::Fill { entry, offset, size }, Some(reply)) => {
                self.stats.traffic.bytes_read += size as u64;
                let compression = self.config.compression;
                let Some(read) = self.reads.get_mut(entry) else {
                    panic!("{}: reply {} for unknown read entry {entry}", self.name, reply);
                };
                read.data[offset..offset + size].copy_from_slice(&reply.data[..size]);
                read.received += size;
                if read.received == read.size {
                    // uncompressed lines skip the decompressor when compression is off
                    read.stage = if compression || read.state != BlockState::UNCOMPRESSED {
                        ReadStage::RECEIVED
                    } else {
                        ReadStage::DECOMPRESSED
                    };
                    log::trace!("{}: received {:#x}", self.name, read.addr());
                }
            }
            (TicketUse::RestoreState { offset, size }, Some(reply)) => {
                self.stats.traffic.bytes_read += size as u64;
                self.stats.traffic.state_bytes += size as u64;
                if let StateMachine::Running {
                    op: StateOp::RESTORE,
                    done,
                    buffer,
                    ..
                } = &mut self.state_machine
                {
                    buffer[offset..offset + size].copy_from_slice(&reply.data[..size]);
                    *done += size;
                }
            }
            (TicketUse::Spill { entry, size }, None) => {
                self.stats.traffic.bytes_written += size as u64;
                let Some(write) = self.writes.get_mut(entry) else {
                    panic!("{}: write data for unknown write entry {entry}", self.name);
                };
                write.acked += size;
                if write.acked == write.size {
                    log::trace!("{}: spilled {:#x}", self.name, write.addr());
                    self.writes.remove(entry);
                }
            }
            (TicketUse::SaveState { size }, None) => {
                self.stats.traffic.bytes_written += size as u64;
                self.stats.traffic.state_bytes += size as u64;
                if let StateMachine::Running {
                    op: StateOp::SAVE,
                    done,
                    ..
                } = &mut self.state_machine
                {
                    *done += size;
                }
            }
            (ticket_use, reply) => panic!(
                "{}: {} used for {:?} completed with reply {:?}",
                self.name, ticket, ticket_use, reply
            ),
        }
    }

    fn issue(&mut self, cycle: u64, mem_state: MemState) -> Option<MemFetch> {
        if self.bus.is_some() || !self.tickets.has_free() {
            return None;
        }
        if mem_state.accepts_reads() {
            if let Some(fetch) = self.issue_read() {
                return Some(fetch);
            }
        }
        if mem_state.accepts_writes() {
            return self.issue_write(cycle);
        }
        None
    }

    fn issue_read(&mut self) -> Option<MemFetch> {
        let max_size = self.config.max_transaction_size;
        if let StateMachine::Running {
            op: StateOp::RESTORE,
            issued,
            buffer,
            ..
        } = &mut self.state_machine
        {
            if *issued < buffer.len() {
                let ticket = self.tickets.acquire()?;
                let size = max_size.min(buffer.len() - *issued);
                let addr = self.config.state_address + *issued as u64;
                self.ticket_uses[ticket.0 as usize] = Some(TicketUse::RestoreState {
                    offset: *issued,
                    size,
                });
                *issued += size;
                self.stats.traffic.read_transactions += 1;
                return Some(MemFetch::read_request(
                    addr,
                    size as u32,
                    ticket,
                    Cookie::RestoreState,
                ));
            }
        }

        let slot = self
            .reads
            .oldest(|entry| entry.stage == ReadStage::FETCHING && entry.requested < entry.size)?;
        let entry = self.reads.get_mut(slot)?;
        let ticket = self.tickets.acquire()?;
        let size = max_size.min(entry.size - entry.requested);
        let addr = entry.addr() + entry.requested as u64;
        self.ticket_uses[ticket.0 as usize] = Some(TicketUse::Fill {
            entry: slot,
            offset: entry.requested,
            size,
        });
        entry.requested += size;
        self.stats.traffic.read_transactions += 1;
        Some(MemFetch::read_request(
            addr,
            size as u32,
            ticket,
            Cookie::Fill(slot),
        ))
    }

    fn issue_write(&mut self, cycle: u64) -> Option<MemFetch> {
        let max_size = self.config.max_transaction_size;
        let (fetch, size) = self.next_write(max_size)?;
        self.bus = Some(BusTransfer {
            ticket: fetch.ticket,
            until: cycle + self.bus_cycles(size),
            reply: None,
        });
        self.stats.traffic.write_transactions += 1;
        Some(fetch)
    }

    fn next_write(&mut self, max_size: usize) -> Option<(MemFetch, usize)> {
        if let StateMachine::Running {
            op: StateOp::SAVE,
            issued,
            buffer,
            ..
        } = &mut self.state_machine
        {
            if *issued < buffer.len() {
                let ticket = self.tickets.acquire()?;
                let size = max_size.min(buffer.len() - *issued);
                let addr = self.config.state_address + *issued as u64;
                let data = buffer[*issued..*issued + size].to_vec();
                self.ticket_uses[ticket.0 as usize] = Some(TicketUse::SaveState { size });
                *issued += size;
                let fetch = MemFetch::write_request(addr, data, None, ticket, Cookie::SaveState);
                return Some((fetch, size));
            }
        }

        let slot = self
            .writes
            .oldest(|entry| entry.stage == WriteStage::SPILLING && entry.issued < entry.size)?;
        let entry = self.writes.get_mut(slot)?;
        let ticket = self.tickets.acquire()?;
        let start = entry.issued;
        let size = max_size.min(entry.size - start);
        let data = entry.data[start..start + size].to_vec();
        let mask = entry
            .mask
            .as_ref()
            .map(|mask| mask[start..start + size].to_bitvec());
        self.ticket_uses[ticket.0 as usize] = Some(TicketUse::Spill { entry: slot, size });
        entry.issued += size;
        let fetch = MemFetch::write_request(
            entry.addr() + start as u64,
            data,
            mask,
            ticket,
            Cookie::Spill(slot),
        );
        Some((fetch, size))
    }

    fn cycle_decompressor(&mut self, cycle: u64) {
        self.finish_decompression(cycle);
        if self.decompressing.is_none() {
            if let Some(slot) = self
                .reads
                .oldest(|entry| entry.stage == ReadStage::RECEIVED)
            {
                if let Some(entry) = self.reads.get_mut(slot) {
                    entry.stage = ReadStage::DECOMPRESSING;
                }
                self.decompressing = Some((slot, cycle + self.config.decompressor_latency));
                self.finish_decompression(cycle);
            }
        }

        let line_size = self.line_size();
        while self.write_ports.has_free(cycle) {
            let writes = &self.writes;
            let Some(slot) = self.reads.oldest(|entry| {
                entry.stage == ReadStage::DECOMPRESSED
                    && !entry.write_wait
                    && !writes.iter().any(|(_, write)| write.addr() == entry.addr())
            }) else {
                break;
            };
            self.write_ports
                .start(cycle, line_size, Transfer::LineWrite(slot));
            if let Some(entry) = self.reads.get_mut(slot) {
                entry.stage = ReadStage::WRITING;
            }
        }
    }

    fn finish_decompression(&mut self, cycle: u64) {
        let Some((slot, until)) = self.decompressing else {
            return;
        };
        if cycle < until {
            return;
        }
        self.decompressing = None;
        let Some(entry) = self.reads.get_mut(slot) else {
            panic!("{}: decompression of unknown read entry {slot}", self.name);
        };
        entry.data = match entry.state {
            BlockState::CLEAR => self.clear_pattern.clone(),
            BlockState::UNCOMPRESSED => std::mem::take(&mut entry.data),
            BlockState::COMPRESSED(level) => self.compressor.decompress(&entry.data, level),
        };
        entry.stage = ReadStage::DECOMPRESSED;
        log::trace!(
            "{}: decompressed {:#x} ({})",
            self.name,
            entry.addr(),
            entry.state
        );
    }

    fn cycle_compressor(&mut self, cycle: u64) {
        self.finish_compression(cycle);
        if self.compressing.is_none() {
            if let Some(slot) = self
                .writes
                .oldest(|entry| entry.stage == WriteStage::COMPRESS)
            {
                if let Some(entry) = self.writes.get_mut(slot) {
                    entry.stage = WriteStage::COMPRESSING;
                }
                self.compressing = Some((slot, cycle + self.config.compressor_latency));
                self.finish_compression(cycle);
            }
        }
    }

    fn finish_compression(&mut self, cycle: u64) {
        let Some((slot, until)) = self.compressing else {
            return;
        };
        if cycle < until {
            return;
        }
        self.compressing = None;
        self.encode_spill(slot);
    }

    /// Chooses how a line read for spilling is written to memory and
    /// updates the state of its block.
    ///
    /// Lines are only compressed while compression is enabled.
    fn encode_spill(&mut self, slot: usize) {
        let compress = self.config.compression;
        let Some(entry) = self.writes.get_mut(slot) else {
            panic!("{}: spill of unknown write entry {slot}", self.name);
        };
        let mut data = std::mem::take(&mut entry.data);
        let mut mask = entry.mask.take().filter(|mask| !mask.all());

        if let Some(written) = &mask {
            match entry.block.map(|block| self.blocks.get(block)) {
                Some(BlockState::CLEAR) => {
                    for (i, byte) in data.iter_mut().enumerate() {
                        if !written[i] {
                            *byte = self.clear_pattern[i];
                        }
                    }
                    mask = None;
                }
                Some(BlockState::COMPRESSED(level)) => panic!(
                    "{}: partial spill of {:#x} into a block compressed at level {}",
                    self.name,
                    entry.addr(),
                    level
                ),
                Some(BlockState::UNCOMPRESSED) | None => {}
            }
        }

        let compressed = if compress && mask.is_none() && entry.block.is_some() {
            self.compressor.compress(&data)
        } else {
            None
        };
        let state = match compressed {
            Some((level, bytes)) => {
                data = bytes;
                BlockState::COMPRESSED(level)
            }
            None => BlockState::UNCOMPRESSED,
        };
        entry.size = data.len();
        entry.data = data;
        entry.mask = mask;
        entry.stage = WriteStage::SPILLING;
        log::trace!(
            "{}: spill {:#x} as {} ({} bytes, masked={})",
            self.name,
            entry.addr(),
            state,
            entry.size,
            entry.mask.is_some()
        );

        if let Some(block) = entry.block {
            self.blocks.set(block, state);
        }
        match state {
            BlockState::COMPRESSED(level) => {
                self.stats.traffic.compressed_spills[usize::from(level)] += 1;
            }
            _ => self.stats.traffic.uncompressed_spills += 1,
        }
    }

    fn cycle_state_machine(&mut self) {
        let blocks_per_cycle = self.config.blocks_per_cycle;
        let StateMachine::Running {
            op,
            issued,
            done,
            buffer,
        } = &mut self.state_machine
        else {
            return;
        };
        let finished = match op {
            StateOp::RESET => {
                self.blocks
                    .fill(*issued..*issued + blocks_per_cycle, BlockState::CLEAR);
                *issued += blocks_per_cycle;
                *issued >= self.blocks.len()
            }
            StateOp::SAVE => *done >= buffer.len(),
            StateOp::RESTORE => {
                if *done >= buffer.len() {
                    self.blocks.unpack(buffer);
                    true
                } else {
                    false
                }
            }
        };
        if finished {
            let op = *op;
            log::debug!("{}: {:?} finished at cycle {}", self.name, op, self.cycle);
            self.state_machine = StateMachine::Finished(op);
        }
    }
}

impl std::fmt::Display for CompressedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}[reads={}/{} writes={}/{} requests={} tickets={}]",
            self.name,
            self.reads.len(),
            self.config.input_buffers,
            self.writes.len(),
            self.config.output_buffers,
            self.cache.num_requests(),
            self.tickets.in_flight()
        )
    }
}
