use super::{block, LineId, RequestStatus, ReservationFailure};
use crate::{address, config, mem_fetch::ByteMask, mshr, tag_array::TagArray};
use stats::cache::{AccessKind, AccessStat};
use std::collections::VecDeque;

/// Number of recently accessed ways per set protected from replacement.
pub const MAX_RECENT_ACCESSES: usize = 4;

/// Reservation based fetch cache.
///
/// Turns the synchronous tag array into an asynchronous cache: clients
/// reserve lines with [`ReservationCache::fetch`] or
/// [`ReservationCache::allocate`], which queue fill and spill requests.
/// The owner of the cache drains the requests, moves the data, and frees
/// them again with [`ReservationCache::free_request`]. Reads and writes
/// succeed only once the line is resident and each releases one
/// reservation.
#[derive(Debug)]
pub struct ReservationCache {
    pub name: String,
    tag_array: TagArray,
    lines: Vec<block::Line>,
    requests: mshr::Table,
    /// recently accessed ways per set, oldest first
    recent: Vec<VecDeque<usize>>,
    window: usize,
    pub stats: stats::Cache,
}

impl ReservationCache {
    pub fn new(
        name: impl Into<String>,
        config: &config::Cache,
        num_requests: usize,
    ) -> Result<Self, config::Error> {
        let tag_array = TagArray::new(config)?;
        if num_requests == 0 {
            return Err(config::Error::Zero {
                component: "reservation cache",
                what: "number of requests",
            });
        }
        let line_size = tag_array.line_size();
        let total_lines = tag_array.cache_config.total_lines;
        let num_sets = tag_array.num_sets();
        let window = tag_array.ways().min(MAX_RECENT_ACCESSES);
        Ok(Self {
            name: name.into(),
            lines: vec![block::Line::new(line_size); total_lines],
            requests: mshr::Table::new(num_requests),
            recent: vec![VecDeque::with_capacity(window); num_sets],
            window,
            tag_array,
            stats: stats::Cache::default(),
        })
    }

    #[inline]
    #[must_use]
    pub fn line_size(&self) -> usize {
        self.tag_array.line_size()
    }

    #[inline]
    #[must_use]
    pub fn ways(&self) -> usize {
        self.tag_array.ways()
    }

    #[inline]
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.tag_array.num_sets()
    }

    /// Address of the first byte of the line holding `addr`.
    #[inline]
    #[must_use]
    pub fn line_addr_of(&self, addr: address) -> address {
        self.tag_array.cache_config.line_addr(addr)
    }

    /// Address currently held by `line`.
    #[must_use]
    pub fn line_addr(&self, line: LineId) -> address {
        self.tag_array.line_addr(line)
    }

    #[inline]
    fn index(&self, line: LineId) -> usize {
        line.way * self.num_sets() + line.set
    }

    #[must_use]
    pub fn line(&self, line: LineId) -> &block::Line {
        &self.lines[self.index(line)]
    }

    #[must_use]
    pub fn status(&self, line: LineId) -> block::Status {
        self.line(line).status(self.tag_array.is_valid(line))
    }

    /// Searches for the line holding `addr` without reserving it.
    #[must_use]
    pub fn lookup(&self, addr: address) -> Option<LineId> {
        self.tag_array.search(addr)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn requests_full(&self) -> bool {
        self.requests.full()
    }

    fn touch(&mut self, line: LineId) {
        self.tag_array.touch(line);
        let recent = &mut self.recent[line.set];
        recent.retain(|&way| way != line.way);
        recent.push_back(line.way);
        while recent.len() > self.window {
            recent.pop_front();
        }
    }

    fn reserve(&mut self, line: LineId, reserves: u32) {
        let idx = self.index(line);
        self.lines[idx].reserve(reserves);
        self.touch(line);
    }

    fn record<T>(&mut self, kind: AccessKind, result: &Result<(T, RequestStatus), ReservationFailure>) {
        let stat = match result {
            Ok((_, status)) => AccessStat::Status((*status).into()),
            Err(failure) => AccessStat::ReservationFailure((*failure).into()),
        };
        self.stats.inc(kind, stat, 1);
    }

    /// Selects the way of `set` to replace.
    ///
    /// Only unreserved lines without an outstanding request are eligible.
    /// Invalid lines are used first, then lines that were not accessed
    /// recently (the replacement policy's choice if it is one of them),
    /// then the oldest of the recently accessed lines.
    ///
    /// # Returns
    /// `None` when every line of the set is reserved or replacing.
    #[must_use]
    pub fn next_victim(&self, set: usize) -> Option<usize> {
        let eligible = |way: usize| self.lines[self.index(LineId::new(way, set))].is_evictable();
        let ways = self.ways();

        if let Some(way) =
            (0..ways).find(|&way| eligible(way) && !self.tag_array.is_valid(LineId::new(way, set)))
        {
            return Some(way);
        }

        let recent = &self.recent[set];
        let not_recent = |way: usize| eligible(way) && !recent.contains(&way);
        if let Some(way) = self.tag_array.policy_victim(set).filter(|&way| not_recent(way)) {
            return Some(way);
        }
        if let Some(way) = (0..ways).find(|&way| not_recent(way)) {
            return Some(way);
        }
        recent.iter().copied().find(|&way| eligible(way))
    }

    /// Reserves the line for `addr`, loading it from memory on a miss.
    pub fn fetch(
        &mut self,
        addr: address,
        reserves: u32,
        source: u64,
    ) -> Result<LineId, ReservationFailure> {
        let result = self.try_fetch(addr, reserves, source);
        log::trace!(
            "{}::fetch({:#x}, reserves={}) => {:?}",
            self.name,
            addr,
            reserves,
            result
        );
        self.record(AccessKind::FETCH, &result);
        result.map(|(line, _)| line)
    }

    fn try_fetch(
        &mut self,
        addr: address,
        reserves: u32,
        source: u64,
    ) -> Result<(LineId, RequestStatus), ReservationFailure> {
        let line_addr = self.line_addr_of(addr);

        if let Some(line) = self.tag_array.search(addr) {
            let idx = self.index(line);
            let state = &self.lines[idx];
            if !state.masked || (!state.replacing && state.is_fully_written()) {
                self.reserve(line, reserves);
                return Ok((line, RequestStatus::HIT));
            }
            // write buffer line: load the bytes not written yet
            if state.replacing {
                return Err(ReservationFailure::LINE_REPLACING);
            }
            self.requests
                .add(line, line_addr, 0, false, true, true, source)
                .ok_or(ReservationFailure::REQUEST_QUEUE_FULL)?;
            self.lines[idx].replacing = true;
            self.reserve(line, reserves);
            return Ok((line, RequestStatus::MISS));
        }

        if self.requests.full() {
            return Err(ReservationFailure::REQUEST_QUEUE_FULL);
        }
        let set = self.tag_array.cache_config.set_index(addr);
        let way = self
            .next_victim(set)
            .ok_or(ReservationFailure::LINE_ALLOC_FAIL)?;
        let victim = LineId::new(way, set);
        let idx = self.index(victim);
        let spill = self.tag_array.is_valid(victim) && self.lines[idx].dirty;
        let out_address = if spill {
            self.tag_array.line_addr(victim)
        } else {
            0
        };
        // the spill keeps the write mask of the evicted line
        let spill_masked = spill && self.lines[idx].masked;
        self.requests
            .add(victim, line_addr, out_address, spill, true, spill_masked, source)
            .ok_or(ReservationFailure::REQUEST_QUEUE_FULL)?;

        self.tag_array.replace(line_addr, way, None);
        let state = &mut self.lines[idx];
        state.dirty = false;
        state.masked = false;
        state.replacing = true;
        if !spill {
            state.clear_mask();
        }
        self.reserve(victim, reserves);
        Ok((victim, RequestStatus::MISS))
    }

    /// Reserves a line for `addr` that will be completely overwritten.
    ///
    /// No data is loaded: the line becomes a write buffer line that can
    /// only be read once every byte has been written.
    pub fn allocate(
        &mut self,
        addr: address,
        reserves: u32,
        source: u64,
    ) -> Result<LineId, ReservationFailure> {
        let result = self.try_allocate(addr, reserves, source);
        log::trace!(
            "{}::allocate({:#x}, reserves={}) => {:?}",
            self.name,
            addr,
            reserves,
            result
        );
        self.record(AccessKind::ALLOCATE, &result);
        result.map(|(line, _)| line)
    }

    fn try_allocate(
        &mut self,
        addr: address,
        reserves: u32,
        source: u64,
    ) -> Result<(LineId, RequestStatus), ReservationFailure> {
        if let Some(line) = self.tag_array.search(addr) {
            self.reserve(line, reserves);
            return Ok((line, RequestStatus::HIT));
        }

        let line_addr = self.line_addr_of(addr);
        let set = self.tag_array.cache_config.set_index(addr);
        let way = self
            .next_victim(set)
            .ok_or(ReservationFailure::LINE_ALLOC_FAIL)?;
        let victim = LineId::new(way, set);
        let idx = self.index(victim);

        let spill = self.tag_array.is_valid(victim) && self.lines[idx].dirty;
        if spill {
            let out_address = self.tag_array.line_addr(victim);
            let spill_masked = self.lines[idx].masked;
            self.requests
                .add(victim, line_addr, out_address, true, false, spill_masked, source)
                .ok_or(ReservationFailure::REQUEST_QUEUE_FULL)?;
        }

        self.tag_array.replace(line_addr, way, None);
        let state = &mut self.lines[idx];
        state.dirty = false;
        state.masked = true;
        state.replacing = spill;
        if !spill {
            // the mask of a spilled line is cleared once the request is freed
            state.clear_mask();
        }
        self.reserve(victim, reserves);
        Ok((victim, RequestStatus::MISS))
    }

    fn check_access(&self, call: &str, addr: address, line: LineId, size: usize) -> usize {
        assert!(
            self.tag_array.holds(line, addr),
            "{}: {call}({addr:#x}) from line {line} which does not hold it",
            self.name
        );
        let offset = self.tag_array.cache_config.offset(addr);
        assert!(
            offset + size <= self.line_size(),
            "{}: {call}({addr:#x}) of {size} bytes crosses the end of the line",
            self.name
        );
        offset
    }

    /// Reads `data.len()` bytes at `addr` from a reserved line.
    ///
    /// # Returns
    /// `false` while the line data is not available.
    pub fn read(&mut self, addr: address, line: LineId, data: &mut [u8]) -> bool {
        let offset = self.check_access("read", addr, line, data.len());
        let idx = self.index(line);
        if !self.lines[idx].is_readable() {
            self.stats.inc(
                AccessKind::READ,
                AccessStat::Status(stats::cache::RequestStatus::NOT_READY),
                1,
            );
            return false;
        }
        let size = data.len();
        data.copy_from_slice(&self.tag_array.line(line)[offset..offset + size]);
        self.lines[idx].release();
        self.touch(line);
        self.stats.inc(
            AccessKind::READ,
            AccessStat::Status(stats::cache::RequestStatus::HIT),
            1,
        );
        true
    }

    /// Writes `data` at `addr` into a reserved line.
    ///
    /// Only the bytes enabled in `mask` are written.
    ///
    /// # Returns
    /// `false` while the line has a request outstanding.
    pub fn write(
        &mut self,
        addr: address,
        line: LineId,
        data: &[u8],
        mask: Option<&ByteMask>,
    ) -> bool {
        let offset = self.check_access("write", addr, line, data.len());
        if let Some(mask) = mask {
            assert!(
                mask.len() >= data.len(),
                "{}: write({addr:#x}) mask shorter than data",
                self.name
            );
        }
        let idx = self.index(line);
        if self.lines[idx].replacing {
            self.stats.inc(
                AccessKind::WRITE,
                AccessStat::Status(stats::cache::RequestStatus::NOT_READY),
                1,
            );
            return false;
        }

        let bytes = &mut self.tag_array.line_mut(line)[offset..offset + data.len()];
        match mask {
            Some(mask) => {
                for (i, (dest, src)) in bytes.iter_mut().zip(data).enumerate() {
                    if mask[i] {
                        *dest = *src;
                    }
                }
            }
            None => bytes.copy_from_slice(data),
        }

        let state = &mut self.lines[idx];
        if state.masked {
            let written = state.mark_written(offset, data.len(), mask);
            state.dirty |= written > 0;
        } else {
            state.dirty = true;
        }
        state.release();
        self.touch(line);
        self.stats.inc(
            AccessKind::WRITE,
            AccessStat::Status(stats::cache::RequestStatus::HIT),
            1,
        );
        true
    }

    /// Releases a reservation without accessing the line.
    pub fn unreserve(&mut self, line: LineId) {
        let idx = self.index(line);
        self.lines[idx].release();
    }

    /// Peeks at the next request to process.
    #[must_use]
    pub fn peek_request(&self) -> Option<&mshr::Request> {
        self.requests.peek_request()
    }

    /// Takes the next request to process, in creation order.
    pub fn get_request(&mut self) -> Option<mshr::Request> {
        self.requests.next_request()
    }

    /// Marks the spill and/or fill half of a request as completed.
    ///
    /// Once both halves are completed the line is usable again.
    pub fn free_request(&mut self, id: usize, free_spill: bool, free_fill: bool) {
        let masked_fill = free_fill && self.requests.get(id).is_some_and(|r| r.masked && r.fill);
        let Some(request) = self.requests.free(id, free_spill, free_fill) else {
            return;
        };
        let idx = self.index(request.line);
        let state = &mut self.lines[idx];
        state.replacing = false;
        if masked_fill {
            state.masked = false;
        }
        state.clear_mask();
        log::trace!(
            "{}::free_request({}) {} => {}",
            self.name,
            id,
            request.line,
            state
        );
    }

    /// Whether any outstanding request still has to spill `addr`.
    #[must_use]
    pub fn has_pending_spill(&self, addr: address) -> bool {
        let line_addr = self.line_addr_of(addr);
        self.requests
            .iter()
            .any(|request| request.spill && request.out_address == line_addr)
    }

    /// Copies the line data, with the written byte mask of write buffer lines.
    #[must_use]
    pub fn read_line(&self, line: LineId) -> (Vec<u8>, Option<ByteMask>) {
        let state = self.line(line);
        let mask = state.masked.then(|| state.mask.clone());
        (self.tag_array.line(line).to_vec(), mask)
    }

    /// Copies the line data to be spilled by `request`.
    ///
    /// Masked spills carry the write mask of the evicted line.
    #[must_use]
    pub fn spill_line(&self, request: &mshr::Request) -> (Vec<u8>, Option<ByteMask>) {
        debug_assert!(request.spill, "{}: spill_line({request}) without spill", self.name);
        let mask = request
            .masked
            .then(|| self.line(request.line).mask.clone());
        (self.tag_array.line(request.line).to_vec(), mask)
    }

    /// Writes the line data, keeping bytes already written by clients.
    pub fn write_line(&mut self, line: LineId, data: &[u8]) {
        assert_eq!(
            data.len(),
            self.line_size(),
            "{}: write_line({line}) of a partial line",
            self.name
        );
        let idx = self.index(line);
        let bytes = self.tag_array.line_mut(line);
        let state = &mut self.lines[idx];
        if state.masked {
            for (i, (dest, src)) in bytes.iter_mut().zip(data).enumerate() {
                if !state.mask[i] {
                    *dest = *src;
                }
            }
            state.mask.fill(true);
        } else {
            bytes.copy_from_slice(data);
        }
    }

    /// Writes back every dirty line and invalidates the cache.
    ///
    /// Queues spill requests for dirty lines that are neither reserved
    /// nor replacing, as long as there are free request slots.
    ///
    /// # Returns
    /// `true` while the flush is still in progress.
    pub fn flush(&mut self) -> bool {
        let mut pending = false;
        for set in 0..self.num_sets() {
            for way in 0..self.ways() {
                let line = LineId::new(way, set);
                let idx = self.index(line);
                let state = &self.lines[idx];
                if !self.tag_array.is_valid(line) {
                    continue;
                }
                if state.reserves > 0 || state.replacing {
                    pending = true;
                    continue;
                }
                if !state.dirty {
                    continue;
                }
                pending = true;
                let line_addr = self.tag_array.line_addr(line);
                let masked = state.masked;
                if self
                    .requests
                    .add(line, line_addr, line_addr, true, false, masked, 0)
                    .is_none()
                {
                    continue;
                }
                let state = &mut self.lines[idx];
                state.dirty = false;
                state.replacing = true;
            }
        }
        if pending || !self.requests.is_empty() {
            return true;
        }
        log::debug!("{}: flushed", self.name);
        self.tag_array.invalidate();
        for state in &mut self.lines {
            state.reset();
        }
        for recent in &mut self.recent {
            recent.clear();
        }
        false
    }

    /// Invalidates every line and drops all requests.
    pub fn reset(&mut self) {
        self.tag_array.reset();
        for state in &mut self.lines {
            state.reset();
        }
        for recent in &mut self.recent {
            recent.clear();
        }
        self.requests.clear();
    }
}
