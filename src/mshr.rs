use super::{address, cache::LineId, fifo::Fifo};

/// A pending fill and/or spill of one cache line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub id: usize,
    /// address of the line to load (new tag)
    pub in_address: address,
    /// address of the line to evict (old tag)
    pub out_address: address,
    pub line: LineId,
    /// spill half still pending
    pub spill: bool,
    /// fill half still pending
    pub fill: bool,
    /// the line is a write buffer line
    pub masked: bool,
    /// opaque identifier of the requester, for tracing
    pub source: u64,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Request#{}[{}", self.id, self.line)?;
        if self.spill {
            write!(f, " spill={:#x}", self.out_address)?;
        }
        if self.fill {
            write!(f, " fill={:#x}", self.in_address)?;
        }
        if self.masked {
            write!(f, " masked")?;
        }
        write!(f, "]")
    }
}

/// Pool of outstanding memory requests.
///
/// Requests are created together with the reservation of their line,
/// handed out in creation order by [`Table::next_request`], and freed one
/// half at a time as the fill and spill transfers complete.
#[derive(Debug)]
pub struct Table {
    entries: Vec<Option<Request>>,
    free: Fifo<usize>,
    /// requests not yet handed out, in creation order
    queued: Fifo<usize>,
}

impl Table {
    #[must_use]
    pub fn new(num_entries: usize) -> Self {
        let mut free = Fifo::new(Some(num_entries));
        for id in 0..num_entries {
            free.enqueue(id);
        }
        Self {
            entries: vec![None; num_entries],
            free,
            queued: Fifo::new(Some(num_entries)),
        }
    }

    /// No space for tracking a new request.
    #[must_use]
    pub fn full(&self) -> bool {
        self.free.is_empty()
    }

    /// Number of outstanding (queued or handed out) requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, id: usize) -> Option<&Request> {
        self.entries.get(id).and_then(Option::as_ref)
    }

    /// Iterates over all outstanding requests.
    pub fn iter(&self) -> impl Iterator<Item = &Request> + '_ {
        self.entries.iter().flatten()
    }

    /// Adds a request.
    ///
    /// # Returns
    /// The request id or `None` when the table is full.
    pub fn add(
        &mut self,
        line: LineId,
        in_address: address,
        out_address: address,
        spill: bool,
        fill: bool,
        masked: bool,
        source: u64,
    ) -> Option<usize> {
        debug_assert!(spill || fill, "mshr: request without spill or fill");
        let id = self.free.dequeue()?;
        let request = Request {
            id,
            in_address,
            out_address,
            line,
            spill,
            fill,
            masked,
            source,
        };
        log::trace!("mshr::add({request})");
        self.entries[id] = Some(request);
        self.queued.enqueue(id);
        Some(id)
    }

    /// Peeks at the next request to hand out.
    #[must_use]
    pub fn peek_request(&self) -> Option<&Request> {
        self.queued.first().and_then(|&id| self.get(id))
    }

    /// Hands out the next request.
    pub fn next_request(&mut self) -> Option<Request> {
        let id = self.queued.dequeue()?;
        self.get(id).cloned()
    }

    /// Frees the halves of a request whose transfers completed.
    ///
    /// # Returns
    /// The request once both halves are done.
    pub fn free(&mut self, id: usize, free_spill: bool, free_fill: bool) -> Option<Request> {
        let Some(request) = self.entries.get_mut(id).and_then(Option::as_mut) else {
            panic!("mshr: freeing request {id} which is not outstanding");
        };
        assert!(
            !free_spill || request.spill,
            "mshr: spill of {request} was already freed"
        );
        assert!(
            !free_fill || request.fill,
            "mshr: fill of {request} was already freed"
        );
        debug_assert!(
            !self.queued.contains(&id),
            "mshr: freeing {request} before it was handed out"
        );
        request.spill &= !free_spill;
        request.fill &= !free_fill;
        log::trace!(
            "mshr::free({}, spill={}, fill={}) => {}",
            id,
            free_spill,
            free_fill,
            request
        );

        if request.spill || request.fill {
            return None;
        }
        let done = self.entries[id].take();
        self.free.enqueue(id);
        done
    }

    /// Drops all requests.
    pub fn clear(&mut self) {
        self.entries.fill(None);
        self.queued.clear();
        self.free.clear();
        for id in 0..self.entries.len() {
            self.free.enqueue(id);
        }
    }
}
