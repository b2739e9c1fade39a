pub mod block;
pub mod config;
pub mod replacement;
pub mod reservation;

pub use reservation::ReservationCache;

/// Coordinates of a cache line.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LineId {
    pub way: usize,
    pub set: usize,
}

impl LineId {
    #[must_use]
    pub fn new(way: usize, set: usize) -> Self {
        Self { way, set }
    }
}

impl std::fmt::Display for LineId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "(way={}, set={})", self.way, self.set)
    }
}

/// Reason a reservation could not be made this cycle.
///
/// All failures are backpressure: no state was changed and the
/// caller is expected to retry on a later cycle.
#[derive(Debug, strum::EnumIter, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ReservationFailure {
    /// all lines in the set are reserved
    LINE_ALLOC_FAIL = 0,
    /// outstanding request pool is exhausted
    REQUEST_QUEUE_FULL,
    /// line already has a request outstanding
    LINE_REPLACING,
    /// a spill of the same block is still in flight
    SPILL_PENDING,
}

impl std::fmt::Display for ReservationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl From<ReservationFailure> for stats::cache::ReservationFailure {
    fn from(failure: ReservationFailure) -> Self {
        match failure {
            ReservationFailure::LINE_ALLOC_FAIL => Self::LINE_ALLOC_FAIL,
            ReservationFailure::REQUEST_QUEUE_FULL => Self::REQUEST_QUEUE_FULL,
            ReservationFailure::LINE_REPLACING => Self::LINE_REPLACING,
            ReservationFailure::SPILL_PENDING => Self::SPILL_PENDING,
        }
    }
}

/// Outcome of a successful reservation.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RequestStatus {
    HIT,
    MISS,
}

impl From<RequestStatus> for stats::cache::RequestStatus {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::HIT => Self::HIT,
            RequestStatus::MISS => Self::MISS,
        }
    }
}
