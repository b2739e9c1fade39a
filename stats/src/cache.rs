use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;

/// Kind of a client access to the cache.
#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum AccessKind {
    FETCH,
    ALLOCATE,
    READ,
    WRITE,
}

#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum RequestStatus {
    HIT = 0,
    MISS,
    /// read or write to a line that is not resident yet
    NOT_READY,
    /// read or write rejected because every port was busy
    PORT_BUSY,
}

#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
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

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessStat {
    ReservationFailure(ReservationFailure),
    Status(RequestStatus),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    #[serde(with = "accesses")]
    pub accesses: HashMap<(AccessKind, AccessStat), usize>,
}

/// JSON object keys must be strings, so the access map is stored as a list of rows.
mod accesses {
    use super::{AccessKind, AccessStat};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(
        accesses: &HashMap<(AccessKind, AccessStat), usize>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut rows: Vec<_> = accesses.iter().map(|(k, v)| (*k, *v)).collect();
        rows.sort_by_key(|(access, _)| *access);
        rows.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<HashMap<(AccessKind, AccessStat), usize>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let rows: Vec<((AccessKind, AccessStat), usize)> = Vec::deserialize(deserializer)?;
        Ok(rows.into_iter().collect())
    }
}

impl Cache {
    pub fn inc(&mut self, kind: AccessKind, stat: AccessStat, count: usize) {
        *self.accesses.entry((kind, stat)).or_insert(0) += count;
    }

    #[must_use]
    pub fn get(&self, kind: AccessKind, stat: AccessStat) -> usize {
        self.accesses.get(&(kind, stat)).copied().unwrap_or(0)
    }

    pub fn shave(&mut self) {
        self.accesses.retain(|_, v| *v > 0);
    }

    #[must_use]
    pub fn total_accesses(&self) -> usize {
        self.accesses
            .iter()
            .filter(|((_, stat), _)| {
                matches!(
                    stat,
                    AccessStat::Status(RequestStatus::HIT | RequestStatus::MISS)
                )
            })
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits: usize = AccessKind::iter()
            .map(|kind| self.get(kind, AccessStat::Status(RequestStatus::HIT)))
            .sum();
        let total = self.total_accesses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        for (k, v) in other.accesses {
            *self.accesses.entry(k).or_insert(0) += v;
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        let mut accesses = HashMap::new();
        for access_kind in AccessKind::iter() {
            for status in RequestStatus::iter() {
                accesses.insert((access_kind, AccessStat::Status(status)), 0);
            }
            for failure in ReservationFailure::iter() {
                accesses.insert((access_kind, AccessStat::ReservationFailure(failure)), 0);
            }
        }
        Self { accesses }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut accesses: Vec<_> = self
            .accesses
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|((access_kind, access_stat), count)| {
                let key = match access_stat {
                    AccessStat::Status(status) => {
                        format!("{access_kind:?}[{status:?}]")
                    }
                    AccessStat::ReservationFailure(failure) => {
                        format!("{access_kind:?}[{failure:?}]")
                    }
                };
                (key, count)
            })
            .collect();
        accesses.sort_by_key(|(key, _)| key.clone());

        let mut out = f.debug_struct("CacheStats");
        for (key, count) in accesses {
            out.field(&key, count);
        }
        out.finish_non_exhaustive()
    }
}
