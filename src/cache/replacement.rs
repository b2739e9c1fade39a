//! Cache replacement policies.
//!
//! A policy tracks usage per set and names the way to evict when no
//! invalid line is available. Policies are selected once at construction.

use super::config::ReplacementPolicy as Kind;

pub trait ReplacementPolicy: std::fmt::Debug + Send + Sync + 'static {
    /// A resident line was accessed.
    fn touch(&mut self, set: usize, way: usize);

    /// A new line was installed.
    fn install(&mut self, set: usize, way: usize);

    /// The way to evict from `set`.
    #[must_use]
    fn victim(&self, set: usize) -> usize;

    /// Forget all usage information.
    fn reset(&mut self);
}

/// Builds the policy for the given geometry.
///
/// Returns `None` for [`Kind::NONE`].
#[must_use]
pub fn build(kind: Kind, num_sets: usize, ways: usize) -> Option<Box<dyn ReplacementPolicy>> {
    match kind {
        Kind::LRU => Some(Box::new(Lru::new(num_sets, ways))),
        Kind::PSEUDO_LRU => Some(Box::new(PseudoLru::new(num_sets, ways))),
        Kind::FIFO => Some(Box::new(Fifo::new(num_sets, ways))),
        Kind::NONE => None,
    }
}

/// Least recently used.
///
/// Keeps a usage stack per set, most recently used way first.
#[derive(Debug, Clone)]
pub struct Lru {
    usage: Vec<Vec<usize>>,
    ways: usize,
}

impl Lru {
    #[must_use]
    pub fn new(num_sets: usize, ways: usize) -> Self {
        Self {
            usage: (0..num_sets).map(|_| (0..ways).collect()).collect(),
            ways,
        }
    }

    fn promote(&mut self, set: usize, way: usize) {
        let stack = &mut self.usage[set];
        if let Some(pos) = stack.iter().position(|&w| w == way) {
            stack.remove(pos);
        }
        stack.insert(0, way);
    }
}

impl ReplacementPolicy for Lru {
    fn touch(&mut self, set: usize, way: usize) {
        self.promote(set, way);
    }

    fn install(&mut self, set: usize, way: usize) {
        self.promote(set, way);
    }

    fn victim(&self, set: usize) -> usize {
        self.usage[set].last().copied().unwrap_or(0)
    }

    fn reset(&mut self) {
        let ways = self.ways;
        for stack in &mut self.usage {
            *stack = (0..ways).collect();
        }
    }
}

/// Tree based pseudo least recently used.
///
/// One bit per inner node of a binary tree over the ways (`ways - 1` bits
/// per set). A bit set to 1 means the next victim is in the right subtree.
#[derive(Debug, Clone)]
pub struct PseudoLru {
    tree: Vec<u64>,
    ways: usize,
}

impl PseudoLru {
    #[must_use]
    pub fn new(num_sets: usize, ways: usize) -> Self {
        assert!(
            ways.is_power_of_two() && ways <= 64,
            "pseudo lru: unsupported number of ways {ways}"
        );
        Self {
            tree: vec![0; num_sets],
            ways,
        }
    }

    fn point_away(&mut self, set: usize, way: usize) {
        let bits = &mut self.tree[set];
        let mut node = 0;
        let mut lo = 0;
        let mut hi = self.ways;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if way < mid {
                // accessed the left half, next victim on the right
                *bits |= 1 << node;
                node = 2 * node + 1;
                hi = mid;
            } else {
                *bits &= !(1 << node);
                node = 2 * node + 2;
                lo = mid;
            }
        }
    }
}

impl ReplacementPolicy for PseudoLru {
    fn touch(&mut self, set: usize, way: usize) {
        self.point_away(set, way);
    }

    fn install(&mut self, set: usize, way: usize) {
        self.point_away(set, way);
    }

    fn victim(&self, set: usize) -> usize {
        let bits = self.tree[set];
        let mut node = 0;
        let mut lo = 0;
        let mut hi = self.ways;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if bits & (1 << node) == 0 {
                node = 2 * node + 1;
                hi = mid;
            } else {
                node = 2 * node + 2;
                lo = mid;
            }
        }
        lo
    }

    fn reset(&mut self) {
        self.tree.fill(0);
    }
}

/// First in, first out.
///
/// Accesses do not change the order, only installs do.
#[derive(Debug, Clone)]
pub struct Fifo {
    next_way: Vec<usize>,
    ways: usize,
}

impl Fifo {
    #[must_use]
    pub fn new(num_sets: usize, ways: usize) -> Self {
        Self {
            next_way: vec![0; num_sets],
            ways,
        }
    }
}

impl ReplacementPolicy for Fifo {
    fn touch(&mut self, _set: usize, _way: usize) {}

    fn install(&mut self, set: usize, way: usize) {
        if self.next_way[set] == way {
            self.next_way[set] = (way + 1) % self.ways;
        }
    }

    fn victim(&self, set: usize) -> usize {
        self.next_way[set]
    }

    fn reset(&mut self) {
        self.next_way.fill(0);
    }
}
