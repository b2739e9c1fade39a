use std::collections::VecDeque;

/// Bounded first in, first out queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fifo<T> {
    inner: VecDeque<T>,
    max_size: Option<usize>,
}

impl<T> Fifo<T> {
    #[must_use]
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            inner: max_size.map_or_else(VecDeque::new, VecDeque::with_capacity),
            max_size,
        }
    }

    pub fn enqueue(&mut self, value: T) {
        debug_assert!(!self.full(), "fifo: enqueue into full queue");
        self.inner.push_back(value);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.inner.front()
    }

    #[must_use]
    pub fn full(&self) -> bool {
        match self.max_size {
            Some(max) => self.inner.len() >= max,
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<T> Fifo<T>
where
    T: PartialEq,
{
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.inner.contains(value)
    }
}
