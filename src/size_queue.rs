//! FIFO queue of weighted values.

use std::collections::VecDeque;

/// An ordered queue of `(value, weight)` pairs.
///
/// The total weight is what backpressure is computed from. It is recomputed by
/// summing on demand rather than tracked incrementally, which keeps it exact
/// for fractional weights.
#[derive(Debug)]
pub struct SizeQueue<T> {
    entries: VecDeque<(T, f64)>,
}

impl<T> SizeQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a value with the given weight.
    pub fn enqueue(&mut self, value: T, size: f64) {
        self.entries.push_back((value, size));
    }

    /// Remove and return the oldest entry.
    pub fn dequeue(&mut self) -> Option<(T, f64)> {
        self.entries.pop_front()
    }

    /// Peek at the oldest value without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.entries.front().map(|(value, _)| value)
    }

    /// Weight of the oldest entry.
    pub fn peek_size(&self) -> Option<f64> {
        self.entries.front().map(|(_, size)| *size)
    }

    /// Sum of all entry weights.
    pub fn total_size(&self) -> f64 {
        self.entries.iter().map(|(_, size)| size).sum()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries, returning them oldest first.
    pub fn empty(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(value, _)| value).collect()
    }
}

impl<T> Default for SizeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_and_total() {
        let mut queue = SizeQueue::new();
        queue.enqueue("a", 1.0);
        queue.enqueue("b", 2.5);
        queue.enqueue("c", 0.5);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.total_size(), 4.0);
        assert_eq!(queue.peek(), Some(&"a"));
        assert_eq!(queue.peek_size(), Some(1.0));

        assert_eq!(queue.dequeue(), Some(("a", 1.0)));
        assert_eq!(queue.total_size(), 3.0);
        assert_eq!(queue.dequeue(), Some(("b", 2.5)));
        assert_eq!(queue.dequeue(), Some(("c", 0.5)));
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn test_empty_clears_everything() {
        let mut queue = SizeQueue::new();
        queue.enqueue(1, 1.0);
        queue.enqueue(2, 1.0);

        assert_eq!(queue.empty(), vec![1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
        assert_eq!(queue.peek(), None);
    }
}
