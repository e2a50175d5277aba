//! Fixed-capacity FIFO with ring-buffer eviction.
//!
//! A full queue never rejects a push: the oldest element is evicted to make
//! room. Separately, a push that brings the depth up to a checkpoint at or
//! above capacity reports an alarm so that sustained overflow is loud even
//! though a single overflow is silent.

use std::collections::VecDeque;

/// Default maximum number of queued frames.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default spacing between alarm checkpoints.
pub const DEFAULT_ALARM_STRIDE: usize = 100;

/// Result of a [`BoundedQueue::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Appended; nothing evicted, no alarm.
    Inserted,
    /// Appended after evicting the oldest element, which is returned.
    InsertedWithEviction(T),
    /// Appended without eviction and the new depth is an alarm checkpoint.
    InsertedAtAlarmThreshold { depth: usize },
}

impl<T> PushOutcome<T> {
    pub fn is_alarm(&self) -> bool {
        matches!(self, PushOutcome::InsertedAtAlarmThreshold { .. })
    }

    pub fn is_eviction(&self) -> bool {
        matches!(self, PushOutcome::InsertedWithEviction(_))
    }
}

/// A bounded FIFO queue.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    alarm_stride: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// A zero capacity or stride is clamped to 1.
    pub fn new(capacity: usize, alarm_stride: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            alarm_stride: alarm_stride.max(1),
        }
    }

    /// Append an element, evicting the oldest one if the queue is full.
    pub fn push(&mut self, item: T) -> PushOutcome<T> {
        if self.buffer.len() >= self.capacity {
            let evicted = self.buffer.pop_front();
            self.buffer.push_back(item);
            return match evicted {
                Some(old) => PushOutcome::InsertedWithEviction(old),
                None => PushOutcome::Inserted,
            };
        }

        self.buffer.push_back(item);
        let depth = self.buffer.len();
        if depth >= self.capacity && depth % self.alarm_stride == 0 {
            PushOutcome::InsertedAtAlarmThreshold { depth }
        } else {
            PushOutcome::Inserted
        }
    }

    /// Remove and return the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        self.buffer.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn alarm_stride(&self) -> usize {
        self.alarm_stride
    }

    /// Drop every queued element, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copy of the queued elements, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.buffer.iter().cloned().collect()
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_ALARM_STRIDE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &mut BoundedQueue<u32>) -> Vec<u32> {
        std::iter::from_fn(|| queue.pop()).collect()
    }

    #[test]
    fn fifo_below_capacity() {
        let mut queue = BoundedQueue::new(10, 100);
        for i in 1..=10 {
            assert!(!queue.push(i).is_eviction());
        }
        assert_eq!(drain(&mut queue), (1..=10).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_keeps_most_recent() {
        let mut queue = BoundedQueue::new(3, 100);
        for i in 1..=7 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(drain(&mut queue), vec![5, 6, 7]);
    }

    #[test]
    fn eviction_returns_oldest() {
        let mut queue = BoundedQueue::new(2, 100);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.push("c"), PushOutcome::InsertedWithEviction("a"));
        assert_eq!(queue.snapshot(), vec!["b", "c"]);
    }

    #[test]
    fn alarm_scenario_capacity_five_stride_five() {
        let mut queue = BoundedQueue::new(5, 5);
        let outcomes: Vec<_> = (1..=10).map(|i| queue.push(i)).collect();

        for outcome in &outcomes[..4] {
            assert_eq!(*outcome, PushOutcome::Inserted);
        }
        assert_eq!(outcomes[4], PushOutcome::InsertedAtAlarmThreshold { depth: 5 });
        for (i, outcome) in outcomes[5..].iter().enumerate() {
            assert_eq!(*outcome, PushOutcome::InsertedWithEviction(i as u32 + 1));
        }
        assert_eq!(queue.snapshot(), vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn alarm_refires_after_pops() {
        let mut queue = BoundedQueue::new(5, 5);
        for i in 0..5 {
            queue.push(i);
        }
        queue.pop();
        assert!(queue.push(99).is_alarm());
    }

    #[test]
    fn no_alarm_when_capacity_is_off_stride() {
        let mut queue = BoundedQueue::new(7, 5);
        let alarms = (0..20).filter(|i| queue.push(*i).is_alarm()).count();
        assert_eq!(alarms, 0);
        assert_eq!(queue.len(), 7);
    }

    #[test]
    fn default_alarm_at_one_thousand() {
        let mut queue = BoundedQueue::default();
        for i in 0..999u32 {
            assert!(!queue.push(i).is_alarm());
        }
        assert_eq!(
            queue.push(999),
            PushOutcome::InsertedAtAlarmThreshold { depth: 1000 }
        );
        assert!(queue.push(1000).is_eviction());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut queue = BoundedQueue::new(0, 0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.alarm_stride(), 1);
        assert!(queue.push(1).is_alarm());
        assert_eq!(queue.push(2), PushOutcome::InsertedWithEviction(1));
    }

    #[test]
    fn clear_reports_dropped() {
        let mut queue = BoundedQueue::new(4, 100);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
