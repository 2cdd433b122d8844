//! Scheduling of future device activity.
//!
//! A transfer in progress is never a blocked call; it is a pending
//! re-activation of the unit at some future simulated time.
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tracing::{event, Level};

use base::collections::pq::KeyedDeadlineQueue;

/// Pending events, at most one per key.  Events due at the same time
/// are delivered in the order they were scheduled.
#[derive(Debug)]
pub(crate) struct EventQueue<K: Hash + Eq> {
    items: KeyedDeadlineQueue<K, Duration>,
}

impl<K> EventQueue<K>
where
    K: Hash + Eq + Copy + Debug,
{
    pub(crate) fn new() -> EventQueue<K> {
        EventQueue {
            items: KeyedDeadlineQueue::new(),
        }
    }

    /// Schedules `key` to be serviced at `when`, replacing any event
    /// already pending for it.
    pub(crate) fn activate(&mut self, key: K, when: Duration) -> Option<Duration> {
        let old = self.items.push(key, when);
        if let Some(prev) = old {
            if prev < when {
                event!(
                    Level::WARN,
                    "{:?} service time pushed back from {:?} to {:?}",
                    key,
                    prev,
                    when
                );
            }
        }
        old
    }

    /// Withdraws the event pending for `key`.  Withdrawing an event
    /// which is not pending does nothing.
    pub(crate) fn cancel(&mut self, key: K) -> bool {
        self.items.remove(&key).is_some()
    }

    pub(crate) fn is_pending(&self, key: K) -> bool {
        self.items.contains(&key)
    }

    pub(crate) fn next_due(&self) -> Option<Duration> {
        self.items.peek().map(|(_, when)| *when)
    }

    /// Removes and returns the earliest event if it is due at or
    /// before `now`.
    pub(crate) fn pop_due(&mut self, now: Duration) -> Option<K> {
        match self.items.peek() {
            Some((_, when)) if *when <= now => self.items.pop().map(|(key, _)| key),
            _ => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        while self.items.pop().is_some() {}
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[test]
fn test_event_queue_empty() {
    let mut q: EventQueue<usize> = EventQueue::new();
    assert!(q.is_empty());
    assert_eq!(0, q.len());
    assert_eq!(q.next_due(), None);
    assert_eq!(q.pop_due(Duration::MAX), None);
}

#[test]
fn test_event_queue_repeat_activate() {
    let mut q: EventQueue<usize> = EventQueue::new();
    assert_eq!(q.activate(0, Duration::from_micros(200)), None);
    assert_eq!(
        q.activate(0, Duration::from_micros(400)),
        Some(Duration::from_micros(200))
    );
    assert_eq!(q.len(), 1);
    assert_eq!(q.pop_due(Duration::from_micros(399)), None);
    assert_eq!(q.pop_due(Duration::from_micros(400)), Some(0));
    assert!(q.is_empty());
}

#[test]
fn test_event_queue_same_time_fifo() {
    let mut q: EventQueue<usize> = EventQueue::new();
    let t = Duration::from_micros(10);
    q.activate(3, t);
    q.activate(1, t);
    q.activate(2, t);
    assert_eq!(q.pop_due(t), Some(3));
    assert_eq!(q.pop_due(t), Some(1));
    assert_eq!(q.pop_due(t), Some(2));
}

#[test]
fn test_event_queue_cancel() {
    let mut q: EventQueue<usize> = EventQueue::new();
    assert!(!q.cancel(5));
    q.activate(5, Duration::from_micros(1));
    assert!(q.is_pending(5));
    assert!(q.cancel(5));
    assert!(!q.is_pending(5));
    assert!(!q.cancel(5));
}
