//! A keyed priority queue which pops the *smallest* priority first,
//! and which breaks ties in insertion order.  The simulator uses it
//! to hold event deadlines: events due at the same simulated time
//! must fire in the order they were scheduled.
use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;

use keyed_priority_queue::KeyedPriorityQueue;

#[derive(Debug)]
struct ReverseOrdered<T> {
    inner: T,
}

impl<T> From<T> for ReverseOrdered<T> {
    fn from(inner: T) -> ReverseOrdered<T> {
        ReverseOrdered { inner }
    }
}

impl<T: Ord> PartialOrd for ReverseOrdered<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Eq> Eq for ReverseOrdered<T> {}

impl<T: Eq> PartialEq for ReverseOrdered<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T: Ord> Ord for ReverseOrdered<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.inner.cmp(&self.inner)
    }
}

#[test]
fn test_reverse_order() {
    assert_eq!(ReverseOrdered::from(1), ReverseOrdered::from(1));
    assert_ne!(ReverseOrdered::from(1), ReverseOrdered::from(0));
    assert!(ReverseOrdered::from(1) < ReverseOrdered::from(0));
    assert!(ReverseOrdered::from(1) <= ReverseOrdered::from(0));
}

/// The stored priority: the caller's priority, then a serial number
/// which increases with each push.
type Stamped<P> = ReverseOrdered<(P, u64)>;

pub struct KeyedDeadlineQueue<K: Hash + Eq, P: Ord> {
    items: KeyedPriorityQueue<K, Stamped<P>>,
    next_serial: u64,
}

impl<K, P> KeyedDeadlineQueue<K, P>
where
    K: Hash + Eq,
    P: Ord,
{
    pub fn new() -> KeyedDeadlineQueue<K, P> {
        KeyedDeadlineQueue {
            items: KeyedPriorityQueue::new(),
            next_serial: 0,
        }
    }

    pub fn peek(&self) -> Option<(&K, &P)> {
        self.items.peek().map(|(k, p)| (k, &p.inner.0))
    }

    pub fn pop(&mut self) -> Option<(K, P)> {
        self.items.pop().map(|(k, p)| (k, p.inner.0))
    }

    /// Inserts `key` with `priority`, or replaces the priority of
    /// `key` if it is already present.  A replaced item loses its
    /// place among items of equal priority; it now sorts after them.
    /// Returns the previous priority of `key`, if any.
    pub fn push(&mut self, key: K, priority: P) -> Option<P> {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.items
            .push(key, ReverseOrdered::from((priority, serial)))
            .map(|old| old.inner.0)
    }

    /// Removes `key`, returning its priority.  Removing a key which
    /// is not present does nothing.
    pub fn remove(&mut self, key: &K) -> Option<P> {
        self.items.remove(key).map(|old| old.inner.0)
    }

    pub fn get_priority(&self, key: &K) -> Option<&P> {
        self.items.get_priority(key).map(|p| &p.inner.0)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.items.get_priority(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K, P> Default for KeyedDeadlineQueue<K, P>
where
    K: Hash + Eq,
    P: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> Debug for KeyedDeadlineQueue<K, P>
where
    K: Hash + Eq + Debug,
    P: Ord + Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedDeadlineQueue")
            .field("items", &self.items)
            .field("next_serial", &self.next_serial)
            .finish()
    }
}

#[test]
fn test_empty() {
    let mut q: KeyedDeadlineQueue<usize, usize> = KeyedDeadlineQueue::default();
    assert!(q.is_empty());
    assert_eq!(0, q.len());
    assert_eq!(q.peek(), None);
    assert_eq!(q.pop(), None);
}

#[test]
fn test_repeat_push() {
    let mut q: KeyedDeadlineQueue<usize, char> = KeyedDeadlineQueue::new();
    assert_eq!(q.push(0, '2'), None);
    assert_eq!(q.push(0, '4'), Some('2'));
    assert_eq!(q.push(0, '3'), Some('4'));
    assert_eq!(q.pop(), Some((0, '3')));
    assert!(q.is_empty());
}

#[test]
fn test_ordering() {
    let mut q: KeyedDeadlineQueue<usize, char> = KeyedDeadlineQueue::new();
    assert_eq!(q.push(1, '8'), None);
    assert_eq!(q.push(0, '2'), None);
    assert_eq!(q.pop(), Some((0, '2')));
    assert_eq!(q.pop(), Some((1, '8')));
    assert!(q.is_empty());
}

#[test]
fn test_ties_pop_in_insertion_order() {
    let mut q: KeyedDeadlineQueue<&str, u32> = KeyedDeadlineQueue::new();
    q.push("unit 2 seek", 7);
    q.push("unit 0 seek", 7);
    q.push("unit 1 seek", 7);
    q.push("IFC pulse", 3);
    assert_eq!(q.pop(), Some(("IFC pulse", 3)));
    assert_eq!(q.pop(), Some(("unit 2 seek", 7)));
    assert_eq!(q.pop(), Some(("unit 0 seek", 7)));
    assert_eq!(q.pop(), Some(("unit 1 seek", 7)));
}

#[test]
fn test_remove() {
    let mut q: KeyedDeadlineQueue<usize, u32> = KeyedDeadlineQueue::new();
    q.push(4, 10);
    assert!(q.contains(&4));
    assert_eq!(q.get_priority(&4), Some(&10));
    assert_eq!(q.remove(&4), Some(10));
    assert_eq!(q.remove(&4), None);
    assert!(!q.contains(&4));
    assert!(q.is_empty());
}
