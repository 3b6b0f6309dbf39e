//! Generic bounded-in-name-only FIFO queue (§4.1).
//!
//! "Bounded" here refers to the contract (callers enforce back-pressure
//! upstream), not an internal capacity limit — there is none. Every
//! operation serialises under a plain `std::sync::Mutex`; none of them hold
//! the lock across an `.await`, so a blocking mutex is the right tool.

use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> BoundedQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().unwrap().push_back(item);
    }

    pub fn push_many(&self, items: impl IntoIterator<Item = T>) {
        let mut guard = self.inner.lock().unwrap();
        guard.extend(items);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Atomically return everything currently queued and empty the queue.
    pub fn drain(&self) -> Vec<T> {
        let mut guard = self.inner.lock().unwrap();
        guard.drain(..).collect()
    }

    /// Push items back onto the front of the queue, preserving their
    /// relative order — used by the relational drainer's fail-safe requeue.
    pub fn requeue_front(&self, items: Vec<T>) {
        let mut guard = self.inner.lock().unwrap();
        for item in items.into_iter().rev() {
            guard.push_front(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_fifo() {
        let q: BoundedQueue<i32> = BoundedQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn drain_is_atomic_and_empties() {
        let q: BoundedQueue<i32> = BoundedQueue::new();
        q.push_many([1, 2, 3]);
        let drained = q.drain();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn requeue_front_preserves_order_ahead_of_new_items() {
        let q: BoundedQueue<i32> = BoundedQueue::new();
        q.push(4);
        q.requeue_front(vec![1, 2, 3]);
        assert_eq!(q.drain(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn clear_empties_without_returning() {
        let q: BoundedQueue<i32> = BoundedQueue::new();
        q.push_many([1, 2]);
        q.clear();
        assert!(q.is_empty());
    }
}
