//! Blocking FIFO handoff queue for caller threads → dispatch worker.
//!
//! Unlike a bounded ring, [`BlockingQueue::push`] never fails and never
//! waits for space: callers only contend on the internal mutex. The
//! consumer waits on a condition variable with a timeout, which keeps the
//! worker loop responsive to both new frames and shutdown.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use atdecc::sync::queue::BlockingQueue;
//!
//! let queue = BlockingQueue::new();
//! queue.push(42u32);
//! assert_eq!(queue.try_pop(Duration::ZERO), Some(42));
//! assert_eq!(queue.try_pop(Duration::from_millis(1)), None);
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Unbounded multi-producer FIFO with a timed, blocking consumer.
///
/// Many threads may [`push`](Self::push) concurrently. The design assumes a
/// single consumer; several consumers are safe but not woken fairly.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Appends `item` and wakes one waiting consumer.
    pub fn push(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Removes the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// A zero timeout polls without blocking. Spurious wake-ups neither
    /// shorten the wait nor produce an item.
    #[must_use]
    pub fn try_pop(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.lock();
        if timeout.is_zero() {
            return guard.pop_front();
        }
        let (mut guard, _timed_out) = self
            .available
            .wait_timeout_while(guard, timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        guard.pop_front()
    }

    /// Removes and returns everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panicking producer cannot leave the deque half-modified, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn fifo_from_single_producer() {
        let queue = BlockingQueue::new();
        for i in 0..100u32 {
            queue.push(i);
        }
        for i in 0..100u32 {
            assert_eq!(queue.try_pop(Duration::ZERO), Some(i));
        }
        assert_eq!(queue.try_pop(Duration::ZERO), None);
    }

    #[test]
    fn empty_pop_waits_full_timeout() {
        let queue = BlockingQueue::<u8>::new();
        let timeout = Duration::from_millis(30);

        let start = Instant::now();
        assert_eq!(queue.try_pop(timeout), None);
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn pop_wakes_on_push_from_other_thread() {
        let queue = Arc::new(BlockingQueue::new());
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push("frame");
        });

        assert_eq!(queue.try_pop(Duration::from_secs(5)), Some("frame"));
        handle.join().unwrap();
    }

    #[test]
    fn per_producer_order_survives_interleaving() {
        let queue = Arc::new(BlockingQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..250u32 {
                        queue.push((p, seq));
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let mut next = [0u32; 4];
        while let Some((p, seq)) = queue.try_pop(Duration::ZERO) {
            assert_eq!(seq, next[p as usize], "producer {p} reordered");
            next[p as usize] += 1;
        }
        assert_eq!(next, [250; 4]);
    }

    #[test]
    fn drain_empties_in_order() {
        let queue = BlockingQueue::new();
        queue.push(String::from("a"));
        queue.push(String::from("b"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.drain(), vec!["a".to_string(), "b".to_string()]);
        assert!(queue.is_empty());
    }
}
