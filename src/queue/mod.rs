//! A thread-safe, optionally-bounded blocking FIFO queue.
//!
//! `push` applies backpressure once a bounded queue is full; `pop` blocks
//! until an element is available, with a timed variant for bounded waits.
//! `wait_empty` lets a producer (or a destructor) observe drain-to-empty.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
}

/// A thread-safe FIFO queue with an optional maximum length.
pub struct Queue<T> {
    max_length: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Queue<T> {
    /// Creates a queue. `max_length == 0` means unbounded.
    pub fn new(max_length: usize) -> Self {
        Queue {
            max_length,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Pushes an element, blocking while a bounded queue is full.
    pub fn push(&self, element: T) {
        {
            let mut guard = self.inner.lock();
            if self.max_length != 0 {
                while guard.items.len() >= self.max_length {
                    self.not_full.wait(&mut guard);
                }
            }
            guard.items.push_back(element);
        }
        self.not_empty.notify_one();
    }

    /// Pops the oldest element, blocking until one is available.
    pub fn pop(&self) -> T {
        let mut guard = self.inner.lock();
        while guard.items.is_empty() {
            self.not_empty.wait(&mut guard);
        }
        let element = guard.items.pop_front().expect("checked non-empty above");
        drop(guard);
        self.not_full.notify_one();
        element
    }

    /// Pops the oldest element, waiting at most `timeout`. Returns `None` on
    /// timeout.
    pub fn pop_timed(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock();
        while guard.items.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait_result = self.not_empty.wait_for(&mut guard, deadline - now);
            if wait_result.timed_out() && guard.items.is_empty() {
                return None;
            }
        }
        let element = guard.items.pop_front().expect("checked non-empty above");
        drop(guard);
        self.not_full.notify_one();
        Some(element)
    }

    /// True if the queue currently holds no elements.
    pub fn empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Number of elements currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Blocks until the queue is observed empty, or `timeout` (if given)
    /// elapses first. Returns `true` if the queue was observed empty.
    pub fn wait_empty(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.inner.lock();
        if guard.items.is_empty() {
            return true;
        }
        match timeout {
            None => {
                while !guard.items.is_empty() {
                    self.not_full.wait(&mut guard);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !guard.items.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        return guard.items.is_empty();
                    }
                    self.not_full.wait_for(&mut guard, deadline - now);
                }
                true
            }
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_preserved() {
        let q = Queue::new(0);
        for i in 0..10 {
            q.push(i);
        }
        for i in 0..10 {
            assert_eq!(q.pop(), i);
        }
        assert!(q.empty());
    }

    #[test]
    fn bounded_push_blocks_until_pop() {
        let q = Arc::new(Queue::new(1));
        q.push(1);

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            q2.push(2);
        });

        // Give the pusher a moment to block on the full queue.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.pop(), 1);
        handle.join().unwrap();
        assert_eq!(q.pop(), 2);
    }

    #[test]
    fn pop_timed_misses_on_empty_queue() {
        let q: Queue<i32> = Queue::new(0);
        assert_eq!(q.pop_timed(Duration::from_millis(20)), None);
    }

    #[test]
    fn pop_timed_hits_when_pushed_concurrently() {
        let q = Arc::new(Queue::new(0));
        let q2 = Arc::clone(&q);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            q2.push(42);
        });
        assert_eq!(q.pop_timed(Duration::from_secs(1)), Some(42));
    }

    #[test]
    fn wait_empty_returns_once_drained() {
        let q = Arc::new(Queue::new(0));
        q.push(1);
        q.push(2);

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            q2.pop();
            q2.pop();
        });

        assert!(q.wait_empty(Some(Duration::from_secs(1))));
        handle.join().unwrap();
    }

    #[test]
    fn wait_empty_times_out_if_never_drained() {
        let q = Queue::new(0);
        q.push(1);
        assert!(!q.wait_empty(Some(Duration::from_millis(20))));
    }
}
