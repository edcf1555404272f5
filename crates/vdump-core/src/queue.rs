//! Bounded blocking FIFO with an open/close lifecycle.
//!
//! One queue sits between each archive stream's worker thread and the
//! orchestrator; there is no other shared state. `close` wakes every waiter
//! and leaves queued items drainable, and `open` re-arms a closed queue so
//! workers can be restarted around a fork.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Per-stream queue capacity. Deep enough to keep a worker busy, shallow
/// enough to bound in-flight block memory.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

pub struct Queue<T> {
    state: Mutex<State<T>>,
    changed: Condvar,
    capacity: usize,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Queue {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            changed: Condvar::new(),
            capacity,
        }
    }

    /// Block until there is space, then enqueue. Returns the item back if
    /// the queue is (or becomes) closed, so callers can buffer it.
    pub fn put(&self, item: T) -> Result<(), T> {
        let mut st = self.state.lock().unwrap();
        while !st.closed && st.items.len() == self.capacity {
            st = self.changed.wait(st).unwrap();
        }
        if st.closed {
            return Err(item);
        }
        st.items.push_back(item);
        self.changed.notify_all();
        Ok(())
    }

    /// Block until an item arrives, or the queue is closed **and** empty.
    /// A closed queue still yields its remaining items.
    pub fn get(&self) -> Option<T> {
        let mut st = self.state.lock().unwrap();
        while !st.closed && st.items.is_empty() {
            st = self.changed.wait(st).unwrap();
        }
        let item = st.items.pop_front();
        if item.is_some() {
            self.changed.notify_all();
        }
        item
    }

    /// Wake all waiters; subsequent `put` fails, pending items stay.
    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        if !st.closed {
            st.closed = true;
            self.changed.notify_all();
        }
    }

    /// Re-arm a previously closed queue.
    pub fn open(&self) {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            st.closed = false;
            self.changed.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}
