use super::condition::Condition;
use super::mutex::Mutex;
use crate::error::{PutError, QueueError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Blocking multi-producer/multi-consumer FIFO with a capacity limit.
///
/// One mutex guards the items; "not empty" and "not full" conditions share
/// it. A full queue under non-blocking `put` is the backpressure signal
/// callers are expected to act on.
///
/// Timeouts: `None` blocks indefinitely, `Some(d)` waits at most `d`, and a
/// zero duration on a blocking call is rejected as
/// [`QueueError::InvalidArgument`].
pub struct BoundedQueue<T> {
    capacity: usize,
    not_empty: Condition<QueueState<T>>,
    not_full: Condition<QueueState<T>>,
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl<T> BoundedQueue<T> {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let mutex = Arc::new(Mutex::new(QueueState {
            items: VecDeque::new(),
            closed: false,
        }));
        Self {
            capacity: capacity.max(1),
            not_empty: Condition::with_mutex(mutex.clone()),
            not_full: Condition::with_mutex(mutex),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn put(&self, item: T, block: bool, timeout: Option<Duration>) -> Result<(), PutError<T>> {
        let mut state = self.not_full.lock();
        if state.closed {
            return Err(PutError::closed(item));
        }

        if !block {
            if state.items.len() >= self.capacity {
                return Err(PutError::full(item));
            }
        } else if timeout.is_some_and(|t| t.is_zero()) {
            return Err(PutError::invalid(item));
        } else {
            let cap = self.capacity;
            let has_room = self
                .not_full
                .wait_for(&mut state, |s| s.closed || s.items.len() < cap, timeout);
            if !matches!(has_room, Ok(true)) {
                return Err(PutError::full(item));
            }
            if state.closed {
                return Err(PutError::closed(item));
            }
        }

        state.items.push_back(item);
        let _ = self.not_empty.notify(&state, 1);
        Ok(())
    }

    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Result<T, QueueError> {
        let mut state = self.not_empty.lock();

        if !block {
            if state.items.is_empty() {
                return Err(if state.closed {
                    QueueError::Closed
                } else {
                    QueueError::Empty
                });
            }
        } else if timeout.is_some_and(|t| t.is_zero()) {
            return Err(QueueError::InvalidArgument);
        } else {
            let has_item = self
                .not_empty
                .wait_for(&mut state, |s| s.closed || !s.items.is_empty(), timeout);
            if !matches!(has_item, Ok(true)) {
                return Err(QueueError::Empty);
            }
        }

        // A closed queue still hands out what it holds before reporting Closed.
        let Some(item) = state.items.pop_front() else {
            return Err(QueueError::Closed);
        };
        let _ = self.not_full.notify(&state, 1);
        Ok(item)
    }

    /// Non-blocking put.
    #[inline]
    pub fn try_put(&self, item: T) -> Result<(), PutError<T>> {
        self.put(item, false, None)
    }

    /// Non-blocking get.
    #[inline]
    pub fn try_get(&self) -> Result<T, QueueError> {
        self.get(false, None)
    }

    pub fn size(&self) -> usize {
        self.not_empty.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop every queued item; blocked producers get the freed room.
    pub fn clear(&self) {
        let mut state = self.not_full.lock();
        state.items.clear();
        let _ = self.not_full.notify_all(&state);
    }

    /// Refuse further puts and wake every blocked producer and consumer.
    /// Items already queued can still be taken.
    pub fn close(&self) {
        let mut state = self.not_empty.lock();
        state.closed = true;
        let _ = self.not_empty.notify_all(&state);
        let _ = self.not_full.notify_all(&state);
    }

    pub fn is_closed(&self) -> bool {
        self.not_empty.lock().closed
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.not_empty.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}
