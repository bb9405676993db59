use super::event::Event;
use crate::error::{SyncError, SyncResult, TaskError};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

struct Slot<T> {
    outcome: OnceLock<Result<T, TaskError>>,
    done: Event,
}

/// Single-assignment handle to an outcome that is produced elsewhere.
///
/// Clones share the same slot: one side assigns once, any number of readers
/// block in [`get`](Self::get) and all observe the same outcome.
pub struct Deferred<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                outcome: OnceLock::new(),
                done: Event::new(),
            }),
        }
    }

    /// Assign the outcome. A second assignment is rejected and the first
    /// outcome stays.
    pub fn set(&self, outcome: Result<T, TaskError>) -> SyncResult<()> {
        self.slot
            .outcome
            .set(outcome)
            .map_err(|_| SyncError::Usage("deferred result already set"))?;
        self.slot.done.set();
        Ok(())
    }

    #[inline]
    pub fn set_value(&self, value: T) -> SyncResult<()> {
        self.set(Ok(value))
    }

    #[inline]
    pub fn set_error(&self, err: TaskError) -> SyncResult<()> {
        self.set(Err(err))
    }

    pub fn is_done(&self) -> bool {
        self.slot.outcome.get().is_some()
    }
}

impl<T: Clone> Deferred<T> {
    /// Wait for the outcome; `None` waits indefinitely.
    pub fn get(&self, timeout: Option<Duration>) -> Result<T, TaskError> {
        if !self.slot.done.wait(timeout) {
            return Err(TaskError::Timeout);
        }
        match self.slot.outcome.get() {
            Some(outcome) => outcome.clone(),
            None => Err(TaskError::Timeout),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("done", &self.is_done()).finish()
    }
}
