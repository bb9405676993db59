use super::condition::Condition;
use std::time::Duration;

/// "Has happened" flag that threads can block on.
#[derive(Debug)]
pub struct Event {
    cond: Condition<bool>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Self {
            cond: Condition::new(false),
        }
    }

    /// Raise the flag and wake every waiter.
    pub fn set(&self) {
        let mut flag = self.cond.lock();
        *flag = true;
        // The guard comes from this condition's own mutex, so this cannot fail.
        let _ = self.cond.notify_all(&flag);
    }

    pub fn clear(&self) {
        *self.cond.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.cond.lock()
    }

    /// Block until the flag is raised or `timeout` elapses; returns the flag.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut flag = self.cond.lock();
        matches!(self.cond.wait_for(&mut flag, |f| *f, timeout), Ok(true))
    }
}
