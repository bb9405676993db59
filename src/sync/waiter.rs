use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Latch {
    /// `Some(true)` once released, `Some(false)` once the deadline fired.
    outcome: Option<bool>,
    /// Set by the first `acquire`; a second one is a usage error.
    consumed: bool,
}

/// Single-use binary latch, the parking spot behind every blocking wait.
///
/// One thread calls [`acquire`](Self::acquire); any thread may call
/// [`release`](Self::release). The first of {explicit release, deadline}
/// decides the outcome. A release that arrives before `acquire` is kept, so
/// a notify racing ahead of the waiter is never lost.
#[derive(Debug, Default)]
pub struct Waiter {
    latch: Mutex<Latch>,
    cv: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until released or until `timeout` elapses.
    ///
    /// `None` or a zero timeout blocks indefinitely. Returns true if released
    /// explicitly, false if the deadline won. Fails with
    /// [`SyncError::Usage`] if this waiter was already acquired.
    pub fn acquire(&self, timeout: Option<Duration>) -> SyncResult<bool> {
        let mut latch = self.latch.lock();
        if latch.consumed {
            return Err(SyncError::Usage("waiter object can only be used once"));
        }
        latch.consumed = true;

        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        while latch.outcome.is_none() {
            match deadline {
                Some(at) => {
                    if self.cv.wait_until(&mut latch, at).timed_out() && latch.outcome.is_none() {
                        latch.outcome = Some(false);
                    }
                }
                None => self.cv.wait(&mut latch),
            }
        }
        Ok(latch.outcome.unwrap_or(false))
    }

    /// Fire the latch. Returns false if it had already fired (released or
    /// timed out), in which case this is a no-op.
    pub fn release(&self) -> bool {
        let mut latch = self.latch.lock();
        if latch.outcome.is_some() {
            return false;
        }
        latch.outcome = Some(true);
        self.cv.notify_all();
        true
    }

    /// True while neither a release nor a timeout has happened.
    pub fn is_pending(&self) -> bool {
        self.latch.lock().outcome.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn release_wakes_blocked_acquire() {
        let w = Arc::new(Waiter::new());
        let remote = w.clone();
        let h = thread::spawn(move || remote.acquire(None));
        thread::sleep(Duration::from_millis(30));
        assert!(w.release());
        assert_eq!(h.join().unwrap(), Ok(true));
    }

    #[test]
    fn timeout_reports_false() {
        let w = Waiter::new();
        let start = Instant::now();
        assert_eq!(w.acquire(Some(Duration::from_millis(40))), Ok(false));
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(!w.release());
    }

    #[test]
    fn early_release_is_not_lost() {
        let w = Waiter::new();
        assert!(w.release());
        assert_eq!(w.acquire(Some(Duration::from_secs(5))), Ok(true));
    }

    #[test]
    fn second_release_is_a_noop() {
        let w = Waiter::new();
        assert!(w.release());
        assert!(!w.release());
        assert!(!w.is_pending());
    }

    #[test]
    fn reuse_is_a_usage_error() {
        let w = Waiter::new();
        w.release();
        assert_eq!(w.acquire(None), Ok(true));
        assert!(matches!(w.acquire(None), Err(SyncError::Usage(_))));
    }
}
