use super::mutex::{Mutex, MutexGuard};
use super::waiter::Waiter;
use crate::error::{SyncError, SyncResult};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Condition variable over a shared [`Mutex`], built from a FIFO list of
/// single-use [`Waiter`]s.
///
/// Every operation takes the caller's guard and checks that it belongs to
/// this condition's mutex and to the calling thread; anything else is
/// [`SyncError::Ownership`]. Several conditions may share one mutex (the
/// queue's "not empty" and "not full" do).
///
/// The waiter list is only modified while the shared mutex is held. The
/// inner `parking_lot` lock exists so the list is `Sync`; it is never held
/// across a blocking call.
pub struct Condition<T> {
    mutex: Arc<Mutex<T>>,
    waiters: parking_lot::Mutex<VecDeque<Arc<Waiter>>>,
}

impl<T> Condition<T> {
    /// Condition with its own freshly created mutex guarding `value`.
    pub fn new(value: T) -> Self {
        Self::with_mutex(Arc::new(Mutex::new(value)))
    }

    /// Condition bound to an existing mutex.
    pub fn with_mutex(mutex: Arc<Mutex<T>>) -> Self {
        Self {
            mutex,
            waiters: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn mutex(&self) -> &Arc<Mutex<T>> {
        &self.mutex
    }

    /// Shorthand for locking the bound mutex.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock()
    }

    fn check_owned(&self, guard: &MutexGuard<'_, T>) -> SyncResult<()> {
        let same_mutex = std::ptr::eq(MutexGuard::mutex(guard), Arc::as_ptr(&self.mutex));
        if same_mutex && self.mutex.is_owned_by_current() {
            Ok(())
        } else {
            Err(SyncError::Ownership)
        }
    }

    /// Park until notified or until `timeout` elapses.
    ///
    /// The waiter joins the list before the mutex is released, so a notify
    /// issued right after the release still finds it. Returns true when
    /// woken by a notify, false on timeout. The guard is held again on return.
    pub fn wait(&self, guard: &mut MutexGuard<'_, T>, timeout: Option<Duration>) -> SyncResult<bool> {
        self.check_owned(guard)?;

        let waiter = Arc::new(Waiter::new());
        self.waiters.lock().push_back(waiter.clone());

        let notified = MutexGuard::unlocked(guard, || waiter.acquire(timeout));

        self.waiters.lock().retain(|w| !Arc::ptr_eq(w, &waiter));
        notified
    }

    /// Wait until `predicate` holds or the deadline passes.
    ///
    /// The deadline is fixed on entry; each wakeup waits only for what is
    /// left of it. Returns the last predicate value. A zero timeout checks
    /// the predicate once without blocking.
    pub fn wait_for<P>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        mut predicate: P,
        timeout: Option<Duration>,
    ) -> SyncResult<bool>
    where
        P: FnMut(&T) -> bool,
    {
        self.check_owned(guard)?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut result = predicate(&**guard);
        while !result {
            let remaining = match deadline {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        break;
                    }
                    Some(at - now)
                }
                None => None,
            };
            self.wait(guard, remaining)?;
            result = predicate(&**guard);
        }
        Ok(result)
    }

    /// Wake up to `n` parked threads, oldest first. Returns how many were
    /// actually woken (`min(n, pending waiters)`).
    ///
    /// Woken waiters stay in the list until their thread re-acquires the
    /// mutex and removes them; they are skipped here because they already
    /// fired.
    pub fn notify(&self, guard: &MutexGuard<'_, T>, n: usize) -> SyncResult<usize> {
        self.check_owned(guard)?;
        if n == 0 {
            return Err(SyncError::InvalidArgument("n should be > 0"));
        }
        Ok(self.release_pending(n))
    }

    /// Wake every parked thread.
    pub fn notify_all(&self, guard: &MutexGuard<'_, T>) -> SyncResult<usize> {
        self.check_owned(guard)?;
        Ok(self.release_pending(usize::MAX))
    }

    /// Number of threads parked and not yet woken.
    pub fn waiting(&self) -> usize {
        self.waiters.lock().iter().filter(|w| w.is_pending()).count()
    }

    fn release_pending(&self, n: usize) -> usize {
        let waiters = self.waiters.lock();
        let mut woken = 0;
        for waiter in waiters.iter() {
            if woken == n {
                break;
            }
            if waiter.release() {
                woken += 1;
            }
        }
        woken
    }
}

impl<T> fmt::Debug for Condition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("mutex", &self.mutex)
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn wait_until(cond: impl Fn() -> bool, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn foreign_guard_is_rejected() {
        let cond = Condition::new(0u8);
        let other = Mutex::new(0u8);
        let mut guard = other.lock();
        assert_eq!(
            cond.wait(&mut guard, Some(Duration::from_millis(1))),
            Err(SyncError::Ownership)
        );
        assert_eq!(cond.notify(&guard, 1), Err(SyncError::Ownership));
        assert_eq!(cond.notify_all(&guard), Err(SyncError::Ownership));
    }

    #[test]
    fn notify_zero_is_invalid() {
        let cond = Condition::new(());
        let guard = cond.lock();
        assert!(matches!(cond.notify(&guard, 0), Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn wait_times_out_and_reholds_lock() {
        let cond = Condition::new(());
        let mut guard = cond.lock();
        let start = Instant::now();
        assert_eq!(cond.wait(&mut guard, Some(Duration::from_millis(30))), Ok(false));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(cond.mutex().is_owned_by_current());
        assert_eq!(cond.waiting(), 0);
    }

    #[test]
    fn notify_one_wakes_exactly_one() {
        let cond = Arc::new(Condition::new(()));
        let woken = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cond = cond.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    let mut guard = cond.lock();
                    let notified = cond.wait(&mut guard, None).unwrap();
                    woken.fetch_add(1, Ordering::SeqCst);
                    notified
                })
            })
            .collect();

        assert!(wait_until(|| cond.waiting() == 2, Duration::from_secs(2)));
        {
            let guard = cond.lock();
            assert_eq!(cond.notify(&guard, 1), Ok(1));
        }

        assert!(wait_until(|| woken.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(cond.waiting(), 1);

        {
            let guard = cond.lock();
            assert_eq!(cond.notify(&guard, 1), Ok(1));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(woken.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn notify_wakes_oldest_first() {
        let cond = Arc::new(Condition::new(Vec::<usize>::new()));

        let mut handles = Vec::new();
        for id in 0..3 {
            let cond_t = cond.clone();
            handles.push(thread::spawn(move || {
                let mut guard = cond_t.lock();
                cond_t.wait(&mut guard, None).unwrap();
                guard.push(id);
            }));
            // Arrival order is fixed by waiting for each thread to park.
            assert!(wait_until(|| cond.waiting() == id + 1, Duration::from_secs(2)));
        }

        for expected_len in 1..=3 {
            {
                let guard = cond.lock();
                assert_eq!(cond.notify(&guard, 1), Ok(1));
            }
            assert!(wait_until(
                || cond.lock().len() == expected_len,
                Duration::from_secs(2)
            ));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*cond.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn notify_n_is_capped_by_waiters_and_notify_all_wakes_everyone() {
        let cond = Arc::new(Condition::new(()));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let cond = cond.clone();
                thread::spawn(move || {
                    let mut guard = cond.lock();
                    cond.wait(&mut guard, None).unwrap()
                })
            })
            .collect();
        assert!(wait_until(|| cond.waiting() == 3, Duration::from_secs(2)));

        {
            let guard = cond.lock();
            assert_eq!(cond.notify(&guard, 2), Ok(2));
            assert_eq!(cond.notify_all(&guard), Ok(1));
            assert_eq!(cond.notify(&guard, 5), Ok(0));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn wait_for_sees_predicate_flip() {
        let cond = Arc::new(Condition::new(false));
        let setter = {
            let cond = cond.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                let mut guard = cond.lock();
                *guard = true;
                cond.notify_all(&guard).unwrap();
            })
        };

        let mut guard = cond.lock();
        let ok = cond
            .wait_for(&mut guard, |ready| *ready, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(ok);
        drop(guard);
        setter.join().unwrap();
    }

    #[test]
    fn wait_for_respects_fixed_deadline_despite_spurious_notifies() {
        let cond = Arc::new(Condition::new(false));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let noisy = {
            let cond = cond.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    {
                        let guard = cond.lock();
                        cond.notify_all(&guard).unwrap();
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let mut guard = cond.lock();
        let ok = cond.wait_for(&mut guard, |ready| *ready, Some(timeout)).unwrap();
        let elapsed = start.elapsed();
        drop(guard);
        stop.store(true, Ordering::SeqCst);
        noisy.join().unwrap();

        assert!(!ok);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[test]
    fn zero_timeout_wait_for_does_not_block() {
        let cond = Condition::new(false);
        let mut guard = cond.lock();
        let start = Instant::now();
        assert_eq!(cond.wait_for(&mut guard, |v| *v, Some(Duration::ZERO)), Ok(false));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
