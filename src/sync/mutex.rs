use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

const NO_OWNER: u64 = 0;

/// Process-unique identity of the calling thread. Never zero.
pub fn current_thread_ident() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static IDENT: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    IDENT.with(|id| *id)
}

/// Exclusive lock that remembers which thread holds it.
///
/// The owner identity is what lets a [`Condition`](super::Condition) refuse a
/// `wait`/`notify` from a thread that does not hold the lock. Release happens
/// only through [`MutexGuard`], which cannot leave the acquiring thread, so
/// the owner recorded here is always the thread that will unlock.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    owner: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: <RawMutex as parking_lot::lock_api::RawMutex>::INIT,
            owner: AtomicU64::new(NO_OWNER),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Block until the lock is held by the calling thread.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.acquire_raw();
        MutexGuard::new(self)
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            self.owner.store(current_thread_ident(), Ordering::Release);
            Some(MutexGuard::new(self))
        } else {
            None
        }
    }

    /// Snapshot; may be stale by the time the caller looks at it.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Identity of the current holder, if any.
    #[inline]
    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    /// Only reliable when asked by a thread about itself: another thread's
    /// ownership may change between the load and the comparison.
    #[inline]
    pub fn is_owned_by_current(&self) -> bool {
        self.is_locked() && self.owner.load(Ordering::Acquire) == current_thread_ident()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn acquire_raw(&self) {
        self.raw.lock();
        self.owner.store(current_thread_ident(), Ordering::Release);
    }

    /// # Safety
    /// The calling thread must hold the lock.
    unsafe fn release_raw(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
        unsafe { self.raw.unlock() };
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// Scoped ownership of a [`Mutex`]; the lock is released on drop, including
/// during unwinding.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    /// The mutex this guard holds.
    pub fn mutex(this: &Self) -> &'a Mutex<T> {
        this.mutex
    }

    /// Release the lock while `f` runs and take it back afterwards.
    ///
    /// Re-acquisition also happens if `f` unwinds, so the guard is always
    /// valid again when this returns or panics through the caller.
    pub fn unlocked<F, U>(this: &mut Self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        struct Relock<'b, T: ?Sized>(&'b Mutex<T>);

        impl<T: ?Sized> Drop for Relock<'_, T> {
            fn drop(&mut self) {
                self.0.acquire_raw();
            }
        }

        // SAFETY: the guard proves this thread holds the lock.
        unsafe { this.mutex.release_raw() };
        let _relock = Relock(this.mutex);
        f()
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held exclusively for the guard's lifetime.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard proves this thread holds the lock.
        unsafe { self.mutex.release_raw() };
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
