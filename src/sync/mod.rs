//! Blocking synchronization primitives built over native threads.

pub use condition::Condition;
pub use deferred::Deferred;
pub use event::Event;
pub use mutex::{Mutex, MutexGuard, current_thread_ident};
pub use queue::{BoundedQueue, DEFAULT_QUEUE_CAPACITY};
pub use waiter::Waiter;

mod condition;
mod deferred;
mod event;
mod mutex;
mod queue;
mod waiter;
