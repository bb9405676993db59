//! Restartable managed threads and a lazily grown worker pool.

use std::any::Any;

pub use managed::{ManagedThread, ThreadTarget};
pub use pool::ThreadPool;

mod managed;
mod pool;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic (unknown type)".into())
}
