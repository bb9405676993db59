pub mod bridge;
pub mod config;
pub mod error;
pub mod network;
pub mod serial;
pub mod sync;
pub mod thread;
pub mod transport;
pub mod utils;

pub mod prelude;
