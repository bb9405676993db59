pub use cancel_token::*;
pub use health_flag::*;
pub use secret::*;

mod cancel_token;
mod health_flag;
pub mod logger;
mod secret;
