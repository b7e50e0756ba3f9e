//! Utility modules shared across the node

pub mod logging;
pub mod retry;
pub mod time;

pub use logging::init_logging;
pub use retry::{with_backoff, BackoffPolicy};
pub use time::current_timestamp;
