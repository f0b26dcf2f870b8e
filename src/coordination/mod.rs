//! Cross-pipeline coordination: retry policy, endpoint throttling, bounded
//! polling and cancellation

pub mod poll;
pub mod retry;
pub mod shutdown;
pub mod throttle;

pub use poll::{poll_until, PollSchedule};
pub use retry::{RetryExecutor, RetryPolicy};
pub use shutdown::{CancelToken, Shutdown};
pub use throttle::{EndpointClass, Throttle};
