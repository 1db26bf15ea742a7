// ABOUTME: Sonata request engine that every API call funnels through
// ABOUTME: Fresh token per attempt, structured HTTP errors, and bounded cancellable retries

pub mod error;
pub mod executor;
pub mod retry;

pub use error::{ClientError, ClientResult, HttpError};
pub use executor::RequestExecutor;
pub use retry::{compute_delay, parse_retry_after, RetryConfig};
