//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Backoff for re-publishing a nacked message.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Max attempts: `max_retries`
/// - Jitter enabled
pub fn nack_backoff(max_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_retries)
        .with_jitter()
}

/// Delay before retry number `retry` (zero-based), or `None` once the
/// backoff is exhausted.
pub fn nack_delay(max_retries: usize, retry: usize) -> Option<Duration> {
    nack_backoff(max_retries).build().nth(retry)
}
