//! Bounded retry policy for marketplace API calls
//!
//! Retries are transport-independent: the policy decides *whether* and *how
//! long* to wait, the client decides how to send. Two presets exist because
//! authorization codes are single-use — an exchange retried too eagerly can
//! race a duplicate delivery that already consumed the code — while identity
//! and other read calls are safe to repeat.

use std::time::Duration;

/// Maximum backoff between attempts regardless of exponent.
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Bounded retry policy: max attempt count plus exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Preset for token exchange and refresh: short budget, codes are
    /// single-use.
    pub fn exchange() -> Self {
        Self { max_retries: 2 }
    }

    /// Preset for identity and other read calls: safe to repeat.
    pub fn read() -> Self {
        Self { max_retries: 3 }
    }

    /// Whether a response status is transient: 429 or any 5xx.
    pub fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..=599).contains(&status)
    }

    /// Exponential backoff for the given attempt (0-based): 1s, 2s, 4s, ...
    /// capped at [`BACKOFF_CAP`].
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = 1u64 << attempt.min(6);
        Duration::from_secs(secs).min(BACKOFF_CAP)
    }

    /// Delay before the next attempt. A server-supplied `Retry-After` hint
    /// (seconds) wins over the computed backoff, still capped.
    pub fn delay(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        match retry_after {
            Some(secs) => Duration::from_secs(secs).min(BACKOFF_CAP),
            None => self.backoff(attempt),
        }
    }
}
