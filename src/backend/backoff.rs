//! Transport-level retry with exponential backoff and jitter.
//!
//! Retries happen inside a single node call, bounded by the node timeout,
//! so a layer only ever sees the final outcome of each node. Hosted
//! providers such as Groq rate limit per minute; [`BackoffConfig::standard()`]
//! suits them.

use std::time::Duration;

/// How transient HTTP failures are retried before a node gives up.
///
/// # Example
///
/// ```
/// use llm_propagation::backend::BackoffConfig;
///
/// assert_eq!(BackoffConfig::default().max_retries, 0);
/// assert_eq!(BackoffConfig::standard().max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Retries after the first attempt. `0` disables retry.
    pub max_retries: u32,

    /// Base delay before the first retry.
    pub initial_delay: Duration,

    /// Growth factor per retry: `initial * multiplier^n`.
    pub multiplier: f64,

    /// Ceiling on any single delay.
    pub max_delay: Duration,

    pub jitter: JitterStrategy,

    /// HTTP statuses worth retrying.
    pub retryable_statuses: Vec<u16>,

    /// Use the provider's `Retry-After` hint instead of the computed delay.
    pub respect_retry_after: bool,
}

/// Randomization applied to each computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Exact delays. Mostly useful in tests.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`.
    Equal,
}

const RETRYABLE: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

impl BackoffConfig {
    /// No retry. A failed call fails its node immediately.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// 3 retries from 1s, doubling, capped at 60s, full jitter.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: RETRYABLE.to_vec(),
            respect_retry_after: true,
        }
    }

    /// 2 quick retries capped at 10s, for callers waiting on the answer.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            ..Self::standard()
        }
    }

    /// Delay before retry number `attempt + 1` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let secs = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(secs)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}
