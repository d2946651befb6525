//! Deterministic exponential backoff shared by the relay and the consumer.
//!
//! ```text
//! attempt:   1      2    3    4    5     6     7 ...
//! relay:   500ms   2s   4s   8s  16s   32s   60s (cap)
//! consumer:200ms   2s   4s   8s  16s   30s   30s (cap)
//! ```
//!
//! No jitter: claims are per row, so retries are already staggered by arrival time.
//!
//! # Example
//!
//! ```rust
//! use outbox_runtime::retry::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::relay();
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
//! assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(60));
//! ```

use std::time::Duration;

/// Backoff schedule: a flat floor for the first attempt, then doubling from
/// `base` until `cap`.
///
/// `delay(attempt) = floor` for `attempt <= 1`, otherwise
/// `min(base * 2^(attempt - 1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub floor: Duration,
    /// Unit that doubles per attempt from the second attempt on
    pub base: Duration,
    /// Upper bound on any delay
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(floor: Duration, base: Duration, cap: Duration) -> Self {
        Self { floor, base, cap }
    }

    /// Relay schedule: 500ms floor, 1s base, 60s cap.
    #[must_use]
    pub const fn relay() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
    }

    /// Consumer schedule: 200ms floor, 1s base, 30s cap.
    #[must_use]
    pub const fn consumer() -> Self {
        Self::new(
            Duration::from_millis(200),
            Duration::from_secs(1),
            Duration::from_secs(30),
        )
    }

    /// Delay before retrying after `attempt` attempts have failed.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.floor.min(self.cap);
        }

        // 2^31 base units already exceeds any sane cap
        let exponent = (attempt - 1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::relay()
    }
}
