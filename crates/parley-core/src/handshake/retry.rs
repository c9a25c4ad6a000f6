//! Bounded exponential backoff for mailbox polling.

use std::time::Duration;

/// Delay before the second fetch.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(250);

/// Maximum fetches per handshake attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Cap on cumulative backoff delay per handshake attempt.
pub const DEFAULT_MAX_TOTAL_DELAY: Duration = Duration::from_secs(30);

/// Polling budget for one handshake attempt.
///
/// The delay doubles after every empty fetch. Polling stops when either
/// `max_attempts` fetches have been made or `max_total_delay` has been
/// spent waiting, whichever comes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first empty fetch
    pub initial_delay: Duration,
    /// Maximum number of fetches
    pub max_attempts: u32,
    /// Maximum cumulative delay
    pub max_total_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_total_delay: DEFAULT_MAX_TOTAL_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Unclamped delay after the `attempt`-th empty fetch (0-based).
    ///
    /// `initial_delay * 2^attempt`, saturating at `Duration::MAX`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Delay before the next fetch, or `None` if the budget is spent.
    ///
    /// `attempts` is the number of fetches made so far and `waited` the
    /// delay already spent. The result is clamped so the cumulative delay
    /// never exceeds `max_total_delay`.
    pub fn next_delay(&self, attempts: u32, waited: Duration) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }

        let remaining = self.max_total_delay.saturating_sub(waited);
        if remaining.is_zero() {
            return None;
        }

        Some(self.delay_for(attempts.saturating_sub(1)).min(remaining))
    }

    /// Worst-case total delay this policy can spend.
    pub fn budget(&self) -> Duration {
        let mut waited = Duration::ZERO;
        let mut attempts = 1;
        while let Some(delay) = self.next_delay(attempts, waited) {
            waited += delay;
            attempts += 1;
        }
        waited
    }
}
