use std::num::NonZeroU32;
use std::time::Duration;

/// Delay schedule for per-chunk fetch retries.
///
/// The default is a fixed 500 ms delay with no attempt cap: a chunk that never
/// becomes readable keeps its fetch task retrying until the download is
/// cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per subsequent attempt. `1.0` keeps the delay fixed.
    pub backoff_factor: f64,
    /// Attempts a single fetch task makes before giving up. `None` = forever.
    pub max_attempts: Option<NonZeroU32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(500))
    }
}

impl RetryPolicy {
    /// Constant delay, unbounded attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            max_attempts: None,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Whether `attempts` failed attempts have used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max.get())
    }
}
