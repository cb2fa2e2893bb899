//! Exponential-backoff-with-jitter retry delay, modeled on the
//! `RetryStrategy`/`RetryBackoffType` shape used for outbound send retries
//! elsewhere in the ecosystem, with this agent's own min/max/factor budget
//! (min 5s, max 5m, factor 1.2) in place of a max-retries/linear default.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryBudget {
    min_delay: Duration,
    max_delay: Duration,
    factor: f64,
}

impl RetryBudget {
    pub fn new(min_secs: u64, max_secs: u64, factor: f64) -> Self {
        Self {
            min_delay: Duration::from_secs(min_secs),
            max_delay: Duration::from_secs(max_secs),
            factor,
        }
    }

    /// Delay before the given attempt (1-indexed). Grows by `factor` each
    /// attempt, capped at `max_delay`, then jittered by +/-20%.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let base = self.min_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());

        let mut rng = rand::thread_rng();
        let jitter_frac: f64 = rng.gen_range(0.8..=1.2);
        Duration::from_secs_f64((capped * jitter_frac).max(0.0))
    }

    /// Honor a server-supplied `Retry-After` value (seconds) when present,
    /// otherwise fall back to the computed backoff delay.
    pub fn delay_for_retry_after(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        match retry_after_secs {
            Some(secs) => Duration::from_secs(secs).min(self.max_delay),
            None => self.delay_for_attempt(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps_at_max() {
        let budget = RetryBudget::new(5, 300, 1.2);
        let d1 = budget.delay_for_attempt(1);
        assert!(d1.as_secs_f64() >= 4.0 && d1.as_secs_f64() <= 6.0);

        let d_large = budget.delay_for_attempt(50);
        assert!(d_large <= Duration::from_secs_f64(300.0 * 1.2));
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let budget = RetryBudget::new(5, 300, 1.2);
        let d = budget.delay_for_retry_after(1, Some(42));
        assert_eq!(d, Duration::from_secs(42));
    }
}
