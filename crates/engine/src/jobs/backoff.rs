use std::time::Duration;

use rand::Rng;

/// Caller-side delay schedule for poll loops and retries.
///
/// The orchestrator never sleeps; a caller asks for `delay(attempt)` and
/// decides itself when to stop.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    /// The same delay every time.
    pub fn fixed(delay: Duration) -> Self {
        Backoff {
            initial: delay,
            max: delay,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Doubling delays from `initial`, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max: max.max(initial),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        self
    }

    /// Shave up to `fraction` (0..=1) off each delay at random.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Delay before attempt `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt.min(64) as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let keep = rand::thread_rng().gen_range((1.0 - self.jitter)..=1.0);
        base.mul_f64(keep)
    }
}

impl Default for Backoff {
    /// 1s doubling to 30s with 20% jitter.
    fn default() -> Self {
        Backoff::exponential(Duration::from_secs(1), Duration::from_secs(30)).with_jitter(0.2)
    }
}
