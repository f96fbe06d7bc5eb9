use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff for infrastructure retries.
///
/// Each failure doubles the delay up to `max`; up to a quarter of the delay
/// is added as jitter so a fleet of processes does not retry in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), attempt: 0 }
    }

    /// Delay without jitter for the current attempt
    fn raw_delay(&self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(multiplier).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.raw_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter_cap = delay.as_millis() as u64 / 4;
        let jitter = if jitter_cap > 0 { rand::thread_rng().gen_range(0..=jitter_cap) } else { 0 };
        (delay + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
