use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter, capped. Delays land in `[d/2, d]` where
/// `d = min(base * 2^attempt, cap)`, so a fleet of dispatchers does not
/// reconnect in lockstep.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(self.cap);
        let half = capped / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
