use std::time::Duration;

use crate::rng::SeededRng;

// In seconds.
const JITTER_RANGE: f32 = 0.5;

// The jitter never pushes the timeout below this.
const MIN_RTO: Duration = Duration::from_millis(50);

/// Retransmission timeout schedule for one flight.
///
/// Starts at `start_rto`, doubles for every attempt up to `max_rto`, and allows
/// `retries` attempts. A ±0.25s jitter is applied on top of the base value.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    start_rto: Duration,
    max_rto: Duration,
    retries: usize,
    rto: Duration,
    jitter: f32,
    left: usize,
}

impl ExponentialBackoff {
    pub fn new(
        start_rto: Duration,
        max_rto: Duration,
        retries: usize,
        rng: &mut SeededRng,
    ) -> Self {
        Self {
            start_rto,
            max_rto,
            retries,
            rto: start_rto.min(max_rto),
            jitter: Self::jitter(rng),
            left: retries,
        }
    }

    pub fn reset(&mut self, rng: &mut SeededRng) {
        self.rto = self.start_rto.min(self.max_rto);
        self.jitter = Self::jitter(rng);
        self.left = self.retries;
    }

    /// Current timeout including jitter.
    pub fn rto(&self) -> Duration {
        if self.jitter < 0.0 {
            let duration = Duration::from_secs_f32(self.jitter.abs());
            self.rto.saturating_sub(duration)
        } else {
            self.rto + Duration::from_secs_f32(self.jitter)
        }
        .max(MIN_RTO)
    }

    /// Current timeout without jitter.
    pub fn base_rto(&self) -> Duration {
        self.rto
    }

    // A value between -0.25s and 0.25s
    fn jitter(rng: &mut SeededRng) -> f32 {
        rng.unit() * JITTER_RANGE - (JITTER_RANGE / 2.0)
    }

    pub fn attempt(&mut self, rng: &mut SeededRng) {
        let Some(n) = self.left.checked_sub(1) else {
            return;
        };

        self.left = n;
        self.jitter = Self::jitter(rng);
        self.rto = self.rto.saturating_mul(2).min(self.max_rto);
    }

    pub fn can_retry(&self) -> bool {
        self.left > 0
    }

    /// Number of attempts made since the last reset.
    pub fn attempts(&self) -> usize {
        self.retries - self.left
    }
}
