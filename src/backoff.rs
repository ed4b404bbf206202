//! Pure attempt-count -> delay computation, per §4.2.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Source of jitter for [`BackoffStrategy`]. Exists as a trait so tests
/// can substitute a deterministic source instead of the process-seeded
/// default.
pub trait JitterSource: Send + Sync {
    /// Returns a value uniformly distributed in `[-1.0, 1.0]`.
    fn sample(&self) -> f64;
}

/// Seeded once from entropy when the owning [`BackoffStrategy`] (or
/// [`crate::MessageQueue`]) is constructed, then reused — the contract
/// only requires the seed to vary per process start, not per call.
pub struct RandJitter {
    rng: Mutex<SmallRng>,
}

impl Default for RandJitter {
    fn default() -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }
}

impl JitterSource for RandJitter {
    fn sample(&self) -> f64 {
        self.rng.lock().gen_range(-1.0..=1.0)
    }
}

/// `Delay(attempt) = min(base * 2^(attempt-1), cap) * (1 + jitter)`.
pub struct BackoffStrategy {
    base_ms: u64,
    cap_ms: u64,
    jitter: f64,
    jitter_source: Box<dyn JitterSource>,
}

impl BackoffStrategy {
    pub fn new(base_ms: u64, cap_ms: u64, jitter: f64) -> Self {
        Self {
            base_ms,
            cap_ms,
            jitter,
            jitter_source: Box::new(RandJitter::default()),
        }
    }

    /// Overrides the jitter source, for deterministic tests.
    pub fn with_jitter_source(mut self, source: Box<dyn JitterSource>) -> Self {
        self.jitter_source = source;
        self
    }

    /// Computes the delay, in milliseconds, for the given 1-based attempt
    /// count (the number of prior failures).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        // 2^(attempt-1), saturating so a large attempt count can't overflow
        // before the cap clamps it.
        let exp = attempt.saturating_sub(1).min(63);
        let unjittered = (self.base_ms as u128).saturating_mul(1u128 << exp);
        let capped = unjittered.min(self.cap_ms as u128) as f64;

        let jitter_fraction = self.jitter_source.sample().clamp(-1.0, 1.0) * self.jitter;
        let jittered = capped * (1.0 + jitter_fraction);
        jittered.max(0.0).round() as u64
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::new(1_000, 300_000, 0.1)
    }
}
