//! Randomized exponential backoff for busy-wait loops.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential backoff with jitter.
///
/// Each instance owns its random generator, so concurrent retry loops never
/// share random state.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    rng: StdRng,
}

impl Backoff {
    /// Creates a backoff starting at `min` and doubling up to `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min,
            max: max.max(min),
            rng: StdRng::from_entropy(),
        }
    }

    /// Returns the next delay and doubles the base for the following call.
    ///
    /// The returned delay is drawn uniformly from `[base / 2, base]`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let millis = base.as_millis() as u64;
        if millis < 2 {
            return base;
        }
        Duration::from_millis(self.rng.gen_range(millis / 2..=millis))
    }
}
