//! Random walk: periodic lookups of random targets to refresh far buckets.

use std::time::Instant;

use crate::common::{PeerId, ID_SIZE};

use super::config::RandomWalkConfig;

#[derive(Debug)]
/// Scheduling state of the random walk.
///
/// Walks come in periods of `queries_per_period` lookups spaced by `delay`;
/// after the last one the schedule waits out the remainder of `interval`.
pub(crate) struct RandomWalk {
    config: RandomWalkConfig,
    iteration: u64,
    next_at: Instant,
}

impl RandomWalk {
    pub fn new(config: RandomWalkConfig) -> Self {
        RandomWalk {
            config,
            iteration: 0,
            // First walk fires on the first tick.
            next_at: Instant::now(),
        }
    }

    // === Getters ===

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// True when a walk should be issued now.
    pub fn is_due(&self, now: Instant) -> bool {
        self.config.enabled && now >= self.next_at
    }

    // === Public Methods ===

    /// A fresh 256-bit target, dressed up as a peer id.
    pub fn random_target(&self) -> PeerId {
        let mut hash = [0u8; ID_SIZE];
        getrandom::getrandom(&mut hash).expect("getrandom");

        PeerId::from_hash(hash)
    }

    /// Account for an issued walk and schedule the next one.
    pub fn advance(&mut self, now: Instant) {
        let iteration = self.iteration;
        self.iteration += 1;

        let period = self.config.queries_per_period.max(1) as u64;

        let delay = if iteration % period != 0 {
            self.config.delay
        } else {
            self.config
                .interval
                .saturating_sub(self.config.delay * period as u32)
        };

        self.next_at = now + delay;
    }
}
