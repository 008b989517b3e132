//! Run identifier generation.
//!
//! Generators are injected per actor or per pool so tests can use a
//! deterministic sequence while deployments draw from a CSPRNG.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::ids::RunId;

/// Source of fresh run identifiers.
pub trait RunIdGenerator: Send + Sync {
    /// Produce the next identifier.
    fn next_run_id(&self) -> RunId;
}

/// Hands out consecutive identifiers from a starting value.
#[derive(Debug)]
pub struct SequentialRunIds {
    next: AtomicU64,
}

impl SequentialRunIds {
    /// Start counting at `start`.
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl Default for SequentialRunIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl RunIdGenerator for SequentialRunIds {
    fn next_run_id(&self) -> RunId {
        RunId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Draws identifiers from a ChaCha20 stream.
#[derive(Debug)]
pub struct RandomRunIds {
    rng: Mutex<ChaCha20Rng>,
}

impl RandomRunIds {
    /// Seed from operating system entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    /// Seed deterministically, for reproducible tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomRunIds {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl RunIdGenerator for RandomRunIds {
    fn next_run_id(&self) -> RunId {
        RunId::new(self.rng.lock().next_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialRunIds::starting_at(10);
        assert_eq!(ids.next_run_id(), RunId::new(10));
        assert_eq!(ids.next_run_id(), RunId::new(11));
    }

    #[test]
    fn test_seeded_random_ids_are_reproducible() {
        let a = RandomRunIds::seeded(42);
        let b = RandomRunIds::seeded(42);
        let first: Vec<_> = (0..4).map(|_| a.next_run_id()).collect();
        let second: Vec<_> = (0..4).map(|_| b.next_run_id()).collect();
        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
    }
}
