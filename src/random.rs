//! Injectable randomness.
//!
//! Every stochastic decision in the engine (deployment outcome, completion
//! delay, incident triggers, metric noise and jitter) draws from a
//! [`RandomSource`], so tests can seed it or pin it to a fixed value.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub trait RandomSource: Send {
    /// Uniform sample in `[0, 1)`.
    fn uniform(&mut self) -> f64;

    /// Normal sample. A non-positive `std_dev` returns `mean`.
    fn gaussian(&mut self, mean: f64, std_dev: f64) -> f64;

    fn range(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        low + (high - low) * self.uniform()
    }

    /// Bernoulli trial with success probability `p`.
    fn chance(&mut self, p: f64) -> bool {
        self.uniform() < p
    }

    /// Index in `0..len`; `len` must be non-zero.
    fn index(&mut self, len: usize) -> usize {
        ((self.uniform() * len as f64) as usize).min(len.saturating_sub(1))
    }
}

/// `SmallRng`-backed source, reproducible when built from a seed.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: SmallRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
        }
    }
}

impl RandomSource for SeededRandom {
    fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    fn gaussian(&mut self, mean: f64, std_dev: f64) -> f64 {
        match Normal::new(mean, std_dev) {
            Ok(normal) if std_dev > 0.0 => normal.sample(&mut self.rng),
            _ => mean,
        }
    }
}

/// Source that always returns the same uniform value and the mean of every
/// normal draw.
///
/// `FixedRandom::new(0.0)` makes every Bernoulli trial succeed (forces
/// incidents to trigger); `FixedRandom::new(0.99)` makes a 95% success draw
/// fail (forces deployment failures).
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom {
    value: f64,
}

impl FixedRandom {
    pub fn new(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 0.999_999),
        }
    }
}

impl RandomSource for FixedRandom {
    fn uniform(&mut self) -> f64 {
        self.value
    }

    fn gaussian(&mut self, mean: f64, _std_dev: f64) -> f64 {
        mean
    }
}

/// Random source shared between the lifecycle simulator and the synthesizer.
#[derive(Clone)]
pub struct SharedRandom {
    inner: Arc<Mutex<Box<dyn RandomSource>>>,
}

impl SharedRandom {
    pub fn new(source: impl RandomSource + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(source))),
        }
    }

    /// Lock the source. A poisoned lock still hands out the generator; its
    /// state cannot be left logically inconsistent by a panic.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn RandomSource>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SharedRandom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRandom").finish_non_exhaustive()
    }
}
