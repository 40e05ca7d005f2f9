//! Sources of randomness for fill simulation.
//!
//! Every random decision the simulator makes goes through [`FillSampler`], so
//! tests can replay exact sequences with [`ScriptedFillSampler`] and runs can
//! be reproduced by seeding [`RandomFillSampler`].

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

pub trait FillSampler: Send + Sync {
    /// Whether the transaction fails outright, given failure probability `rate`.
    fn transaction_fails(&self, rate: f64) -> bool;

    /// Network delay in `[min_ms, max_ms]`.
    fn delay_ms(&self, min_ms: u64, max_ms: u64) -> u64;

    /// Fraction of the order that fills, or `None` for a full fill.
    fn partial_fill(&self, rate: f64, min_pct: f64, max_pct: f64) -> Option<f64>;

    /// Adverse price penalty as a fraction, or `None` when no sandwich happens.
    fn mev_penalty(&self, rate: f64, min_pct: f64, max_pct: f64) -> Option<f64>;
}

// =============================================================================
// Random Sampler
// =============================================================================

pub struct RandomFillSampler {
    rng: RwLock<StdRng>,
}

impl std::fmt::Debug for RandomFillSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomFillSampler").finish_non_exhaustive()
    }
}

impl RandomFillSampler {
    /// Seeded when `seed` is set, system entropy otherwise.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: RwLock::new(rng),
        }
    }

    fn roll(&self) -> f64 {
        self.rng.write().gen::<f64>()
    }

    fn between(&self, min: f64, max: f64) -> f64 {
        if max <= min {
            return min;
        }
        self.rng.write().gen_range(min..=max)
    }
}

impl FillSampler for RandomFillSampler {
    fn transaction_fails(&self, rate: f64) -> bool {
        rate > 0.0 && self.roll() < rate
    }

    fn delay_ms(&self, min_ms: u64, max_ms: u64) -> u64 {
        if max_ms <= min_ms {
            return min_ms;
        }
        self.rng.write().gen_range(min_ms..=max_ms)
    }

    fn partial_fill(&self, rate: f64, min_pct: f64, max_pct: f64) -> Option<f64> {
        (rate > 0.0 && self.roll() < rate).then(|| self.between(min_pct, max_pct))
    }

    fn mev_penalty(&self, rate: f64, min_pct: f64, max_pct: f64) -> Option<f64> {
        (rate > 0.0 && self.roll() < rate).then(|| self.between(min_pct, max_pct))
    }
}

// =============================================================================
// Scripted Sampler
// =============================================================================

#[derive(Debug, Default)]
struct Script {
    failures: VecDeque<bool>,
    delays: VecDeque<u64>,
    fills: VecDeque<Option<f64>>,
    mev: VecDeque<Option<f64>>,
}

/// Replays queued outcomes in order. An exhausted queue yields success, zero
/// delay, a full fill, and no MEV. Rates and ranges are ignored.
#[derive(Debug, Default)]
pub struct ScriptedFillSampler {
    script: Mutex<Script>,
}

impl ScriptedFillSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_failures(self, outcomes: impl IntoIterator<Item = bool>) -> Self {
        self.script.lock().failures.extend(outcomes);
        self
    }

    #[must_use]
    pub fn with_delays(self, delays_ms: impl IntoIterator<Item = u64>) -> Self {
        self.script.lock().delays.extend(delays_ms);
        self
    }

    #[must_use]
    pub fn with_fills(self, fractions: impl IntoIterator<Item = Option<f64>>) -> Self {
        self.script.lock().fills.extend(fractions);
        self
    }

    #[must_use]
    pub fn with_mev(self, penalties: impl IntoIterator<Item = Option<f64>>) -> Self {
        self.script.lock().mev.extend(penalties);
        self
    }
}

impl FillSampler for ScriptedFillSampler {
    fn transaction_fails(&self, _rate: f64) -> bool {
        self.script.lock().failures.pop_front().unwrap_or(false)
    }

    fn delay_ms(&self, _min_ms: u64, _max_ms: u64) -> u64 {
        self.script.lock().delays.pop_front().unwrap_or(0)
    }

    fn partial_fill(&self, _rate: f64, _min_pct: f64, _max_pct: f64) -> Option<f64> {
        self.script.lock().fills.pop_front().flatten()
    }

    fn mev_penalty(&self, _rate: f64, _min_pct: f64, _max_pct: f64) -> Option<f64> {
        self.script.lock().mev.pop_front().flatten()
    }
}
