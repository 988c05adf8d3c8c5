//! Weighted random source for the behaviour model.
//!
//! Each loop owns its sampler, so a seeded sampler makes one loop's
//! decisions reproducible.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::content::MessageType;
use crate::config::MessageWeights;

pub struct WeightedSampler {
    rng: StdRng,
}

impl WeightedSampler {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `Some(seed)` gives a reproducible sampler.
    pub fn new(seed: Option<u64>) -> Self {
        seed.map(Self::seeded).unwrap_or_else(Self::from_entropy)
    }

    /// Uniform draw in [0, 1).
    pub fn unit(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }

    /// True with probability `p`.
    pub fn chance(&mut self, p: f64) -> bool {
        p > 0.0 && self.unit() < p
    }

    /// Uniform index in `0..len`; `None` for an empty range.
    pub fn index(&mut self, len: usize) -> Option<usize> {
        (len > 0).then(|| self.rng.gen_range(0..len))
    }

    /// Uniform integer in `[min, max]`.
    pub fn range_u64(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    /// Uniform duration in `[min_secs, max_secs]` with millisecond jitter.
    pub fn duration_secs(&mut self, min_secs: u64, max_secs: u64) -> Duration {
        if min_secs >= max_secs {
            return Duration::from_secs(min_secs);
        }
        let millis = self
            .rng
            .gen_range(min_secs.saturating_mul(1000)..=max_secs.saturating_mul(1000));
        Duration::from_millis(millis)
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut self.rng)
    }

    /// Up to `count` distinct items.
    pub fn pick_many<'a, T>(&mut self, items: &'a [T], count: usize) -> Vec<&'a T> {
        items.choose_multiple(&mut self.rng, count).collect()
    }

    /// One draw consumed against the cumulative type thresholds.
    pub fn message_type(&mut self, weights: &MessageWeights) -> MessageType {
        let draw = self.unit();
        select_type_for_draw(weights, draw)
    }
}

/// Walk the cumulative thresholds in selection order and return the first
/// type whose threshold exceeds `draw`; TEXT when the draw is past the sum.
pub fn select_type_for_draw(weights: &MessageWeights, draw: f64) -> MessageType {
    let mut cumulative = 0.0;
    for kind in MessageType::SELECTION_ORDER {
        let weight = weights.get(kind);
        if weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        if draw < cumulative {
            return kind;
        }
    }
    MessageType::Text
}
