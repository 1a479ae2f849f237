//! Gate wrapper: apply the inner emission sometimes, copy the clean value
//! through otherwise.
//!
//! The gate is a Beta-Bernoulli over "did the emission fire". With
//! `dirty_can_equal_clean` the inner channel may itself produce an
//! unmodified copy, and an equal pair is credited fractionally to both
//! explanations; without it an equal pair always means the gate stayed
//! closed. Never set `dirty_can_equal_clean` when the inner `logp` is a
//! density rather than a discrete probability.

use super::Emission;
use crate::distributions::{BetaBernoulli, Distribution};
use crate::error::Result;
use crate::Prng;

pub struct Sometimes<V: Clone + PartialEq + 'static> {
    gate: BetaBernoulli,
    base: Box<dyn Emission<V>>,
    dirty_can_equal_clean: bool,
}

impl<V: Clone + PartialEq + 'static> Sometimes<V> {
    pub fn new(base: Box<dyn Emission<V>>, dirty_can_equal_clean: bool) -> Self {
        Sometimes {
            gate: BetaBernoulli::new(),
            base,
            dirty_can_equal_clean,
        }
    }
}

impl<V: Clone + PartialEq + 'static> Distribution<(V, V)> for Sometimes<V> {
    fn count(&self) -> f64 {
        self.gate.count()
    }

    fn incorporate_weighted(&mut self, x: &(V, V), weight: f64) {
        if x.0 != x.1 {
            self.gate.incorporate_weighted(&true, weight);
            self.base.incorporate_weighted(x, weight);
            return;
        }
        if self.dirty_can_equal_clean {
            let p_fired = (self.gate.logp(&true) + self.base.logp(x)).exp();
            self.gate.incorporate_weighted(&true, p_fired * weight);
            self.base.incorporate_weighted(x, p_fired * weight);
            self.gate
                .incorporate_weighted(&false, (1.0 - p_fired) * weight);
            return;
        }
        self.gate.incorporate_weighted(&false, weight);
    }

    fn logp(&self, x: &(V, V)) -> f64 {
        if x.0 != x.1 {
            return self.gate.logp(&true) + self.base.logp(x);
        }
        if !self.dirty_can_equal_clean {
            return self.gate.logp(&false);
        }
        let closed = self.gate.logp(&false).exp();
        let fired = (self.gate.logp(&true) + self.base.logp(x)).exp();
        (closed + fired).ln()
    }

    fn logp_score(&self) -> f64 {
        self.gate.logp_score() + self.base.logp_score()
    }

    fn sample(&mut self, _prng: &mut Prng) -> (V, V) {
        unreachable!("sample() is never called on an emission")
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        self.base.transition_hyperparameters(prng)?;
        self.gate.transition_hyperparameters(prng)
    }
}

impl<V: Clone + PartialEq + 'static> Emission<V> for Sometimes<V> {
    fn sample_corrupted(&mut self, clean: &V, prng: &mut Prng) -> V {
        if self.gate.sample(prng) {
            self.base.sample_corrupted(clean, prng)
        } else {
            clean.clone()
        }
    }

    fn propose_clean(&self, corrupted: &[V], _prng: &mut Prng) -> V {
        // Approximate the maximum likelihood clean value by the mode of
        // the corrupted list.
        let mut mode = &corrupted[0];
        let mut max_count = 0;
        for candidate in corrupted {
            let count = corrupted.iter().filter(|c| *c == candidate).count();
            if count > max_count {
                max_count = count;
                mode = candidate;
            }
        }
        mode.clone()
    }
}
