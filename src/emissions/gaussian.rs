//! Additive Gaussian noise channel.
//!
//! Models `dirty - clean` with a zero-mean normal whose variance carries
//! an inverse-gamma prior.

use super::Emission;
use crate::distributions::{Distribution, ZeroMeanNormal};
use crate::error::Result;
use crate::Prng;

#[derive(Debug, Clone, Default)]
pub struct GaussianEmission {
    zmn: ZeroMeanNormal,
    n: f64,
}

impl GaussianEmission {
    pub fn new() -> Self {
        GaussianEmission {
            zmn: ZeroMeanNormal::new(),
            n: 0.0,
        }
    }
}

impl Distribution<(f64, f64)> for GaussianEmission {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &(f64, f64), weight: f64) {
        self.n += weight;
        self.zmn.incorporate_weighted(&(x.1 - x.0), weight);
    }

    fn logp(&self, x: &(f64, f64)) -> f64 {
        self.zmn.logp(&(x.1 - x.0))
    }

    fn logp_score(&self) -> f64 {
        self.zmn.logp_score()
    }

    fn sample(&mut self, _prng: &mut Prng) -> (f64, f64) {
        unreachable!("sample() is never called on an emission")
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        self.zmn.transition_hyperparameters(prng)
    }
}

impl Emission<f64> for GaussianEmission {
    fn sample_corrupted(&mut self, clean: &f64, prng: &mut Prng) -> f64 {
        clean + self.zmn.sample(prng)
    }

    fn propose_clean(&self, corrupted: &[f64], _prng: &mut Prng) -> f64 {
        // The mean is the maximum likelihood estimate of the clean value.
        let mut mean = 0.0;
        let mut count = 0.0;
        for c in corrupted {
            count += 1.0;
            mean += (c - mean) / count;
        }
        mean
    }
}
