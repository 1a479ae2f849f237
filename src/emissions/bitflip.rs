//! Deterministic bit-flip channel.
//!
//! Always emits `!clean`; pairs with equal halves are rejected outright.
//! Most models wrap this in [`super::Sometimes`].

use super::Emission;
use crate::distributions::Distribution;
use crate::error::Result;
use crate::Prng;

#[derive(Debug, Clone, Default)]
pub struct BitFlip {
    n: f64,
}

impl BitFlip {
    pub fn new() -> Self {
        BitFlip { n: 0.0 }
    }
}

impl Distribution<(bool, bool)> for BitFlip {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &(bool, bool), weight: f64) {
        assert_ne!(x.0, x.1, "BitFlip saw an unflipped pair");
        self.n += weight;
    }

    fn logp(&self, x: &(bool, bool)) -> f64 {
        assert_ne!(x.0, x.1, "BitFlip saw an unflipped pair");
        0.0
    }

    fn logp_score(&self) -> f64 {
        0.0
    }

    fn sample(&mut self, _prng: &mut Prng) -> (bool, bool) {
        unreachable!("sample() is never called on an emission")
    }

    fn transition_hyperparameters(&mut self, _prng: &mut Prng) -> Result<()> {
        // No hyperparameters to transition.
        Ok(())
    }
}

impl Emission<bool> for BitFlip {
    fn sample_corrupted(&mut self, clean: &bool, _prng: &mut Prng) -> bool {
        !clean
    }

    fn propose_clean(&self, corrupted: &[bool], _prng: &mut Prng) -> bool {
        !corrupted[0]
    }
}
