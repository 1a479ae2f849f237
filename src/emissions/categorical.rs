//! Categorical confusion channel.
//!
//! One Dirichlet-categorical emission distribution per clean state.

use super::Emission;
use crate::distributions::{DirichletCategorical, Distribution};
use crate::error::Result;
use crate::Prng;

#[derive(Debug, Clone)]
pub struct CategoricalEmission {
    emission_dists: Vec<DirichletCategorical>,
    n: f64,
}

impl CategoricalEmission {
    pub fn new(num_states: usize) -> Self {
        assert!(num_states > 0, "categorical emission needs states");
        CategoricalEmission {
            emission_dists: vec![DirichletCategorical::new(num_states); num_states],
            n: 0.0,
        }
    }

    fn state(&self, x: i64) -> usize {
        assert!(
            x >= 0 && (x as usize) < self.emission_dists.len(),
            "state {x} out of range 0..{}",
            self.emission_dists.len()
        );
        x as usize
    }
}

impl Distribution<(i64, i64)> for CategoricalEmission {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &(i64, i64), weight: f64) {
        self.n += weight;
        let clean = self.state(x.0);
        self.emission_dists[clean].incorporate_weighted(&x.1, weight);
    }

    fn logp(&self, x: &(i64, i64)) -> f64 {
        self.emission_dists[self.state(x.0)].logp(&x.1)
    }

    fn logp_score(&self) -> f64 {
        self.emission_dists
            .iter()
            .map(Distribution::logp_score)
            .sum()
    }

    fn sample(&mut self, _prng: &mut Prng) -> (i64, i64) {
        unreachable!("sample() is never called on an emission")
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        for dist in &mut self.emission_dists {
            dist.transition_hyperparameters(prng)?;
        }
        Ok(())
    }
}

impl Emission<i64> for CategoricalEmission {
    fn sample_corrupted(&mut self, clean: &i64, prng: &mut Prng) -> i64 {
        let state = self.state(*clean);
        self.emission_dists[state].sample(prng)
    }

    fn propose_clean(&self, corrupted: &[i64], _prng: &mut Prng) -> i64 {
        // Brute force: score every possible clean state.
        let mut best_clean = 0;
        let mut best_logp = f64::NEG_INFINITY;
        for (state, dist) in self.emission_dists.iter().enumerate() {
            let lp: f64 = corrupted.iter().map(|c| dist.logp(c)).sum();
            if lp > best_logp {
                best_clean = state as i64;
                best_logp = lp;
            }
        }
        best_clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_round_trip() {
        let mut emission = CategoricalEmission::new(3);
        emission.incorporate(&(0, 1));
        let score = emission.logp_score();
        emission.incorporate(&(2, 2));
        emission.unincorporate(&(2, 2));
        assert!((emission.logp_score() - score).abs() < 1e-12);
    }

    #[test]
    fn test_per_state_confusion() {
        let mut emission = CategoricalEmission::new(2);
        // State 0 reliably emits 1.
        for _ in 0..20 {
            emission.incorporate(&(0, 1));
        }
        assert!(emission.logp(&(0, 1)) > emission.logp(&(0, 0)));
        // State 1 is untouched and stays uniform.
        assert!((emission.logp(&(1, 0)) - emission.logp(&(1, 1))).abs() < 1e-12);
    }

    #[test]
    fn test_propose_clean_picks_most_likely_state() {
        let mut prng = Prng::seed_from_u64(0);
        let mut emission = CategoricalEmission::new(3);
        for _ in 0..20 {
            emission.incorporate(&(2, 0));
        }
        assert_eq!(emission.propose_clean(&[0, 0, 0], &mut prng), 2);
    }

    #[test]
    fn test_sample_corrupted_in_range() {
        let mut prng = Prng::seed_from_u64(1);
        let mut emission = CategoricalEmission::new(4);
        for _ in 0..10 {
            let dirty = emission.sample_corrupted(&1, &mut prng);
            assert!((0..4).contains(&dirty));
        }
    }
}
