//! Dirichlet-categorical conjugate family over a fixed number of
//! categories.

use statrs::function::gamma::ln_gamma;

use super::{sample_from_grid, Distribution, ALPHA_GRID};
use crate::error::Result;
use crate::math::choice;
use crate::Prng;

#[derive(Debug, Clone)]
pub struct DirichletCategorical {
    /// Symmetric concentration applied to every category.
    pub alpha: f64,
    /// Weighted observation counts per category.
    pub counts: Vec<f64>,
    /// Total weight of observations.
    pub n: f64,
}

impl DirichletCategorical {
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "categorical needs at least one category");
        DirichletCategorical {
            alpha: 1.0,
            counts: vec![0.0; k],
            n: 0.0,
        }
    }

    pub fn num_categories(&self) -> usize {
        self.counts.len()
    }

    fn index(&self, x: i64) -> usize {
        assert!(
            x >= 0 && (x as usize) < self.counts.len(),
            "category {x} out of range 0..{}",
            self.counts.len()
        );
        x as usize
    }
}

impl Distribution<i64> for DirichletCategorical {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &i64, weight: f64) {
        let index = self.index(*x);
        self.counts[index] += weight;
        self.n += weight;
    }

    fn logp(&self, x: &i64) -> f64 {
        let index = self.index(*x);
        let numer = (self.alpha + self.counts[index]).ln();
        let denom = (self.n + self.alpha * self.counts.len() as f64).ln();
        numer - denom
    }

    fn logp_score(&self) -> f64 {
        let k = self.counts.len() as f64;
        let a = self.alpha * k;
        let lg: f64 = self.counts.iter().map(|x| ln_gamma(x + self.alpha)).sum();
        ln_gamma(a) - ln_gamma(a + self.n) + lg - k * ln_gamma(self.alpha)
    }

    fn sample(&mut self, prng: &mut Prng) -> i64 {
        let weights: Vec<f64> = self.counts.iter().map(|c| c + self.alpha).collect();
        choice(&weights, prng) as i64
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        let mut logps = Vec::new();
        let mut alphas = Vec::new();
        for alpha in ALPHA_GRID {
            self.alpha = alpha;
            logps.push(self.logp_score());
            alphas.push(alpha);
        }
        let i = sample_from_grid(
            "DirichletCategorical",
            &logps,
            format_args!("counts={:?}", self.counts),
            prng,
        )?;
        self.alpha = alphas[i];
        Ok(())
    }

    fn nearest(&self, x: &i64) -> i64 {
        (*x).clamp(0, self.counts.len() as i64 - 1)
    }
}
