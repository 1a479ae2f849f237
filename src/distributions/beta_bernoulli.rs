//! Beta-Bernoulli conjugate family over booleans.

use statrs::function::beta::ln_beta;

use super::{sample_from_grid, Distribution};
use crate::error::Result;
use crate::math::log_linspace;
use crate::Prng;

#[derive(Debug, Clone)]
pub struct BetaBernoulli {
    pub alpha: f64,
    pub beta: f64,
    /// Total weight of observations.
    pub n: f64,
    /// Weighted sum of observed values.
    pub s: f64,
    alpha_grid: Vec<f64>,
    beta_grid: Vec<f64>,
}

impl BetaBernoulli {
    pub fn new() -> Self {
        BetaBernoulli {
            alpha: 1.0,
            beta: 1.0,
            n: 0.0,
            s: 0.0,
            alpha_grid: log_linspace(1e-4, 1e4, 10, true),
            beta_grid: log_linspace(1e-4, 1e4, 10, true),
        }
    }
}

impl Default for BetaBernoulli {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution<bool> for BetaBernoulli {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &bool, weight: f64) {
        self.n += weight;
        if *x {
            self.s += weight;
        }
        assert!(self.n > -1e-9, "negative observation count");
        assert!(self.s > -1e-9, "negative success count");
    }

    fn logp(&self, x: &bool) -> f64 {
        let log_denom = (self.n + self.alpha + self.beta).ln();
        let log_numer = if *x {
            (self.s + self.alpha).ln()
        } else {
            (self.n - self.s + self.beta).ln()
        };
        log_numer - log_denom
    }

    fn logp_score(&self) -> f64 {
        ln_beta(self.s + self.alpha, self.n - self.s + self.beta) - ln_beta(self.alpha, self.beta)
    }

    fn sample(&mut self, prng: &mut Prng) -> bool {
        use rand::Rng;
        let p = self.logp(&true).exp();
        prng.gen::<f64>() < p
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        let mut logps = Vec::new();
        let mut hypers = Vec::new();
        for alpha in self.alpha_grid.clone() {
            for beta in self.beta_grid.clone() {
                self.alpha = alpha;
                self.beta = beta;
                logps.push(self.logp_score());
                hypers.push((alpha, beta));
            }
        }
        let i = sample_from_grid(
            "BetaBernoulli",
            &logps,
            format_args!("n={} s={}", self.n, self.s),
            prng,
        )?;
        (self.alpha, self.beta) = hypers[i];
        Ok(())
    }
}
