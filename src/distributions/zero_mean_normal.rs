//! Normal distribution with known zero mean and inverse-gamma prior on the
//! variance.
//!
//! Not a data model in its own right: it backs the Gaussian emission,
//! which models the difference `dirty - clean`.

use std::f64::consts::PI;

use rand::distributions::Distribution as Sampler;
use statrs::distribution::StudentsT;
use statrs::function::gamma::ln_gamma;

use super::{sample_from_grid, Distribution, ALPHA_GRID};
use crate::error::Result;
use crate::Prng;

const BETA_GRID: [f64; 9] = ALPHA_GRID;

/// Log density of a location-scale t distribution with zero mean.
fn log_t_distribution(x: f64, v: f64, variance: f64) -> f64 {
    let v_shift = (v + 1.0) / 2.0;
    ln_gamma(v_shift)
        - ln_gamma(v / 2.0)
        - 0.5 * (PI * v * variance).ln()
        - v_shift * (x * x / (variance * v)).ln_1p()
}

#[derive(Debug, Clone)]
pub struct ZeroMeanNormal {
    pub alpha: f64,
    pub beta: f64,
    /// Running mean of squared observations.
    pub var: f64,
    /// Total weight of observations.
    pub n: f64,
}

impl ZeroMeanNormal {
    pub fn new() -> Self {
        ZeroMeanNormal {
            alpha: 1.0,
            beta: 1.0,
            var: 0.0,
            n: 0.0,
        }
    }

    fn posterior(&self) -> (f64, f64) {
        let alpha_n = self.alpha + self.n / 2.0;
        let beta_n = self.beta + 0.5 * self.var * self.n;
        (alpha_n, beta_n)
    }
}

impl Default for ZeroMeanNormal {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution<f64> for ZeroMeanNormal {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &f64, weight: f64) {
        self.n += weight;
        if self.n == 0.0 {
            self.var = 0.0;
            return;
        }
        self.var += weight * (x * x - self.var) / self.n;
    }

    fn logp(&self, x: &f64) -> f64 {
        // Posterior predictive, equation (119) of Murphy's conjugate
        // Gaussian notes.
        let (alpha_n, beta_n) = self.posterior();
        let t_variance = beta_n / alpha_n;
        log_t_distribution(*x, 2.0 * alpha_n, t_variance)
    }

    fn logp_score(&self) -> f64 {
        let (alpha_n, beta_n) = self.posterior();
        self.alpha * self.beta.ln() - ln_gamma(self.alpha) - (self.n / 2.0) * (2.0 * PI).ln()
            + ln_gamma(alpha_n)
            - alpha_n * beta_n.ln()
    }

    fn sample(&mut self, prng: &mut Prng) -> f64 {
        let (alpha_n, beta_n) = self.posterior();
        let t_variance = beta_n / alpha_n;
        let t = StudentsT::new(0.0, 1.0, 2.0 * alpha_n).expect("posterior dof is positive");
        t.sample(prng) * t_variance.sqrt()
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        let mut logps = Vec::new();
        let mut hypers = Vec::new();
        for alpha in ALPHA_GRID {
            for beta in BETA_GRID {
                self.alpha = alpha;
                self.beta = beta;
                logps.push(self.logp_score());
                hypers.push((alpha, beta));
            }
        }
        let i = sample_from_grid(
            "ZeroMeanNormal",
            &logps,
            format_args!("n={} var={}", self.n, self.var),
            prng,
        )?;
        (self.alpha, self.beta) = hypers[i];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_round_trip() {
        let mut zmn = ZeroMeanNormal::new();
        zmn.incorporate(&0.7);
        let score = zmn.logp_score();
        zmn.incorporate(&-0.3);
        zmn.unincorporate(&-0.3);
        assert!((zmn.logp_score() - score).abs() < 1e-9);
    }

    #[test]
    fn test_logp_symmetric_about_zero() {
        let mut zmn = ZeroMeanNormal::new();
        zmn.incorporate(&0.5);
        assert!((zmn.logp(&1.2) - zmn.logp(&-1.2)).abs() < 1e-12);
    }

    #[test]
    fn test_small_deviations_more_likely() {
        let mut zmn = ZeroMeanNormal::new();
        for x in [0.1, -0.2, 0.15] {
            zmn.incorporate(&x);
        }
        assert!(zmn.logp(&0.1) > zmn.logp(&3.0));
    }

    #[test]
    fn test_sample_is_finite() {
        let mut prng = Prng::seed_from_u64(0);
        let mut zmn = ZeroMeanNormal::new();
        zmn.incorporate(&0.4);
        for _ in 0..20 {
            assert!(zmn.sample(&mut prng).is_finite());
        }
    }

    #[test]
    fn test_transition_hyperparameters() {
        let mut prng = Prng::seed_from_u64(1);
        let mut zmn = ZeroMeanNormal::new();
        for i in 1..10 {
            zmn.incorporate(&(f64::from(i) * 0.05));
        }
        zmn.transition_hyperparameters(&mut prng).unwrap();
        assert!(ALPHA_GRID.contains(&zmn.alpha));
        assert!(BETA_GRID.contains(&zmn.beta));
    }
}
