//! Normal-Inverse-Gamma conjugate family over doubles.
//!
//! Parameterized following the Gaussian/inverse-gamma notes of Teh
//! (http://www.stats.ox.ac.uk/~teh/research/notes/GaussianInverseGamma.pdf):
//! `r` is the relative precision of the mean versus the data, `v` the
//! degrees of freedom of the precision, `m` the prior mean, and `v/s` the
//! prior mean of the precision. Streaming data statistics use Welford's
//! update so unincorporation is exact.

use std::f64::consts::PI;

use rand::distributions::Distribution as Sampler;
use statrs::distribution::StudentsT;
use statrs::function::gamma::ln_gamma;

use super::{sample_from_grid, Distribution};
use crate::error::Result;
use crate::Prng;

const R_GRID: [f64; 3] = [0.1, 1.0, 10.0];
const V_GRID: [f64; 4] = [0.5, 1.0, 2.0, 5.0];
const M_GRID: [f64; 3] = [-1.0, 0.0, 1.0];
const S_GRID: [f64; 3] = [0.5, 1.0, 2.0];

/// Log normalization constant of the NIG prior.
fn log_z(r: f64, v: f64, s: f64) -> f64 {
    (v + 1.0) / 2.0 * 2.0_f64.ln() + 0.5 * PI.ln() - 0.5 * r.ln() - 0.5 * v * s.ln()
        + ln_gamma(0.5 * v)
}

#[derive(Debug, Clone)]
pub struct Normal {
    pub r: f64,
    pub v: f64,
    pub m: f64,
    pub s: f64,

    /// Welford running mean of observed values.
    pub mean: f64,
    /// Welford running (population) variance of observed values.
    pub var: f64,
    /// Total weight of observations.
    pub n: f64,
}

impl Normal {
    pub fn new() -> Self {
        Normal {
            r: 1.0,
            v: 1.0,
            m: 0.0,
            s: 1.0,
            mean: 0.0,
            var: 0.0,
            n: 0.0,
        }
    }

    /// Posterior `(m', s')` given the incorporated data; `r' = r + n` and
    /// `v' = v + n` follow directly.
    pub fn posterior_hypers(&self) -> (f64, f64) {
        let rn = self.r + self.n;
        let mn = (self.r * self.m + self.n * self.mean) / rn;
        let sum_x_sq = self.n * (self.var + self.mean * self.mean);
        let sn = self.s + sum_x_sq + self.r * self.m * self.m - rn * mn * mn;
        (mn, sn)
    }
}

impl Default for Normal {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution<f64> for Normal {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &f64, weight: f64) {
        self.n += weight;
        if self.n == 0.0 {
            self.mean = 0.0;
            self.var = 0.0;
            return;
        }
        let old_mean = self.mean;
        self.mean += weight * (x - self.mean) / self.n;
        self.var += weight * ((x - self.mean) * (x - old_mean) - self.var) / self.n;
    }

    fn logp(&self, x: &f64) -> f64 {
        let mut with_x = self.clone();
        with_x.incorporate(x);
        with_x.logp_score() - self.logp_score()
    }

    fn logp_score(&self) -> f64 {
        let (_, sn) = self.posterior_hypers();
        -0.5 * self.n * (2.0 * PI).ln() + log_z(self.r + self.n, self.v + self.n, sn)
            - log_z(self.r, self.v, self.s)
    }

    fn sample(&mut self, prng: &mut Prng) -> f64 {
        let rn = self.r + self.n;
        let vn = self.v + self.n;
        let (mn, sn) = self.posterior_hypers();
        let scale = (sn * (rn + 1.0) / (rn * vn)).sqrt();
        let t = StudentsT::new(0.0, 1.0, vn).expect("posterior dof is positive");
        mn + scale * t.sample(prng)
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        let mut logps = Vec::new();
        let mut hypers = Vec::new();
        for r in R_GRID {
            for v in V_GRID {
                for m in M_GRID {
                    for s in S_GRID {
                        self.r = r;
                        self.v = v;
                        self.m = m;
                        self.s = s;
                        logps.push(self.logp_score());
                        hypers.push((r, v, m, s));
                    }
                }
            }
        }
        let i = sample_from_grid(
            "Normal",
            &logps,
            format_args!("n={} mean={} var={}", self.n, self.mean, self.var),
            prng,
        )?;
        (self.r, self.v, self.m, self.s) = hypers[i];
        Ok(())
    }
}
