//! Skellam distribution (difference of two Poissons) with log-normal
//! priors on the rates.
//!
//! Nonconjugate: observations are kept in a multiset so the marginal score
//! can be re-evaluated whenever the latent rates move. The rates
//! transition by a log-space Metropolis step; the hyperparameters of their
//! log-normal priors transition on a grid.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use rand::distributions::Distribution as Sampler;
use rand::Rng;
use statrs::distribution::Poisson;
use statrs::function::gamma::ln_gamma;

use super::{sample_from_grid, Distribution};
use crate::math::logsumexp;
use crate::error::Result;
use crate::Prng;

const MEAN_GRID: [f64; 3] = [-1.0, 0.0, 1.0];
const STDDEV_GRID: [f64; 3] = [0.5, 1.0, 2.0];

/// Scale of the log-space Metropolis proposal on the rates.
const THETA_STEP: f64 = 0.5;

/// Log of the modified Bessel function `I_v(z)` for integer order,
/// evaluated as a log-space power series.
fn log_bessel_i(order: i64, z: f64) -> f64 {
    let v = order.unsigned_abs() as f64;
    let half_z = z / 2.0;
    let log_half_z = half_z.ln();
    let mut terms = Vec::new();
    let mut max_term = f64::NEG_INFINITY;
    let mut k = 0.0;
    loop {
        let term = (2.0 * k + v) * log_half_z - ln_gamma(k + 1.0) - ln_gamma(k + v + 1.0);
        terms.push(term);
        max_term = max_term.max(term);
        // The series is eventually strictly decreasing; stop once the tail
        // cannot move the sum.
        if (k > half_z * half_z && term < max_term - 50.0) || k > 1000.0 {
            break;
        }
        k += 1.0;
    }
    logsumexp(&terms)
}

fn lognormal_logp(x: f64, mean: f64, stddev: f64) -> f64 {
    let y = (x.ln() - mean) / stddev;
    -y * y / 2.0 - (x * stddev).ln() - 0.5 * (2.0 * PI).ln()
}

#[derive(Debug, Clone)]
pub struct Skellam {
    // Hyperparameters of the log-normal priors on the rates.
    pub mean1: f64,
    pub mean2: f64,
    pub stddev1: f64,
    pub stddev2: f64,
    // Latent rates.
    pub mu1: f64,
    pub mu2: f64,
    seen: BTreeMap<i64, f64>,
    n: f64,
}

impl Skellam {
    pub fn new() -> Self {
        Skellam {
            mean1: 0.0,
            mean2: 0.0,
            stddev1: 1.0,
            stddev2: 1.0,
            mu1: 1.0,
            mu2: 1.0,
            seen: BTreeMap::new(),
            n: 0.0,
        }
    }

    fn prior_logp(&self) -> f64 {
        lognormal_logp(self.mu1, self.mean1, self.stddev1)
            + lognormal_logp(self.mu2, self.mean2, self.stddev2)
    }
}

impl Default for Skellam {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution<i64> for Skellam {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &i64, weight: f64) {
        let entry = self.seen.entry(*x).or_insert(0.0);
        *entry += weight;
        if entry.abs() < 1e-9 {
            self.seen.remove(x);
        }
        self.n += weight;
    }

    fn logp(&self, x: &i64) -> f64 {
        -self.mu1 - self.mu2
            + (*x as f64 / 2.0) * (self.mu1 / self.mu2).ln()
            + log_bessel_i(*x, 2.0 * (self.mu1 * self.mu2).sqrt())
    }

    fn logp_score(&self) -> f64 {
        self.seen
            .iter()
            .map(|(x, weight)| weight * self.logp(x))
            .sum()
    }

    fn sample(&mut self, prng: &mut Prng) -> i64 {
        let d1 = Poisson::new(self.mu1).expect("positive rate");
        let d2 = Poisson::new(self.mu2).expect("positive rate");
        d1.sample(prng) as i64 - d2.sample(prng) as i64
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        let mut logps = Vec::new();
        let mut hypers = Vec::new();
        for mean1 in MEAN_GRID {
            for stddev1 in STDDEV_GRID {
                for mean2 in MEAN_GRID {
                    for stddev2 in STDDEV_GRID {
                        let lp = lognormal_logp(self.mu1, mean1, stddev1)
                            + lognormal_logp(self.mu2, mean2, stddev2);
                        logps.push(lp);
                        hypers.push((mean1, stddev1, mean2, stddev2));
                    }
                }
            }
        }
        let i = sample_from_grid(
            "Skellam",
            &logps,
            format_args!("mu1={} mu2={}", self.mu1, self.mu2),
            prng,
        )?;
        (self.mean1, self.stddev1, self.mean2, self.stddev2) = hypers[i];
        Ok(())
    }

    fn init_theta(&mut self, prng: &mut Prng) {
        self.mu1 = (self.mean1 + self.stddev1 * rand_normal_draw(prng)).exp();
        self.mu2 = (self.mean2 + self.stddev2 * rand_normal_draw(prng)).exp();
    }

    fn transition_theta(&mut self, prng: &mut Prng) {
        // Log-space random walk; the mu'/mu factor is the Jacobian of the
        // proposal measured in rate space.
        let current_logp = self.prior_logp() + self.logp_score();
        let (old_mu1, old_mu2) = (self.mu1, self.mu2);
        self.mu1 = (old_mu1.ln() + THETA_STEP * rand_normal_draw(prng)).exp();
        self.mu2 = (old_mu2.ln() + THETA_STEP * rand_normal_draw(prng)).exp();
        let proposed_logp = self.prior_logp() + self.logp_score();
        let log_accept = proposed_logp - current_logp + (self.mu1 / old_mu1).ln()
            + (self.mu2 / old_mu2).ln();
        if prng.gen::<f64>().ln() >= log_accept {
            self.mu1 = old_mu1;
            self.mu2 = old_mu2;
        }
    }
}

/// Standard normal draw via Box-Muller, avoiding a distribution object for
/// a two-line need.
fn rand_normal_draw(prng: &mut Prng) -> f64 {
    let u1: f64 = prng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = prng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
