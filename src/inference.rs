//! Inference drivers.
//!
//! Each driver runs full Gibbs sweeps for a fixed number of iterations,
//! checking the wall clock between sweeps. In-flight sweeps complete
//! atomically; a timeout is a clean exit condition, not an error.

use std::time::{Duration, Instant};

use tracing::info;

use crate::error::Result;
use crate::gendb::GenDb;
use crate::hirm::Hirm;
use crate::irm::Irm;
use crate::Prng;

/// Driver settings for one inference run.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Number of full sweeps.
    pub iters: usize,
    /// Wall-clock budget; `None` runs to completion.
    pub timeout: Option<Duration>,
    /// Log the model score after every sweep.
    pub verbose: bool,
    /// Latent-parameter sub-steps per cluster per hyperparameter pass.
    pub num_theta_steps: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            iters: 10,
            timeout: None,
            verbose: false,
            num_theta_steps: 10,
        }
    }
}

/// How a driver loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCondition {
    /// All requested iterations ran.
    Completed,
    /// The wall-clock budget ran out between sweeps.
    IterationTimeout,
}

fn out_of_time(start: Instant, timeout: Option<Duration>) -> bool {
    timeout.is_some_and(|limit| start.elapsed() >= limit)
}

/// One full Gibbs sweep over an IRM: entity assignments, then cluster
/// hyperparameters, then domain concentrations.
pub fn single_step_irm_inference(
    prng: &mut Prng,
    irm: &mut Irm,
    num_theta_steps: usize,
) -> Result<()> {
    irm.transition_cluster_assignments_all(prng);
    irm.transition_hyperparameters(prng, num_theta_steps)
}

pub fn inference_irm(
    prng: &mut Prng,
    irm: &mut Irm,
    config: &InferenceConfig,
) -> Result<ExitCondition> {
    let start = Instant::now();
    for iteration in 0..config.iters {
        if out_of_time(start, config.timeout) {
            info!(iteration, "timeout reached");
            return Ok(ExitCondition::IterationTimeout);
        }
        single_step_irm_inference(prng, irm, config.num_theta_steps)?;
        if config.verbose {
            info!(iteration, score = irm.logp_score(), "irm sweep");
        }
    }
    Ok(ExitCondition::Completed)
}

/// One full HIRM sweep: latent values behind noisy channels, relation
/// moves over the outer CRP, then per-IRM sweeps and the outer
/// concentration.
pub fn single_step_hirm_inference(
    prng: &mut Prng,
    hirm: &mut Hirm,
    num_theta_steps: usize,
) -> Result<()> {
    hirm.transition_latent_values_all(prng);
    hirm.transition_cluster_assignments_all(prng)?;
    let tables: Vec<_> = hirm.irms.keys().copied().collect();
    for table in tables {
        let irm = hirm.irms.get_mut(&table).expect("table enumerated above");
        irm.transition_cluster_assignments_all(prng);
        irm.transition_hyperparameters(prng, num_theta_steps)?;
    }
    hirm.crp.transition_alpha(prng);
    Ok(())
}

pub fn inference_hirm(
    prng: &mut Prng,
    hirm: &mut Hirm,
    config: &InferenceConfig,
) -> Result<ExitCondition> {
    let start = Instant::now();
    for iteration in 0..config.iters {
        if out_of_time(start, config.timeout) {
            info!(iteration, "timeout reached");
            return Ok(ExitCondition::IterationTimeout);
        }
        single_step_hirm_inference(prng, hirm, config.num_theta_steps)?;
        if config.verbose {
            info!(iteration, score = hirm.logp_score(), "hirm sweep");
        }
    }
    Ok(ExitCondition::Completed)
}

/// GenDB inference: reference reassignment for the record class and its
/// ancestors, then `hirm_sweeps_per_iter` relational sweeps.
pub fn inference_gendb(
    prng: &mut Prng,
    gendb: &mut GenDb,
    config: &InferenceConfig,
    hirm_sweeps_per_iter: usize,
) -> Result<ExitCondition> {
    let start = Instant::now();
    let record_class = gendb.schema.record_class.clone();
    for iteration in 0..config.iters {
        if out_of_time(start, config.timeout) {
            info!(iteration, "timeout reached");
            return Ok(ExitCondition::IterationTimeout);
        }
        gendb.transition_reference_class_and_ancestors(prng, &record_class)?;
        for _ in 0..hirm_sweeps_per_iter {
            single_step_hirm_inference(prng, &mut gendb.hirm, config.num_theta_steps)?;
        }
        if config.verbose {
            info!(iteration, score = gendb.logp_score(), "gendb sweep");
        }
    }
    Ok(ExitCondition::Completed)
}
