//! Command-line driver: fit an IRM or HIRM to a schema + observation file
//! pair, optionally starting from saved clusters, and persist the learnt
//! partitions.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use entwine::inference::{inference_hirm, inference_irm};
use entwine::observations::{
    calculate_encoding, incorporate_observations_hirm, incorporate_observations_irm,
    logp_hirm, logp_irm, mark_observed, merge_observations, Observation,
};
use entwine::{io, Config, Hirm, Irm, Prng};

#[derive(Parser, Debug)]
#[command(name = "entwine", about = "Run a hierarchical infinite relational model")]
struct Args {
    /// Base name: reads <path>.schema and <path>.obs, writes
    /// <path>.<seed>.<mode>
    path: PathBuf,

    /// Model to fit: irm or hirm
    #[arg(long, default_value = "hirm")]
    mode: String,

    /// Random seed
    #[arg(long, default_value_t = 10)]
    seed: u64,

    /// Number of inference iterations (overrides config)
    #[arg(long)]
    iters: Option<usize>,

    /// Inference timeout in seconds, 0 for none (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Report the model score after every sweep
    #[arg(long)]
    verbose: bool,

    /// Path to a saved .irm/.hirm cluster file to start from
    #[arg(long)]
    load: Option<PathBuf>,

    /// Held-out observation file to score after fitting
    #[arg(long)]
    heldout: Option<PathBuf>,

    /// Number of synthetic observations to draw and write after fitting
    #[arg(long, default_value_t = 0)]
    samples: usize,

    /// Configuration file (defaults to entwine.toml discovery)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(&path.display().to_string())
            .context("loading configuration file")?,
        None => Config::load().unwrap_or_default(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let mut inference = config.inference.to_inference_config();
    if let Some(iters) = args.iters {
        inference.iters = iters;
    }
    if let Some(timeout) = args.timeout {
        inference.timeout = (timeout > 0).then(|| std::time::Duration::from_secs(timeout));
    }
    inference.verbose |= args.verbose;

    let schema_path = args.path.with_extension("schema");
    let obs_path = args.path.with_extension("obs");
    info!(path = %schema_path.display(), "loading schema");
    let mut schema = io::load_schema(&schema_path)?;
    info!(path = %obs_path.display(), "loading observations");
    let observations = io::load_observations(&obs_path)?;
    mark_observed(&mut schema, &observations);

    let heldout = match &args.heldout {
        Some(path) => io::load_observations(path)?,
        None => Vec::new(),
    };
    let merged = merge_observations(&observations, &heldout);
    let encoding = calculate_encoding(&schema, &merged)?;

    let mut prng = Prng::seed_from_u64(args.seed);
    info!(seed = args.seed, mode = %args.mode, "starting inference");

    let save_path = args
        .path
        .with_extension(format!("{}.{}", args.seed, args.mode));

    match args.mode.as_str() {
        "irm" => {
            let mut irm = match &args.load {
                Some(clusters) => {
                    io::irm_from_txt(&mut prng, &schema, &observations, clusters)?.0
                }
                None => {
                    let mut irm = Irm::new(&schema, &mut prng)?;
                    incorporate_observations_irm(&mut prng, &mut irm, &encoding, &observations)?;
                    irm
                }
            };
            let exit = inference_irm(&mut prng, &mut irm, &inference)?;
            info!(?exit, score = irm.logp_score(), "inference finished");
            io::save_irm(&save_path, &irm, &encoding)?;
            info!(path = %save_path.display(), "saved clusters");
            if !heldout.is_empty() {
                let lp = logp_irm(&mut prng, &irm, &encoding, &heldout)?;
                info!(logp = lp, "held-out log likelihood");
            }
            if args.samples > 0 {
                bail!("sampling is only supported in hirm mode");
            }
        }
        "hirm" => {
            let mut hirm = match &args.load {
                Some(clusters) => {
                    io::hirm_from_txt(&mut prng, &schema, &observations, clusters)?.0
                }
                None => {
                    let mut hirm = Hirm::new(&schema, &mut prng)?;
                    incorporate_observations_hirm(&mut prng, &mut hirm, &encoding, &observations)?;
                    hirm
                }
            };
            let exit = inference_hirm(&mut prng, &mut hirm, &inference)?;
            info!(?exit, score = hirm.logp_score(), "inference finished");
            io::save_hirm(&save_path, &hirm, &encoding)?;
            info!(path = %save_path.display(), "saved clusters");
            if !heldout.is_empty() {
                let lp = logp_hirm(&mut prng, &hirm, &encoding, &heldout)?;
                info!(logp = lp, "held-out log likelihood");
            }
            if args.samples > 0 {
                let rows = draw_samples(&mut prng, &mut hirm, &encoding, args.samples)?;
                let samples_path = args
                    .path
                    .with_extension(format!("{}.{}.samples", args.seed, args.mode));
                io::write_observations(&samples_path, &rows)?;
                info!(path = %samples_path.display(), count = rows.len(), "wrote samples");
            }
        }
        other => bail!("unknown mode '{other}', expected irm or hirm"),
    }
    Ok(())
}

/// Draw synthetic observations from the fitted model: resample values at
/// observed tuples via the predictive, leaving the model unchanged.
fn draw_samples(
    prng: &mut Prng,
    hirm: &mut Hirm,
    encoding: &entwine::observations::Encoding,
    count: usize,
) -> anyhow::Result<Vec<Observation>> {
    let mut rows = Vec::with_capacity(count);
    let observed: Vec<String> = hirm
        .schema
        .iter()
        .filter(|(_, entry)| entry.is_observed())
        .map(|(name, _)| name.clone())
        .collect();
    if observed.is_empty() {
        bail!("no observed relations to sample from");
    }
    'outer: for round in 0.. {
        let mut progressed = false;
        for name in &observed {
            if rows.len() == count {
                break 'outer;
            }
            let relation = hirm.get_relation(name);
            let tuples: Vec<_> = relation.data_pairs();
            if tuples.is_empty() {
                continue;
            }
            progressed = true;
            let (items, original) = &tuples[round % tuples.len()];
            hirm.unincorporate(name, items);
            let value = hirm.sample_and_incorporate_relation(prng, name, items);
            // Put the observed value back; the draw was only recorded.
            hirm.unincorporate(name, items);
            hirm.incorporate(prng, name, items, original)?;
            let domains = relation.domain_names();
            let entities: Vec<String> = domains
                .iter()
                .zip(items)
                .map(|(domain, item)| {
                    encoding
                        .entity_of(domain, *item)
                        .map_or_else(|| item.to_string(), ToString::to_string)
                })
                .collect();
            rows.push(Observation {
                relation: name.clone(),
                items: entities,
                value: value.to_string(),
            });
        }
        if !progressed {
            break;
        }
    }
    Ok(rows)
}
