//! # Entwine Relational Learner
//!
//! A hierarchical nonparametric relational learner: given a schema of
//! classes, reference fields, attributes, and noisy observations traced
//! along reference paths, Entwine jointly infers a clustering of entities
//! per domain, a clustering of relations into independent sub-models, the
//! latent clean value behind each noisy observation, and the entity each
//! foreign key points at. Inference is Gibbs-style throughout.
//!
//! ## Model stack
//!
//! ```text
//! Observed rows (CSV-shaped feeds, entity ids as strings)
//!     |
//! [observations]   encode entities, route values        -> typed tuples
//!     |
//! [gendb]          entity CRPs + reference resampling   -> linkages
//!     |
//! [hirm]           outer CRP over relations             -> sub-models
//!     |
//! [irm]            per-domain entity CRPs               -> clusterings
//!     |
//! [relation]       cluster-conditional distributions    -> likelihoods
//!     |
//! [distributions / emissions]  sufficient statistics
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `math` | logsumexp, grids, weighted choice, Cartesian product |
//! | `crp` | Chinese Restaurant Process bookkeeping |
//! | `domain` | named entity sets clustered by a CRP |
//! | `distributions` | conjugate/nonconjugate families over values |
//! | `emissions` | noisy channels over (clean, dirty) pairs |
//! | `relation` | clean/noisy relations, latent-value resampling |
//! | `irm` | entity-to-cluster Gibbs over one sub-model |
//! | `hirm` | relation-to-sub-model Gibbs (outer CRP) |
//! | `gendb` | entity linkage: reference-field Gibbs |
//! | `observations` | observation feeds and entity encoding |
//! | `io` | schema/observation files, cluster dump round-trips |
//! | `inference` | driver loops with timeouts |
//! | `config` | hierarchical driver configuration |
//!
//! ## Usage
//!
//! ```rust
//! use entwine::{Hirm, Prng, Schema, RelationSchema, Value};
//! use entwine::distributions::{DistributionFamily, DistributionSpec};
//! use rand::SeedableRng;
//!
//! let mut prng = Prng::seed_from_u64(10);
//! let mut schema = Schema::new();
//! schema.insert(
//!     "friendly".to_string(),
//!     RelationSchema::Clean {
//!         domains: vec!["animal".to_string(), "animal".to_string()],
//!         spec: DistributionSpec::new(DistributionFamily::Bernoulli),
//!         observed: true,
//!     },
//! );
//! let mut hirm = Hirm::new(&schema, &mut prng).unwrap();
//! hirm.incorporate(&mut prng, "friendly", &vec![0, 1], &Value::Bool(true)).unwrap();
//! hirm.transition_cluster_assignments_all(&mut prng).unwrap();
//! assert!(hirm.logp_score().is_finite());
//! ```

pub mod config;
pub mod crp;
pub mod distributions;
pub mod domain;
pub mod emissions;
pub mod error;
pub mod gendb;
pub mod hirm;
pub mod inference;
pub mod io;
pub mod irm;
pub mod math;
pub mod observations;
pub mod relation;
pub mod schema;
pub mod value;

/// The PRNG threaded explicitly through every sampling entry point.
/// Callers wanting parallel chains create independent instances.
pub type Prng = rand::rngs::StdRng;

pub use config::Config;
pub use crp::{Crp, Item, Table};
pub use domain::Domain;
pub use error::{EngineError, Result};
pub use gendb::{ClassSchema, GenDb};
pub use hirm::Hirm;
pub use inference::{inference_gendb, inference_hirm, inference_irm, ExitCondition, InferenceConfig};
pub use irm::Irm;
pub use relation::{transition_latent_value, Items, RelationVariant};
pub use schema::{RelationSchema, Schema};
pub use value::{Value, ValueType};
