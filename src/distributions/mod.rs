//! Distribution interface and conjugate/nonconjugate families
//!
//! A [`Distribution`] accumulates observations into sufficient statistics
//! and exposes the posterior predictive (`logp`) and the marginal
//! likelihood of everything incorporated so far (`logp_score`).
//! Unincorporation is incorporation with negative weight, so every family
//! maintains its statistics incrementally.
//!
//! Hyperparameter inference is grid Gibbs: enumerate a fixed grid, score
//! each point with `logp_score`, and sample by log-weights. A grid where
//! every point scores NaN is a degeneracy error, not a silent fallback.

pub mod beta_bernoulli;
pub mod bigram;
pub mod dirichlet_categorical;
pub mod normal;
pub mod skellam;
pub mod stringcat;
pub mod zero_mean_normal;

pub use beta_bernoulli::BetaBernoulli;
pub use bigram::Bigram;
pub use dirichlet_categorical::DirichletCategorical;
pub use normal::Normal;
pub use skellam::Skellam;
pub use stringcat::StringCat;
pub use zero_mean_normal::ZeroMeanNormal;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineError, Result};
use crate::math::log_choice;
use crate::value::ValueType;
use crate::Prng;

/// Hyperparameter grid shared by the Dirichlet-flavored families.
pub(crate) const ALPHA_GRID: [f64; 9] = [
    1e-4, 1e-3, 1e-2, 1e-1, 1.0, 10.0, 100.0, 1000.0, 10000.0,
];

/// A distribution over values of type `V` with incrementally maintained
/// sufficient statistics.
pub trait Distribution<V: Clone> {
    /// Sum of the weights of incorporated observations.
    fn count(&self) -> f64;

    /// Accumulate `x` with the given weight.
    fn incorporate_weighted(&mut self, x: &V, weight: f64);

    fn incorporate(&mut self, x: &V) {
        self.incorporate_weighted(x, 1.0);
    }

    /// Undo a previous incorporation of `x`.
    fn unincorporate(&mut self, x: &V) {
        self.incorporate_weighted(x, -1.0);
    }

    /// Log posterior predictive probability of `x` given the data
    /// incorporated so far.
    fn logp(&self, x: &V) -> f64;

    /// Log marginal likelihood of the data incorporated so far.
    fn logp_score(&self) -> f64;

    /// Draw from the posterior predictive.
    fn sample(&mut self, prng: &mut Prng) -> V;

    /// Grid-Gibbs transition of the hyperparameters.
    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()>;

    /// Initialize latent parameters from the prior. Only nonconjugate
    /// families have any.
    fn init_theta(&mut self, _prng: &mut Prng) {}

    /// Transition latent parameters. Only nonconjugate families have any.
    fn transition_theta(&mut self, _prng: &mut Prng) {}

    /// Closest value to `x` that has positive probability under this
    /// distribution. Identity for unconstrained supports.
    fn nearest(&self, x: &V) -> V {
        x.clone()
    }
}

// Boxed trait objects delegate every method (including the ones with
// default bodies) so overrides like `nearest` are never shadowed.
impl<V: Clone> Distribution<V> for Box<dyn Distribution<V>> {
    fn count(&self) -> f64 {
        (**self).count()
    }
    fn incorporate_weighted(&mut self, x: &V, weight: f64) {
        (**self).incorporate_weighted(x, weight);
    }
    fn incorporate(&mut self, x: &V) {
        (**self).incorporate(x);
    }
    fn unincorporate(&mut self, x: &V) {
        (**self).unincorporate(x);
    }
    fn logp(&self, x: &V) -> f64 {
        (**self).logp(x)
    }
    fn logp_score(&self) -> f64 {
        (**self).logp_score()
    }
    fn sample(&mut self, prng: &mut Prng) -> V {
        (**self).sample(prng)
    }
    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        (**self).transition_hyperparameters(prng)
    }
    fn init_theta(&mut self, prng: &mut Prng) {
        (**self).init_theta(prng);
    }
    fn transition_theta(&mut self, prng: &mut Prng) {
        (**self).transition_theta(prng);
    }
    fn nearest(&self, x: &V) -> V {
        (**self).nearest(x)
    }
}

/// Sample an index from grid candidates, failing when every candidate
/// scored NaN.
pub(crate) fn sample_from_grid(
    family: &'static str,
    logps: &[f64],
    detail: impl fmt::Display,
    prng: &mut Prng,
) -> Result<usize> {
    let mut kept_logps = Vec::with_capacity(logps.len());
    let mut kept_indices = Vec::with_capacity(logps.len());
    for (i, lp) in logps.iter().enumerate() {
        if !lp.is_nan() {
            kept_logps.push(*lp);
            kept_indices.push(i);
        }
    }
    if kept_indices.is_empty() {
        return Err(EngineError::HyperparameterDegeneracy {
            family,
            detail: detail.to_string(),
        });
    }
    Ok(kept_indices[log_choice(&kept_logps, prng)])
}

/// Recognized distribution families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionFamily {
    Bernoulli,
    Bigram,
    Categorical,
    Normal,
    Skellam,
    StringCat,
}

impl DistributionFamily {
    pub fn name(self) -> &'static str {
        match self {
            DistributionFamily::Bernoulli => "bernoulli",
            DistributionFamily::Bigram => "bigram",
            DistributionFamily::Categorical => "categorical",
            DistributionFamily::Normal => "normal",
            DistributionFamily::Skellam => "skellam",
            DistributionFamily::StringCat => "stringcat",
        }
    }

    /// The value type this family models.
    pub fn value_type(self) -> ValueType {
        match self {
            DistributionFamily::Bernoulli => ValueType::Bool,
            DistributionFamily::Bigram | DistributionFamily::StringCat => ValueType::Str,
            DistributionFamily::Categorical | DistributionFamily::Skellam => ValueType::Int,
            DistributionFamily::Normal => ValueType::Double,
        }
    }
}

/// A parsed distribution spec: family plus raw parameters, e.g.
/// `categorical(k=5)` or `stringcat(strings=PHD:MD:PT,delim=:)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionSpec {
    pub family: DistributionFamily,
    pub args: BTreeMap<String, String>,
}

impl DistributionSpec {
    pub fn new(family: DistributionFamily) -> Self {
        DistributionSpec {
            family,
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    /// Parse a textual spec of the form `name` or `name(k=v,k2=v2)`.
    pub fn parse(text: &str) -> Result<Self> {
        let (name, args) = crate::schema::parse_name_and_parameters(text)?;
        let family = match name.as_str() {
            "bernoulli" => DistributionFamily::Bernoulli,
            "bigram" => DistributionFamily::Bigram,
            "categorical" => DistributionFamily::Categorical,
            "normal" => DistributionFamily::Normal,
            "skellam" => DistributionFamily::Skellam,
            "stringcat" => DistributionFamily::StringCat,
            _ => return Err(EngineError::UnknownFamily(name)),
        };
        Ok(DistributionSpec { family, args })
    }

    pub fn value_type(&self) -> ValueType {
        self.family.value_type()
    }

    fn required_usize(&self, param: &'static str) -> Result<usize> {
        let raw = self
            .args
            .get(param)
            .ok_or_else(|| EngineError::MissingFamilyParameter {
                family: self.family.name().to_string(),
                param,
            })?;
        raw.parse::<usize>()
            .map_err(|e| EngineError::InvalidFamilyParameter {
                family: self.family.name().to_string(),
                param,
                detail: e.to_string(),
            })
    }

    /// The string set of a `stringcat` spec, split on its delimiter
    /// (default `:`).
    fn stringcat_strings(&self) -> Result<Vec<String>> {
        let raw =
            self.args
                .get("strings")
                .ok_or_else(|| EngineError::MissingFamilyParameter {
                    family: self.family.name().to_string(),
                    param: "strings",
                })?;
        let delim = self.args.get("delim").map_or(":", String::as_str);
        let strings: Vec<String> = raw.split(delim).map(str::to_string).collect();
        if strings.is_empty() || strings.iter().any(String::is_empty) {
            return Err(EngineError::InvalidFamilyParameter {
                family: self.family.name().to_string(),
                param: "strings",
                detail: format!("unusable string list '{raw}'"),
            });
        }
        Ok(strings)
    }
}

fn type_mismatch(spec: &DistributionSpec, value_type: ValueType) -> EngineError {
    EngineError::FamilyTypeMismatch {
        family: spec.family.name().to_string(),
        value_type,
    }
}

/// Resolve a spec into a prior over booleans.
pub fn bool_prior(
    spec: &DistributionSpec,
    _prng: &mut Prng,
) -> Result<Box<dyn Distribution<bool>>> {
    match spec.family {
        DistributionFamily::Bernoulli => Ok(Box::new(BetaBernoulli::new())),
        _ => Err(type_mismatch(spec, ValueType::Bool)),
    }
}

/// Resolve a spec into a prior over integers.
pub fn int_prior(spec: &DistributionSpec, prng: &mut Prng) -> Result<Box<dyn Distribution<i64>>> {
    match spec.family {
        DistributionFamily::Categorical => {
            let k = spec.required_usize("k")?;
            if k == 0 {
                return Err(EngineError::InvalidFamilyParameter {
                    family: spec.family.name().to_string(),
                    param: "k",
                    detail: "k must be positive".to_string(),
                });
            }
            Ok(Box::new(DirichletCategorical::new(k)))
        }
        DistributionFamily::Skellam => {
            let mut skellam = Skellam::new();
            skellam.init_theta(prng);
            Ok(Box::new(skellam))
        }
        _ => Err(type_mismatch(spec, ValueType::Int)),
    }
}

/// Resolve a spec into a prior over doubles.
pub fn double_prior(
    spec: &DistributionSpec,
    _prng: &mut Prng,
) -> Result<Box<dyn Distribution<f64>>> {
    match spec.family {
        DistributionFamily::Normal => Ok(Box::new(Normal::new())),
        _ => Err(type_mismatch(spec, ValueType::Double)),
    }
}

/// Resolve a spec into a prior over strings.
pub fn string_prior(
    spec: &DistributionSpec,
    _prng: &mut Prng,
) -> Result<Box<dyn Distribution<String>>> {
    match spec.family {
        DistributionFamily::Bigram => Ok(Box::new(Bigram::new())),
        DistributionFamily::StringCat => Ok(Box::new(StringCat::new(spec.stringcat_strings()?))),
        _ => Err(type_mismatch(spec, ValueType::Str)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_parse_plain_family() {
        let spec = DistributionSpec::parse("bernoulli").unwrap();
        assert_eq!(spec.family, DistributionFamily::Bernoulli);
        assert!(spec.args.is_empty());
        assert_eq!(spec.value_type(), ValueType::Bool);
    }

    #[test]
    fn test_parse_family_with_args() {
        let spec = DistributionSpec::parse("categorical(k=6)").unwrap();
        assert_eq!(spec.family, DistributionFamily::Categorical);
        assert_eq!(spec.args["k"], "6");
    }

    #[test]
    fn test_parse_unknown_family() {
        assert!(matches!(
            DistributionSpec::parse("zipf"),
            Err(EngineError::UnknownFamily(_))
        ));
    }

    #[test]
    fn test_factories_enforce_value_types() {
        let mut prng = Prng::seed_from_u64(0);
        let bernoulli = DistributionSpec::parse("bernoulli").unwrap();
        assert!(bool_prior(&bernoulli, &mut prng).is_ok());
        assert!(double_prior(&bernoulli, &mut prng).is_err());

        let normal = DistributionSpec::parse("normal").unwrap();
        assert!(double_prior(&normal, &mut prng).is_ok());
        assert!(string_prior(&normal, &mut prng).is_err());
    }

    #[test]
    fn test_categorical_requires_k() {
        let mut prng = Prng::seed_from_u64(0);
        let spec = DistributionSpec::parse("categorical").unwrap();
        assert!(matches!(
            int_prior(&spec, &mut prng),
            Err(EngineError::MissingFamilyParameter { .. })
        ));
    }

    #[test]
    fn test_stringcat_strings_split() {
        let mut prng = Prng::seed_from_u64(0);
        let spec = DistributionSpec::parse("stringcat(strings=PHD:MD:PT)").unwrap();
        let mut dist = string_prior(&spec, &mut prng).unwrap();
        dist.incorporate(&"MD".to_string());
        assert!(dist.logp(&"PHD".to_string()).is_finite());
    }

    #[test]
    fn test_sample_from_grid_rejects_all_nan() {
        let mut prng = Prng::seed_from_u64(0);
        let logps = vec![f64::NAN, f64::NAN];
        assert!(matches!(
            sample_from_grid("test", &logps, "stats", &mut prng),
            Err(EngineError::HyperparameterDegeneracy { .. })
        ));
    }
}
