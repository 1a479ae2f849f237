//! Emission interface and noise-channel families
//!
//! An [`Emission`] is a stochastic channel from a clean value to a dirty
//! observed value. Semantically it is a [`Distribution`] over
//! `(clean, dirty)` pairs with two extra operations: corrupting a clean
//! value forward, and proposing a clean value from a set of observed
//! dirties (used by the latent-value resampler; it only needs to be
//! peaked on likely cleans, not Bayes optimal).

pub mod alignment;
pub mod bigram_string;
pub mod bitflip;
pub mod categorical;
pub mod gaussian;
pub mod simple_string;
pub mod sometimes;

pub use bigram_string::BigramStringEmission;
pub use bitflip::BitFlip;
pub use categorical::CategoricalEmission;
pub use gaussian::GaussianEmission;
pub use simple_string::SimpleStringEmission;
pub use sometimes::Sometimes;

use std::collections::BTreeMap;

use crate::distributions::Distribution;
use crate::error::{EngineError, Result};
use crate::value::ValueType;
use crate::Prng;

/// A noisy observation channel over values of type `V`.
pub trait Emission<V: Clone>: Distribution<(V, V)> {
    /// Draw a dirty value given a clean one.
    fn sample_corrupted(&mut self, clean: &V, prng: &mut Prng) -> V;

    /// Best-guess clean value behind a list of observed dirty values.
    fn propose_clean(&self, corrupted: &[V], prng: &mut Prng) -> V;
}

// Boxed emissions delegate both trait surfaces so they can serve as
// cluster models in the generic relation machinery.
impl<V: Clone + 'static> Distribution<(V, V)> for Box<dyn Emission<V>> {
    fn count(&self) -> f64 {
        (**self).count()
    }
    fn incorporate_weighted(&mut self, x: &(V, V), weight: f64) {
        (**self).incorporate_weighted(x, weight);
    }
    fn incorporate(&mut self, x: &(V, V)) {
        (**self).incorporate(x);
    }
    fn unincorporate(&mut self, x: &(V, V)) {
        (**self).unincorporate(x);
    }
    fn logp(&self, x: &(V, V)) -> f64 {
        (**self).logp(x)
    }
    fn logp_score(&self) -> f64 {
        (**self).logp_score()
    }
    fn sample(&mut self, prng: &mut Prng) -> (V, V) {
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
    fn nearest(&self, x: &(V, V)) -> (V, V) {
        (**self).nearest(x)
    }
}

impl<V: Clone + 'static> Emission<V> for Box<dyn Emission<V>> {
    fn sample_corrupted(&mut self, clean: &V, prng: &mut Prng) -> V {
        (**self).sample_corrupted(clean, prng)
    }
    fn propose_clean(&self, corrupted: &[V], prng: &mut Prng) -> V {
        (**self).propose_clean(corrupted, prng)
    }
}

/// Recognized emission families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionFamily {
    BitFlip,
    Gaussian,
    SimpleString,
    BigramString,
    Categorical,
}

impl EmissionFamily {
    pub fn name(self) -> &'static str {
        match self {
            EmissionFamily::BitFlip => "bitflip",
            EmissionFamily::Gaussian => "gaussian",
            EmissionFamily::SimpleString => "simple_string",
            EmissionFamily::BigramString => "bigram_string",
            EmissionFamily::Categorical => "categorical",
        }
    }

    pub fn value_type(self) -> ValueType {
        match self {
            EmissionFamily::BitFlip => ValueType::Bool,
            EmissionFamily::Gaussian => ValueType::Double,
            EmissionFamily::SimpleString | EmissionFamily::BigramString => ValueType::Str,
            EmissionFamily::Categorical => ValueType::Int,
        }
    }
}

/// A parsed emission spec: family, optional `sometimes_` gate, raw
/// parameters. `sometimes_gaussian` is the Gaussian channel behind a
/// Beta-Bernoulli "did the emission fire" gate.
#[derive(Debug, Clone, PartialEq)]
pub struct EmissionSpec {
    pub family: EmissionFamily,
    pub sometimes: bool,
    pub args: BTreeMap<String, String>,
}

impl EmissionSpec {
    pub fn new(family: EmissionFamily, sometimes: bool) -> Self {
        EmissionSpec {
            family,
            sometimes,
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    /// Parse a textual spec like `gaussian`, `sometimes_bitflip`, or
    /// `sometimes_categorical(k=5)`.
    pub fn parse(text: &str) -> Result<Self> {
        let (name, args) = crate::schema::parse_name_and_parameters(text)?;
        let (sometimes, family_name) = match name.strip_prefix("sometimes_") {
            Some(rest) => (true, rest),
            None => (false, name.as_str()),
        };
        let family = match family_name {
            "bitflip" => EmissionFamily::BitFlip,
            "gaussian" => EmissionFamily::Gaussian,
            "simple_string" => EmissionFamily::SimpleString,
            "bigram_string" => EmissionFamily::BigramString,
            "categorical" => EmissionFamily::Categorical,
            _ => return Err(EngineError::UnknownFamily(name)),
        };
        Ok(EmissionSpec {
            family,
            sometimes,
            args,
        })
    }

    pub fn value_type(&self) -> ValueType {
        self.family.value_type()
    }

    pub fn name(&self) -> String {
        if self.sometimes {
            format!("sometimes_{}", self.family.name())
        } else {
            self.family.name().to_string()
        }
    }

    fn required_usize(&self, param: &'static str) -> Result<usize> {
        let raw = self
            .args
            .get(param)
            .ok_or_else(|| EngineError::MissingFamilyParameter {
                family: self.name(),
                param,
            })?;
        raw.parse::<usize>()
            .map_err(|e| EngineError::InvalidFamilyParameter {
                family: self.name(),
                param,
                detail: e.to_string(),
            })
    }
}

fn type_mismatch(spec: &EmissionSpec, value_type: ValueType) -> EngineError {
    EngineError::FamilyTypeMismatch {
        family: spec.name(),
        value_type,
    }
}

/// Resolve a spec into an emission over booleans.
pub fn bool_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<bool>>> {
    match spec.family {
        EmissionFamily::BitFlip => {
            if spec.sometimes {
                Ok(Box::new(Sometimes::new(Box::new(BitFlip::new()), false)))
            } else {
                Ok(Box::new(BitFlip::new()))
            }
        }
        _ => Err(type_mismatch(spec, ValueType::Bool)),
    }
}

/// Resolve a spec into an emission over integers.
pub fn int_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<i64>>> {
    match spec.family {
        EmissionFamily::Categorical => {
            let k = spec.required_usize("k")?;
            if k == 0 {
                return Err(EngineError::InvalidFamilyParameter {
                    family: spec.name(),
                    param: "k",
                    detail: "k must be positive".to_string(),
                });
            }
            let base = Box::new(CategoricalEmission::new(k));
            if spec.sometimes {
                Ok(Box::new(Sometimes::new(base, false)))
            } else {
                Ok(base)
            }
        }
        _ => Err(type_mismatch(spec, ValueType::Int)),
    }
}

/// Resolve a spec into an emission over doubles.
pub fn double_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<f64>>> {
    match spec.family {
        EmissionFamily::Gaussian => {
            let base = Box::new(GaussianEmission::new());
            if spec.sometimes {
                // The Gaussian channel is a density, so dirty == clean is
                // treated as "did not fire".
                Ok(Box::new(Sometimes::new(base, false)))
            } else {
                Ok(base)
            }
        }
        _ => Err(type_mismatch(spec, ValueType::Double)),
    }
}

/// Resolve a spec into an emission over strings.
pub fn string_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<String>>> {
    let base: Box<dyn Emission<String>> = match spec.family {
        EmissionFamily::SimpleString => Box::new(SimpleStringEmission::new()),
        EmissionFamily::BigramString => Box::new(BigramStringEmission::new()),
        _ => return Err(type_mismatch(spec, ValueType::Str)),
    };
    if spec.sometimes {
        // String channels assign positive probability to an unmodified
        // copy, so the gate must account for dirty == clean.
        Ok(Box::new(Sometimes::new(base, true)))
    } else {
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let spec = EmissionSpec::parse("gaussian").unwrap();
        assert_eq!(spec.family, EmissionFamily::Gaussian);
        assert!(!spec.sometimes);
        assert_eq!(spec.value_type(), ValueType::Double);
    }

    #[test]
    fn test_parse_sometimes() {
        let spec = EmissionSpec::parse("sometimes_bitflip").unwrap();
        assert_eq!(spec.family, EmissionFamily::BitFlip);
        assert!(spec.sometimes);
        assert_eq!(spec.name(), "sometimes_bitflip");
    }

    #[test]
    fn test_parse_sometimes_with_args() {
        let spec = EmissionSpec::parse("sometimes_categorical(k=4)").unwrap();
        assert_eq!(spec.family, EmissionFamily::Categorical);
        assert!(spec.sometimes);
        assert_eq!(spec.args["k"], "4");
    }

    #[test]
    fn test_parse_unknown() {
        assert!(matches!(
            EmissionSpec::parse("sometimes_zipf"),
            Err(EngineError::UnknownFamily(_))
        ));
    }

    #[test]
    fn test_factories_enforce_value_types() {
        let gaussian = EmissionSpec::parse("gaussian").unwrap();
        assert!(double_emission(&gaussian).is_ok());
        assert!(bool_emission(&gaussian).is_err());

        let strings = EmissionSpec::parse("sometimes_simple_string").unwrap();
        assert!(string_emission(&strings).is_ok());
        assert!(int_emission(&strings).is_err());
    }
}
