//! Value Type System
//!
//! Observed relation values are one of four scalar types: booleans,
//! integers, doubles, and strings. `Value` is the dynamic sum type used at
//! the model boundary (observation feeds, the HIRM/GenDB dispatch layer);
//! the relation internals are monomorphized over the static types via
//! [`RelationValue`].

use std::fmt;

use crate::distributions::{Distribution, DistributionSpec};
use crate::emissions::{Emission, EmissionSpec};
use crate::error::{EngineError, Result};
use crate::Prng;

/// Tag for the value type a relation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Int,
    Double,
    Str,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Double => write!(f, "double"),
            ValueType::Str => write!(f, "string"),
        }
    }
}

/// A dynamically typed relation value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Double(_) => ValueType::Double,
            Value::Str(_) => ValueType::Str,
        }
    }

    /// Parse an observation-feed string as the given value type.
    ///
    /// Booleans accept `0`/`1`/`true`/`false`. A failed parse is a
    /// recoverable condition: the driver skips the row.
    pub fn parse(text: &str, value_type: ValueType, relation: &str) -> Result<Value> {
        let err = || EngineError::ObservationParse {
            relation: relation.to_string(),
            value: text.to_string(),
            expected: value_type,
        };
        match value_type {
            ValueType::Bool => match text {
                "0" | "false" => Ok(Value::Bool(false)),
                "1" | "true" => Ok(Value::Bool(true)),
                _ => Err(err()),
            },
            ValueType::Int => text.parse::<i64>().map(Value::Int).map_err(|_| err()),
            ValueType::Double => text.parse::<f64>().map(Value::Double).map_err(|_| err()),
            ValueType::Str => Ok(Value::Str(text.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(x) => write!(f, "{}", u8::from(*x)),
            Value::Int(x) => write!(f, "{x}"),
            Value::Double(x) => write!(f, "{x}"),
            Value::Str(x) => write!(f, "{x}"),
        }
    }
}

/// Static counterpart of [`Value`]: the concrete types relations are
/// monomorphized over, plus the factory hooks that resolve a schema spec
/// into a prior distribution or emission for that type.
pub trait RelationValue: Clone + PartialEq + fmt::Debug + 'static {
    const VALUE_TYPE: ValueType;

    fn from_value(value: &Value) -> Option<Self>;

    fn into_value(self) -> Value;

    /// Build a fresh prior distribution for this value type from a spec.
    fn make_prior(spec: &DistributionSpec, prng: &mut Prng) -> Result<Box<dyn Distribution<Self>>>;

    /// Build a fresh emission for this value type from a spec.
    fn make_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<Self>>>;
}

impl RelationValue for bool {
    const VALUE_TYPE: ValueType = ValueType::Bool;

    fn from_value(value: &Value) -> Option<bool> {
        match value {
            Value::Bool(x) => Some(*x),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn make_prior(spec: &DistributionSpec, prng: &mut Prng) -> Result<Box<dyn Distribution<bool>>> {
        crate::distributions::bool_prior(spec, prng)
    }

    fn make_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<bool>>> {
        crate::emissions::bool_emission(spec)
    }
}

impl RelationValue for i64 {
    const VALUE_TYPE: ValueType = ValueType::Int;

    fn from_value(value: &Value) -> Option<i64> {
        match value {
            Value::Int(x) => Some(*x),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Int(self)
    }

    fn make_prior(spec: &DistributionSpec, prng: &mut Prng) -> Result<Box<dyn Distribution<i64>>> {
        crate::distributions::int_prior(spec, prng)
    }

    fn make_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<i64>>> {
        crate::emissions::int_emission(spec)
    }
}

impl RelationValue for f64 {
    const VALUE_TYPE: ValueType = ValueType::Double;

    fn from_value(value: &Value) -> Option<f64> {
        match value {
            Value::Double(x) => Some(*x),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Double(self)
    }

    fn make_prior(spec: &DistributionSpec, prng: &mut Prng) -> Result<Box<dyn Distribution<f64>>> {
        crate::distributions::double_prior(spec, prng)
    }

    fn make_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<f64>>> {
        crate::emissions::double_emission(spec)
    }
}

impl RelationValue for String {
    const VALUE_TYPE: ValueType = ValueType::Str;

    fn from_value(value: &Value) -> Option<String> {
        match value {
            Value::Str(x) => Some(x.clone()),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Str(self)
    }

    fn make_prior(
        spec: &DistributionSpec,
        prng: &mut Prng,
    ) -> Result<Box<dyn Distribution<String>>> {
        crate::distributions::string_prior(spec, prng)
    }

    fn make_emission(spec: &EmissionSpec) -> Result<Box<dyn Emission<String>>> {
        crate::emissions::string_emission(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(
            Value::parse("1", ValueType::Bool, "r").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::parse("false", ValueType::Bool, "r").unwrap(),
            Value::Bool(false)
        );
        assert!(Value::parse("maybe", ValueType::Bool, "r").is_err());
    }

    #[test]
    fn test_parse_numeric() {
        assert_eq!(
            Value::parse("-3", ValueType::Int, "r").unwrap(),
            Value::Int(-3)
        );
        assert_eq!(
            Value::parse("2.5", ValueType::Double, "r").unwrap(),
            Value::Double(2.5)
        );
        assert!(Value::parse("2.5", ValueType::Int, "r").is_err());
    }

    #[test]
    fn test_parse_string_is_verbatim() {
        assert_eq!(
            Value::parse("New York", ValueType::Str, "r").unwrap(),
            Value::Str("New York".to_string())
        );
    }

    #[test]
    fn test_display_round_trips_bool_as_digit() {
        assert_eq!(Value::Bool(true).to_string(), "1");
        assert_eq!(Value::Bool(false).to_string(), "0");
    }

    #[test]
    fn test_from_value_type_guard() {
        assert_eq!(bool::from_value(&Value::Bool(true)), Some(true));
        assert_eq!(bool::from_value(&Value::Int(1)), None);
        assert_eq!(f64::from_value(&Value::Double(0.5)), Some(0.5));
    }
}
