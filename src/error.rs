//! Engine Error Types
//!
//! Recoverable conditions are surfaced as `EngineError`; contract
//! violations (duplicate incorporate, unknown tuple, arity mismatch) are
//! programming bugs and panic with a diagnostic instead of unwinding
//! through `Result`.

use thiserror::Error;

use crate::value::ValueType;

/// Errors surfaced by model construction, observation loading, and
/// hyperparameter inference.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Schema references a relation that was never declared
    #[error("unknown relation '{0}' in schema")]
    UnknownRelation(String),

    /// Noisy relation names a base relation that does not exist
    #[error("unknown base relation '{base}' for noisy relation '{relation}'")]
    UnknownBaseRelation { relation: String, base: String },

    /// Distribution or emission family name not recognized
    #[error("unknown family '{0}'")]
    UnknownFamily(String),

    /// Family exists but cannot model the relation's value type
    #[error("family '{family}' cannot model values of type {value_type}")]
    FamilyTypeMismatch {
        family: String,
        value_type: ValueType,
    },

    /// Family requires a parameter that was not supplied
    #[error("family '{family}' is missing required parameter '{param}'")]
    MissingFamilyParameter { family: String, param: &'static str },

    /// Family parameter has an unusable value
    #[error("family '{family}' has invalid parameter '{param}': {detail}")]
    InvalidFamilyParameter {
        family: String,
        param: &'static str,
        detail: String,
    },

    /// Base-relation references form a cycle
    #[error("cyclic base-relation reference involving '{0}'")]
    CyclicSchema(String),

    /// Noisy relation's domains do not extend its base's domains as a prefix
    #[error("noisy relation '{relation}' domains do not extend base '{base}' as a prefix")]
    DomainPrefixMismatch { relation: String, base: String },

    /// Observation value failed to parse as the relation's value type
    #[error("relation '{relation}': could not parse '{value}' as {expected}")]
    ObservationParse {
        relation: String,
        value: String,
        expected: ValueType,
    },

    /// Observation arity does not match the relation's domain count
    #[error("relation '{relation}': observation has {got} entities, expected {expected}")]
    ObservationArityMismatch {
        relation: String,
        expected: usize,
        got: usize,
    },

    /// Entity string has no code in the encoding
    #[error("domain '{domain}' has no encoding for entity '{entity}'")]
    UnknownEntity { domain: String, entity: String },

    /// Every hyperparameter grid point scored NaN
    #[error("all hyperparameter grid points for {family} are degenerate: {detail}")]
    HyperparameterDegeneracy { family: &'static str, detail: String },

    /// Malformed persisted-cluster or schema file
    #[error("parse error in {path} line {line}: {detail}")]
    FileFormat {
        path: String,
        line: usize,
        detail: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
