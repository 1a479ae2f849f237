//! Relation-level schema: what each relation is, over which domains, and
//! how its values are modeled.
//!
//! A schema maps relation names to either a clean relation (values drawn
//! directly from a cluster-conditional distribution) or a noisy relation
//! (values drawn from an emission channel applied to a base relation's
//! clean value). Validation runs at model construction time: unknown
//! bases, cyclic base references, domain-prefix violations, and
//! family/type mismatches are all fatal before any data is touched.

use std::collections::{BTreeMap, BTreeSet};

use crate::distributions::DistributionSpec;
use crate::emissions::EmissionSpec;
use crate::error::{EngineError, Result};
use crate::value::ValueType;

/// Declaration of a single relation.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationSchema {
    Clean {
        domains: Vec<String>,
        spec: DistributionSpec,
        observed: bool,
    },
    Noisy {
        domains: Vec<String>,
        spec: EmissionSpec,
        base: String,
        observed: bool,
    },
}

impl RelationSchema {
    pub fn domains(&self) -> &[String] {
        match self {
            RelationSchema::Clean { domains, .. } | RelationSchema::Noisy { domains, .. } => {
                domains
            }
        }
    }

    pub fn is_observed(&self) -> bool {
        match self {
            RelationSchema::Clean { observed, .. } | RelationSchema::Noisy { observed, .. } => {
                *observed
            }
        }
    }

    pub fn base(&self) -> Option<&str> {
        match self {
            RelationSchema::Clean { .. } => None,
            RelationSchema::Noisy { base, .. } => Some(base),
        }
    }
}

/// A full model schema: relation name to declaration.
pub type Schema = BTreeMap<String, RelationSchema>;

/// Value type of a relation, following base links for noisy relations.
pub fn relation_value_type(schema: &Schema, name: &str) -> Result<ValueType> {
    let mut current = name;
    for _ in 0..=schema.len() {
        let entry = schema
            .get(current)
            .ok_or_else(|| EngineError::UnknownRelation(current.to_string()))?;
        match entry {
            RelationSchema::Clean { spec, .. } => return Ok(spec.value_type()),
            RelationSchema::Noisy { base, .. } => current = base,
        }
    }
    Err(EngineError::CyclicSchema(name.to_string()))
}

/// Relations ordered so that every base precedes its dependents.
pub fn topological_order(schema: &Schema) -> Result<Vec<String>> {
    let mut order = Vec::with_capacity(schema.len());
    let mut placed = BTreeSet::new();
    let mut in_progress = BTreeSet::new();

    fn visit(
        schema: &Schema,
        name: &str,
        placed: &mut BTreeSet<String>,
        in_progress: &mut BTreeSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if placed.contains(name) {
            return Ok(());
        }
        if !in_progress.insert(name.to_string()) {
            return Err(EngineError::CyclicSchema(name.to_string()));
        }
        if let Some(RelationSchema::Noisy { base, .. }) = schema.get(name) {
            if !schema.contains_key(base) {
                return Err(EngineError::UnknownBaseRelation {
                    relation: name.to_string(),
                    base: base.clone(),
                });
            }
            visit(schema, base, placed, in_progress, order)?;
        }
        in_progress.remove(name);
        placed.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    for name in schema.keys() {
        visit(schema, name, &mut placed, &mut in_progress, &mut order)?;
    }
    Ok(order)
}

/// Validate a schema: base links resolve and are acyclic, noisy domains
/// extend their base's domains as a prefix, and emission types agree with
/// the base relation's value type.
pub fn validate_schema(schema: &Schema) -> Result<()> {
    topological_order(schema)?;
    for (name, entry) in schema {
        if let RelationSchema::Noisy {
            domains,
            spec,
            base,
            ..
        } = entry
        {
            let base_entry = schema
                .get(base)
                .ok_or_else(|| EngineError::UnknownBaseRelation {
                    relation: name.clone(),
                    base: base.clone(),
                })?;
            let base_domains = base_entry.domains();
            if domains.len() < base_domains.len()
                || &domains[..base_domains.len()] != base_domains
            {
                return Err(EngineError::DomainPrefixMismatch {
                    relation: name.clone(),
                    base: base.clone(),
                });
            }
            let base_type = relation_value_type(schema, base)?;
            if spec.value_type() != base_type {
                return Err(EngineError::FamilyTypeMismatch {
                    family: spec.name(),
                    value_type: base_type,
                });
            }
        }
    }
    Ok(())
}

/// Noisy relations grouped under their base relation's name.
pub fn base_to_noisy(schema: &Schema) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, entry) in schema {
        if let Some(base) = entry.base() {
            map.entry(base.to_string()).or_default().push(name.clone());
        }
    }
    map
}

/// The transitive dependents of `name` (noisy relations observing it,
/// directly or through a chain), depth first.
pub fn transitive_dependents(schema: &Schema, name: &str) -> Vec<String> {
    let index = base_to_noisy(schema);
    let mut dependents = Vec::new();
    let mut stack = vec![name.to_string()];
    while let Some(current) = stack.pop() {
        if let Some(children) = index.get(&current) {
            for child in children {
                dependents.push(child.clone());
                stack.push(child.clone());
            }
        }
    }
    dependents
}

/// Root of the base chain containing `name` (itself, for clean relations).
pub fn chain_root<'a>(schema: &'a Schema, name: &'a str) -> &'a str {
    let mut current = name;
    while let Some(RelationSchema::Noisy { base, .. }) = schema.get(current) {
        current = base;
    }
    current
}

/// Split a textual family spec `name` or `name(k=v,k2=v2)` into its name
/// and parameter map.
pub fn parse_name_and_parameters(text: &str) -> Result<(String, BTreeMap<String, String>)> {
    let text = text.trim();
    let Some(open) = text.find('(') else {
        return Ok((text.to_string(), BTreeMap::new()));
    };
    let name = text[..open].to_string();
    let inner = text[open..]
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| EngineError::UnknownFamily(text.to_string()))?;
    let mut args = BTreeMap::new();
    for part in inner.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| EngineError::UnknownFamily(text.to_string()))?;
        args.insert(key.trim().to_string(), value.to_string());
    }
    Ok((name, args))
}
