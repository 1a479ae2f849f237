//! Observation feeds and entity encoding.
//!
//! External data arrives as `(relation, entity strings, value string)`
//! rows. The encoder assigns each entity string an integer per domain;
//! incorporation parses values against the schema's declared types,
//! skipping unparseable rows, and handles noisy relations whose base
//! tuples have no clean value yet by sampling the base chain first.

use std::collections::BTreeMap;

use tracing::warn;

use crate::crp::Item;
use crate::error::{EngineError, Result};
use crate::hirm::Hirm;
use crate::irm::{Irm, Observation as EncodedObservation};
use crate::relation::Items;
use crate::schema::{relation_value_type, topological_order, RelationSchema, Schema};
use crate::value::Value;
use crate::Prng;

/// One raw observation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub relation: String,
    pub items: Vec<String>,
    pub value: String,
}

pub type Observations = Vec<Observation>;

/// Bidirectional entity-string encoding, per domain.
#[derive(Debug, Clone, Default)]
pub struct Encoding {
    pub item_to_code: BTreeMap<String, BTreeMap<String, Item>>,
    pub code_to_item: BTreeMap<String, BTreeMap<Item, String>>,
}

impl Encoding {
    pub fn code_of(&self, domain: &str, entity: &str) -> Result<Item> {
        self.item_to_code
            .get(domain)
            .and_then(|codes| codes.get(entity))
            .copied()
            .ok_or_else(|| EngineError::UnknownEntity {
                domain: domain.to_string(),
                entity: entity.to_string(),
            })
    }

    pub fn entity_of(&self, domain: &str, code: Item) -> Option<&str> {
        self.code_to_item
            .get(domain)
            .and_then(|entities| entities.get(&code))
            .map(String::as_str)
    }
}

/// Assign consecutive integer codes per domain, in observation order.
pub fn calculate_encoding(schema: &Schema, observations: &Observations) -> Result<Encoding> {
    let mut encoding = Encoding::default();
    let mut counters: BTreeMap<String, Item> = BTreeMap::new();
    for entry in schema.values() {
        for domain in entry.domains() {
            encoding.item_to_code.entry(domain.clone()).or_default();
            encoding.code_to_item.entry(domain.clone()).or_default();
            counters.entry(domain.clone()).or_insert(0);
        }
    }
    for observation in observations {
        let entry = schema
            .get(&observation.relation)
            .ok_or_else(|| EngineError::UnknownRelation(observation.relation.clone()))?;
        let domains = entry.domains();
        if observation.items.len() != domains.len() {
            return Err(EngineError::ObservationArityMismatch {
                relation: observation.relation.clone(),
                expected: domains.len(),
                got: observation.items.len(),
            });
        }
        for (domain, entity) in domains.iter().zip(&observation.items) {
            let codes = encoding
                .item_to_code
                .get_mut(domain)
                .expect("domain registered above");
            if !codes.contains_key(entity) {
                let counter = counters.get_mut(domain).expect("domain registered above");
                codes.insert(entity.clone(), *counter);
                encoding
                    .code_to_item
                    .get_mut(domain)
                    .expect("domain registered above")
                    .insert(*counter, entity.clone());
                *counter += 1;
            }
        }
    }
    Ok(encoding)
}

/// Mark every relation that appears in the feed as observed.
pub fn mark_observed(schema: &mut Schema, observations: &Observations) {
    for observation in observations {
        if let Some(entry) = schema.get_mut(&observation.relation) {
            match entry {
                RelationSchema::Clean { observed, .. }
                | RelationSchema::Noisy { observed, .. } => *observed = true,
            }
        }
    }
}

fn encode_items(schema: &Schema, encoding: &Encoding, observation: &Observation) -> Result<Items> {
    let domains = schema[&observation.relation].domains();
    domains
        .iter()
        .zip(&observation.items)
        .map(|(domain, entity)| encoding.code_of(domain, entity))
        .collect()
}

/// Parse and encode a raw observation against the schema.
fn encode_observation(
    schema: &Schema,
    encoding: &Encoding,
    observation: &Observation,
) -> Result<EncodedObservation> {
    let value_type = relation_value_type(schema, &observation.relation)?;
    let value = Value::parse(&observation.value, value_type, &observation.relation)?;
    let items = encode_items(schema, encoding, observation)?;
    Ok((observation.relation.clone(), items, value))
}

/// How incorporation went: rows absorbed and rows skipped over parse
/// failures.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IncorporationStats {
    pub incorporated: usize,
    pub skipped: usize,
}

/// Group raw observations by relation, preserving feed order.
fn group_by_relation(observations: &Observations) -> BTreeMap<String, Vec<&Observation>> {
    let mut grouped: BTreeMap<String, Vec<&Observation>> = BTreeMap::new();
    for observation in observations {
        grouped
            .entry(observation.relation.clone())
            .or_default()
            .push(observation);
    }
    grouped
}

/// Sample clean values for a noisy relation's base chain wherever the
/// observed tuple's base has none yet.
fn ensure_base_values_hirm(hirm: &mut Hirm, prng: &mut Prng, relation: &str, items: &Items) {
    let Some(base_name) = hirm.schema[relation].base().map(str::to_string) else {
        return;
    };
    let base_arity = hirm.schema[&base_name].domains().len();
    let base_items: Items = items[..base_arity].to_vec();
    if !hirm.get_relation(&base_name).data_contains(&base_items) {
        ensure_base_values_hirm(hirm, prng, &base_name, &base_items);
        hirm.sample_and_incorporate_relation(prng, &base_name, &base_items);
    }
}

fn ensure_base_values_irm(irm: &mut Irm, prng: &mut Prng, relation: &str, items: &Items) {
    let Some(base_name) = irm.schema[relation].base().map(str::to_string) else {
        return;
    };
    let base_arity = irm.schema[&base_name].domains().len();
    let base_items: Items = items[..base_arity].to_vec();
    if !irm.relations[&base_name].data_contains(&base_items) {
        ensure_base_values_irm(irm, prng, &base_name, &base_items);
        irm.sample_and_incorporate_relation(prng, &base_name, &base_items);
    }
}

/// Incorporate a feed into an HIRM, bases before dependents.
pub fn incorporate_observations_hirm(
    prng: &mut Prng,
    hirm: &mut Hirm,
    encoding: &Encoding,
    observations: &Observations,
) -> Result<IncorporationStats> {
    let mut stats = IncorporationStats::default();
    let grouped = group_by_relation(observations);
    for relation in topological_order(&hirm.schema)? {
        let Some(rows) = grouped.get(&relation) else {
            continue;
        };
        for observation in rows {
            match encode_observation(&hirm.schema, encoding, observation) {
                Ok((name, items, value)) => {
                    ensure_base_values_hirm(hirm, prng, &name, &items);
                    hirm.incorporate(prng, &name, &items, &value)?;
                    stats.incorporated += 1;
                }
                Err(EngineError::ObservationParse { relation, value, expected }) => {
                    warn!(%relation, %value, %expected, "skipping unparseable row");
                    stats.skipped += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
    Ok(stats)
}

/// Incorporate a feed into a standalone IRM.
pub fn incorporate_observations_irm(
    prng: &mut Prng,
    irm: &mut Irm,
    encoding: &Encoding,
    observations: &Observations,
) -> Result<IncorporationStats> {
    let mut stats = IncorporationStats::default();
    let grouped = group_by_relation(observations);
    for relation in topological_order(&irm.schema)? {
        let Some(rows) = grouped.get(&relation) else {
            continue;
        };
        for observation in rows {
            match encode_observation(&irm.schema, encoding, observation) {
                Ok((name, items, value)) => {
                    ensure_base_values_irm(irm, prng, &name, &items);
                    irm.incorporate(prng, &name, &items, &value)?;
                    stats.incorporated += 1;
                }
                Err(EngineError::ObservationParse { relation, value, expected }) => {
                    warn!(%relation, %value, %expected, "skipping unparseable row");
                    stats.skipped += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
    Ok(stats)
}

/// Marginal log probability of held-out rows under a fitted HIRM.
pub fn logp_hirm(
    prng: &mut Prng,
    hirm: &Hirm,
    encoding: &Encoding,
    observations: &Observations,
) -> Result<f64> {
    let encoded: Vec<EncodedObservation> = observations
        .iter()
        .map(|observation| encode_observation(&hirm.schema, encoding, observation))
        .collect::<Result<_>>()?;
    Ok(hirm.logp(&encoded, prng))
}

/// Marginal log probability of held-out rows under a fitted IRM.
pub fn logp_irm(
    prng: &mut Prng,
    irm: &Irm,
    encoding: &Encoding,
    observations: &Observations,
) -> Result<f64> {
    let encoded: Vec<EncodedObservation> = observations
        .iter()
        .map(|observation| encode_observation(&irm.schema, encoding, observation))
        .collect::<Result<_>>()?;
    Ok(irm.logp(&encoded, prng))
}

/// Concatenate feeds (used to build one encoding spanning training and
/// held-out rows).
pub fn merge_observations(first: &Observations, second: &Observations) -> Observations {
    let mut merged = first.clone();
    merged.extend(second.iter().cloned());
    merged
}
