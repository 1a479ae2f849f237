//! Class-level schema for entity-linkage models, and its translation into
//! a relation schema.
//!
//! A class declares scalar attributes and reference fields (foreign keys
//! into other classes). A query names a record class and the fields
//! observed for it, each traversing a path of reference fields. The
//! translation produces one clean relation per scalar attribute and a
//! chain of noisy relations per query field, and computes the reference
//! index tables the linkage resampler walks.

use std::collections::{BTreeMap, BTreeSet};

use crate::distributions::{DistributionFamily, DistributionSpec};
use crate::emissions::{EmissionFamily, EmissionSpec};
use crate::error::{EngineError, Result};
use crate::schema::{RelationSchema, Schema};

/// One variable of a class.
#[derive(Debug, Clone, PartialEq)]
pub enum VarSpec {
    /// Scalar attribute with its distribution family.
    Scalar(DistributionSpec),
    /// Reference field naming the class it points into.
    Reference(String),
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    /// Declaration-ordered variables.
    pub vars: Vec<(String, VarSpec)>,
}

impl ClassDef {
    pub fn var(&self, name: &str) -> Option<&VarSpec> {
        self.vars
            .iter()
            .find(|(var_name, _)| var_name == name)
            .map(|(_, spec)| spec)
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter().filter_map(|(name, spec)| match spec {
            VarSpec::Reference(class) => Some((name, class)),
            VarSpec::Scalar(_) => None,
        })
    }
}

/// A query field: observed under `name`, reached by walking `class_path`
/// from the record class (reference fields, then a final scalar
/// attribute).
#[derive(Debug, Clone)]
pub struct QueryField {
    pub name: String,
    pub class_path: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ClassSchema {
    pub classes: BTreeMap<String, ClassDef>,
    pub record_class: String,
    pub query_fields: BTreeMap<String, QueryField>,
}

/// Reference indices: relation name, then domain position of a class,
/// then reference field name, to the domain position holding the
/// referenced class's primary slot.
pub type ReferenceIndices = BTreeMap<String, BTreeMap<usize, BTreeMap<String, usize>>>;

/// Everything GenDB needs from translation.
pub struct TranslatedSchema {
    pub relations: Schema,
    /// Per class: its relation domains, primary slot last.
    pub class_domains: BTreeMap<String, Vec<String>>,
    pub reference_indices: ReferenceIndices,
    /// Relations whose primary (last) domain is the given class.
    pub class_to_relations: BTreeMap<String, Vec<String>>,
}

/// Emission family observing an attribute with the given distribution
/// family.
fn emission_for(spec: &DistributionSpec) -> Result<EmissionSpec> {
    let emission = match spec.family {
        DistributionFamily::Bernoulli => EmissionSpec::new(EmissionFamily::BitFlip, true),
        DistributionFamily::Categorical => {
            let mut emission = EmissionSpec::new(EmissionFamily::Categorical, true);
            emission.args = spec.args.clone();
            emission
        }
        DistributionFamily::Normal => EmissionSpec::new(EmissionFamily::Gaussian, true),
        DistributionFamily::Bigram | DistributionFamily::StringCat => {
            EmissionSpec::new(EmissionFamily::BigramString, false)
        }
        DistributionFamily::Skellam => {
            return Err(EngineError::FamilyTypeMismatch {
                family: "skellam".to_string(),
                value_type: spec.value_type(),
            })
        }
    };
    Ok(emission)
}

/// Annotated domain paths per class: reference-field path joined by `:`,
/// ending in the node's class name; the class's own primary slot comes
/// last.
fn compute_annotated_domains(
    schema: &ClassSchema,
    class: &str,
    cache: &mut BTreeMap<String, Vec<String>>,
    in_progress: &mut BTreeSet<String>,
) -> Result<Vec<String>> {
    if let Some(found) = cache.get(class) {
        return Ok(found.clone());
    }
    if !in_progress.insert(class.to_string()) {
        return Err(EngineError::CyclicSchema(class.to_string()));
    }
    let def = schema
        .classes
        .get(class)
        .ok_or_else(|| EngineError::UnknownRelation(class.to_string()))?;
    let mut annotated = Vec::new();
    for (var_name, ref_class) in def.reference_fields() {
        let child = compute_annotated_domains(schema, ref_class, cache, in_progress)?;
        for entry in child {
            annotated.push(format!("{var_name}:{entry}"));
        }
    }
    annotated.push(class.to_string());
    in_progress.remove(class);
    cache.insert(class.to_string(), annotated.clone());
    Ok(annotated)
}

/// Class name of an annotated entry (its final path token).
fn entry_class(entry: &str) -> &str {
    entry.rsplit(':').next().expect("split never yields nothing")
}

/// Path prefix of an annotated entry (everything before the class token).
fn entry_prefix(entry: &str) -> &str {
    match entry.rfind(':') {
        Some(position) => &entry[..=position],
        None => "",
    }
}

/// Reference indices of one relation from its annotated domain ordering.
fn reference_indices_for(
    schema: &ClassSchema,
    annotated: &[String],
) -> BTreeMap<usize, BTreeMap<String, usize>> {
    let mut indices = BTreeMap::new();
    for (position, entry) in annotated.iter().enumerate() {
        let class = entry_class(entry);
        let prefix = entry_prefix(entry);
        let def = &schema.classes[class];
        let mut fields = BTreeMap::new();
        for (var_name, ref_class) in def.reference_fields() {
            let child_entry = format!("{prefix}{var_name}:{ref_class}");
            let child_position = annotated
                .iter()
                .position(|candidate| candidate == &child_entry)
                .expect("annotated list is closed under references");
            fields.insert(var_name.clone(), child_position);
        }
        if !fields.is_empty() {
            indices.insert(position, fields);
        }
    }
    indices
}

fn plain_domains(annotated: &[String]) -> Vec<String> {
    annotated
        .iter()
        .map(|entry| entry_class(entry).to_string())
        .collect()
}

/// Translate a class schema into the relation schema GenDB runs on.
pub fn translate_schema(schema: &ClassSchema) -> Result<TranslatedSchema> {
    let mut cache = BTreeMap::new();
    for class in schema.classes.keys() {
        compute_annotated_domains(schema, class, &mut cache, &mut BTreeSet::new())?;
    }
    if !schema.classes.contains_key(&schema.record_class) {
        return Err(EngineError::UnknownRelation(schema.record_class.clone()));
    }

    let mut relations = Schema::new();
    let mut reference_indices = ReferenceIndices::new();

    // One latent clean relation per scalar attribute.
    for (class_name, def) in &schema.classes {
        for (var_name, spec) in &def.vars {
            if let VarSpec::Scalar(dist) = spec {
                let relation_name = format!("{class_name}:{var_name}");
                let annotated = &cache[class_name];
                relations.insert(
                    relation_name.clone(),
                    RelationSchema::Clean {
                        domains: plain_domains(annotated),
                        spec: dist.clone(),
                        observed: false,
                    },
                );
                reference_indices
                    .insert(relation_name, reference_indices_for(schema, annotated));
            }
        }
    }

    // One noisy chain (or renamed clean relation) per query field.
    for field in schema.query_fields.values() {
        add_relations_for_query_field(schema, &cache, field, &mut relations, &mut reference_indices)?;
    }

    let mut class_to_relations: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, entry) in &relations {
        let primary = entry
            .domains()
            .last()
            .expect("relations have at least one domain")
            .clone();
        class_to_relations.entry(primary).or_default().push(name.clone());
    }

    Ok(TranslatedSchema {
        relations,
        class_domains: cache
            .iter()
            .map(|(class, annotated)| (class.clone(), plain_domains(annotated)))
            .collect(),
        reference_indices,
        class_to_relations,
    })
}

fn add_relations_for_query_field(
    schema: &ClassSchema,
    cache: &BTreeMap<String, Vec<String>>,
    field: &QueryField,
    relations: &mut Schema,
    reference_indices: &mut ReferenceIndices,
) -> Result<()> {
    assert!(!field.class_path.is_empty(), "query field with empty path");

    // Resolve the classes along the path and the terminal attribute.
    let mut classes = vec![schema.record_class.clone()];
    for step in &field.class_path[..field.class_path.len() - 1] {
        let current = &schema.classes[classes.last().expect("non-empty")];
        match current.var(step) {
            Some(VarSpec::Reference(next)) => classes.push(next.clone()),
            _ => return Err(EngineError::UnknownRelation(format!(
                "{}.{step}",
                current.name
            ))),
        }
    }
    let attr_name = field.class_path.last().expect("non-empty");
    let attr_class = classes.last().expect("non-empty").clone();
    let attr_spec = match schema.classes[&attr_class].var(attr_name) {
        Some(VarSpec::Scalar(spec)) => spec.clone(),
        _ => {
            return Err(EngineError::UnknownRelation(format!(
                "{attr_class}.{attr_name}"
            )))
        }
    };
    let base_relation_name = format!("{attr_class}:{attr_name}");

    // Attribute directly on the record class: rename the clean relation
    // and mark it observed.
    if field.class_path.len() == 1 {
        let entry = relations
            .remove(&base_relation_name)
            .expect("scalar relations created before query fields");
        let RelationSchema::Clean { domains, spec, .. } = entry else {
            unreachable!("scalar attribute relations are clean");
        };
        relations.insert(
            field.name.clone(),
            RelationSchema::Clean {
                domains,
                spec,
                observed: true,
            },
        );
        let indices = reference_indices
            .remove(&base_relation_name)
            .expect("indices recorded with the relation");
        reference_indices.insert(field.name.clone(), indices);
        return Ok(());
    }

    // Ordered annotated domains per level, base levels first in each
    // prefix so noisy domains extend their base's as required.
    let depth = field.class_path.len() - 1;
    let mut ordered: Vec<Vec<String>> = vec![Vec::new(); depth + 1];
    ordered[depth] = cache[&attr_class].clone();
    for level in (0..depth).rev() {
        let step = &field.class_path[level];
        let mut entries: Vec<String> = ordered[level + 1]
            .iter()
            .map(|entry| format!("{step}:{entry}"))
            .collect();
        let prefix = format!("{step}:");
        for entry in &cache[&classes[level]] {
            if !entry.starts_with(&prefix) {
                entries.push(entry.clone());
            }
        }
        ordered[level] = entries;
    }

    let emission = emission_for(&attr_spec)?;
    let mut previous_relation = base_relation_name.clone();
    for level in (0..depth).rev() {
        let relation_name = if level == 0 {
            field.name.clone()
        } else {
            format!(
                "{}:{}::{base_relation_name}",
                classes[level], field.class_path[level]
            )
        };
        if !relations.contains_key(&relation_name) {
            relations.insert(
                relation_name.clone(),
                RelationSchema::Noisy {
                    domains: plain_domains(&ordered[level]),
                    spec: emission.clone(),
                    base: previous_relation.clone(),
                    observed: level == 0,
                },
            );
            reference_indices.insert(
                relation_name.clone(),
                reference_indices_for(schema, &ordered[level]),
            );
        }
        previous_relation = relation_name;
    }
    Ok(())
}
