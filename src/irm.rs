//! Infinite Relational Model
//!
//! An IRM owns a set of domains and the relations over them. Entities
//! cluster per domain through the domain CRPs; relation values are
//! conditionally independent given the tuple of cluster assignments.
//! Entity reassignment is exact Gibbs: a candidate table's weight is its
//! CRP seating weight times the incremental likelihood contribution of
//! every relation observing the entity.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::debug;

use crate::crp::{Item, Table};
use crate::domain::Domain;
use crate::error::{EngineError, Result};
use crate::math::{log_choice, logsumexp, product};
use crate::relation::clean::new_clean_relation;
use crate::relation::{
    ClusterKey, DomainMap, Items, NoisyRelation, Relation, RelationVariant,
};
use crate::schema::{topological_order, RelationSchema, Schema};
use crate::value::{Value, ValueType};
use crate::Prng;

/// One observation for scoring: relation name, entity tuple, value.
pub type Observation = (String, Items, Value);

pub struct Irm {
    pub schema: Schema,
    pub domains: DomainMap,
    pub relations: BTreeMap<String, RelationVariant>,
    pub domain_to_relations: BTreeMap<String, BTreeSet<String>>,
}

/// Build a relation cell from its schema entry. Noisy relations link to
/// the supplied base cell.
fn make_relation_cell(
    name: &str,
    entry: &RelationSchema,
    base: Option<RelationVariant>,
    prng: &mut Prng,
) -> Result<RelationVariant> {
    match entry {
        RelationSchema::Clean { domains, spec, .. } => Ok(match spec.value_type() {
            ValueType::Bool => RelationVariant::Bool(Rc::new(RefCell::new(Relation::Clean(
                new_clean_relation(name, spec.clone(), domains.clone(), prng)?,
            )))),
            ValueType::Int => RelationVariant::Int(Rc::new(RefCell::new(Relation::Clean(
                new_clean_relation(name, spec.clone(), domains.clone(), prng)?,
            )))),
            ValueType::Double => RelationVariant::Double(Rc::new(RefCell::new(Relation::Clean(
                new_clean_relation(name, spec.clone(), domains.clone(), prng)?,
            )))),
            ValueType::Str => RelationVariant::Str(Rc::new(RefCell::new(Relation::Clean(
                new_clean_relation(name, spec.clone(), domains.clone(), prng)?,
            )))),
        }),
        RelationSchema::Noisy {
            domains,
            spec,
            base: base_name,
            ..
        } => {
            let base_cell = base.ok_or_else(|| EngineError::UnknownBaseRelation {
                relation: name.to_string(),
                base: base_name.clone(),
            })?;
            Ok(match base_cell {
                RelationVariant::Bool(cell) => {
                    RelationVariant::Bool(Rc::new(RefCell::new(Relation::Noisy(
                        NoisyRelation::new(name, spec.clone(), domains.clone(), base_name.as_str(), cell)?,
                    ))))
                }
                RelationVariant::Int(cell) => {
                    RelationVariant::Int(Rc::new(RefCell::new(Relation::Noisy(
                        NoisyRelation::new(name, spec.clone(), domains.clone(), base_name.as_str(), cell)?,
                    ))))
                }
                RelationVariant::Double(cell) => {
                    RelationVariant::Double(Rc::new(RefCell::new(Relation::Noisy(
                        NoisyRelation::new(name, spec.clone(), domains.clone(), base_name.as_str(), cell)?,
                    ))))
                }
                RelationVariant::Str(cell) => {
                    RelationVariant::Str(Rc::new(RefCell::new(Relation::Noisy(
                        NoisyRelation::new(name, spec.clone(), domains.clone(), base_name.as_str(), cell)?,
                    ))))
                }
            })
        }
    }
}

impl Irm {
    /// An IRM with no relations yet.
    pub fn empty() -> Self {
        Irm {
            schema: Schema::new(),
            domains: DomainMap::new(),
            relations: BTreeMap::new(),
            domain_to_relations: BTreeMap::new(),
        }
    }

    /// Build an IRM from a schema, adding relations base-first.
    pub fn new(schema: &Schema, prng: &mut Prng) -> Result<Self> {
        let mut irm = Irm::empty();
        for name in topological_order(schema)? {
            irm.add_relation(prng, &name, schema[&name].clone())?;
        }
        Ok(irm)
    }

    /// Add a relation whose base (if any) already lives in this IRM.
    pub fn add_relation(
        &mut self,
        prng: &mut Prng,
        name: &str,
        entry: RelationSchema,
    ) -> Result<()> {
        let base = match entry.base() {
            Some(base_name) => Some(self.relations.get(base_name).cloned().ok_or_else(|| {
                EngineError::UnknownBaseRelation {
                    relation: name.to_string(),
                    base: base_name.to_string(),
                }
            })?),
            None => None,
        };
        let cell = make_relation_cell(name, &entry, base, prng)?;
        self.install_relation(name, entry, cell);
        Ok(())
    }

    /// Add a relation with an explicitly supplied base cell (used when the
    /// cell was built elsewhere, e.g. during a relation move).
    pub fn add_relation_with_base(
        &mut self,
        prng: &mut Prng,
        name: &str,
        entry: RelationSchema,
        base: RelationVariant,
    ) -> Result<()> {
        let cell = make_relation_cell(name, &entry, Some(base), prng)?;
        self.install_relation(name, entry, cell);
        Ok(())
    }

    /// Register a prebuilt relation cell under this IRM.
    pub fn install_relation(&mut self, name: &str, entry: RelationSchema, cell: RelationVariant) {
        assert!(
            !self.relations.contains_key(name),
            "relation {name} added twice"
        );
        for domain in entry.domains() {
            self.domains
                .entry(domain.clone())
                .or_insert_with(|| Domain::new(domain.clone()));
            self.domain_to_relations
                .entry(domain.clone())
                .or_default()
                .insert(name.to_string());
        }
        self.schema.insert(name.to_string(), entry);
        self.relations.insert(name.to_string(), cell);
    }

    /// Remove a relation, releasing domain items no other relation in this
    /// IRM observes and garbage-collecting unreferenced domains.
    pub fn remove_relation(&mut self, name: &str) -> RelationVariant {
        let cell = self
            .relations
            .remove(name)
            .unwrap_or_else(|| panic!("unknown relation {name}"));
        let rel_domains: BTreeSet<String> = cell.domain_names().into_iter().collect();
        for domain in &rel_domains {
            let members = self
                .domain_to_relations
                .get_mut(domain)
                .expect("domain indexed for its relations");
            members.remove(name);
            for item in cell.items_of(domain) {
                let observed_elsewhere = self
                    .domain_to_relations
                    .get(domain)
                    .is_some_and(|others| {
                        others
                            .iter()
                            .any(|other| self.relations[other].has_observation(domain, item))
                    });
                if !observed_elsewhere && self.domains[domain].has_item(item) {
                    self.domains
                        .get_mut(domain)
                        .expect("domain exists")
                        .unincorporate(item);
                }
            }
            if self.domain_to_relations[domain].is_empty() {
                self.domain_to_relations.remove(domain);
                self.domains.remove(domain);
            }
        }
        self.schema.remove(name);
        cell
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn incorporate(
        &mut self,
        prng: &mut Prng,
        name: &str,
        items: &Items,
        value: &Value,
    ) -> Result<()> {
        let relation = self
            .relations
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRelation(name.to_string()))?;
        if items.len() != relation.arity() {
            return Err(EngineError::ObservationArityMismatch {
                relation: name.to_string(),
                expected: relation.arity(),
                got: items.len(),
            });
        }
        relation.incorporate(prng, &mut self.domains, items, value);
        Ok(())
    }

    pub fn unincorporate(&mut self, name: &str, items: &Items) {
        let relation = self.relations[name].clone();
        relation.unincorporate(&mut self.domains, items);
    }

    /// Draw a value for a new tuple from the relation's current clusters
    /// and incorporate it.
    pub fn sample_and_incorporate_relation(
        &mut self,
        prng: &mut Prng,
        name: &str,
        items: &Items,
    ) -> Value {
        let relation = self.relations[name].clone();
        relation.sample_and_incorporate(prng, &mut self.domains, items)
    }

    /// Does any relation in this IRM observe `item` in `domain`?
    pub fn has_observation(&self, domain: &str, item: Item) -> bool {
        self.domain_to_relations
            .get(domain)
            .is_some_and(|members| {
                members
                    .iter()
                    .any(|name| self.relations[name].has_observation(domain, item))
            })
    }

    /// Gibbs-reseat one entity, scoring every candidate table through the
    /// relations that observe it.
    pub fn transition_cluster_assignment_item(
        &mut self,
        prng: &mut Prng,
        domain: &str,
        item: Item,
    ) {
        let crp_dist = self.domains[domain].tables_weights_gibbs(item);
        let mut tables = Vec::with_capacity(crp_dist.len());
        let mut logps = Vec::with_capacity(crp_dist.len());
        for (table, weight) in &crp_dist {
            tables.push(*table);
            logps.push(weight.ln());
        }

        let members: Vec<String> = self
            .domain_to_relations
            .get(domain)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for name in &members {
            let relation = self.relations[name].clone();
            if relation.has_observation(domain, item) {
                let lp_relation =
                    relation.logp_gibbs_exact(&self.domains, domain, item, &tables, prng);
                assert_eq!(lp_relation.len(), logps.len());
                for (lp, lp_rel) in logps.iter_mut().zip(lp_relation) {
                    *lp += lp_rel;
                }
            }
        }

        let choice = tables[log_choice(&logps, prng)];
        if choice != self.domains[domain].cluster_of(item) {
            debug!(domain, item, table = choice, "reseating entity");
            for name in &members {
                let relation = self.relations[name].clone();
                if relation.has_observation(domain, item) {
                    relation.set_cluster_assignment_gibbs(&self.domains, domain, item, choice, prng);
                }
            }
            self.domains
                .get_mut(domain)
                .expect("domain exists")
                .set_cluster_assignment_gibbs(item, choice);
        }
    }

    pub fn transition_cluster_assignments_all(&mut self, prng: &mut Prng) {
        let plan: Vec<(String, Vec<Item>)> = self
            .domains
            .iter()
            .map(|(name, domain)| (name.clone(), domain.items.iter().copied().collect()))
            .collect();
        for (domain, items) in plan {
            for item in items {
                self.transition_cluster_assignment_item(prng, &domain, item);
            }
        }
    }

    pub fn transition_cluster_assignments(&mut self, prng: &mut Prng, domains: &[String]) {
        for domain in domains {
            let items: Vec<Item> = self.domains[domain].items.iter().copied().collect();
            for item in items {
                self.transition_cluster_assignment_item(prng, domain, item);
            }
        }
    }

    /// Joint marginal likelihood of a batch of observations, enumerating
    /// table combinations for every entity absent from its domain.
    pub fn logp(&self, observations: &[Observation], prng: &mut Prng) -> f64 {
        let mut seen_tuples: BTreeMap<String, BTreeSet<Items>> = BTreeMap::new();
        let mut seen_items: BTreeSet<(String, Item)> = BTreeSet::new();
        let mut index_universe: Vec<Vec<usize>> = Vec::new();
        let mut weight_universe: Vec<Vec<f64>> = Vec::new();
        let mut cluster_universe: BTreeMap<(String, Item), (usize, Vec<Table>)> = BTreeMap::new();

        for (name, items, _) in observations {
            assert!(
                seen_tuples
                    .entry(name.clone())
                    .or_default()
                    .insert(items.clone()),
                "duplicate observation for {name} {items:?}"
            );
            let relation = &self.relations[name];
            let domain_names = relation.domain_names();
            assert_eq!(items.len(), domain_names.len());
            for (domain_name, item) in domain_names.iter().zip(items) {
                if !seen_items.insert((domain_name.clone(), *item)) {
                    continue;
                }
                let domain = &self.domains[domain_name];
                let (t_list, w_list) = if domain.has_item(*item) {
                    (vec![domain.cluster_of(*item)], vec![0.0])
                } else {
                    let weights = domain.tables_weights();
                    let z = (domain.crp.alpha + domain.crp.n as f64).ln();
                    let mut t_list = Vec::with_capacity(weights.len());
                    let mut w_list = Vec::with_capacity(weights.len());
                    for (table, weight) in &weights {
                        t_list.push(*table);
                        w_list.push(weight.ln() - z);
                    }
                    (t_list, w_list)
                };
                let loc = index_universe.len();
                index_universe.push((0..t_list.len()).collect());
                weight_universe.push(w_list);
                cluster_universe.insert((domain_name.clone(), *item), (loc, t_list));
            }
        }

        let mut logps = Vec::new();
        for indexes in product(&index_universe) {
            let mut logp_combination: f64 = indexes
                .iter()
                .enumerate()
                .map(|(loc, &index)| weight_universe[loc][index])
                .sum();
            for (name, items, value) in observations {
                let relation = &self.relations[name];
                let key: ClusterKey = relation
                    .domain_names()
                    .iter()
                    .zip(items)
                    .map(|(domain_name, item)| {
                        let (loc, t_list) = &cluster_universe[&(domain_name.clone(), *item)];
                        t_list[indexes[*loc]]
                    })
                    .collect();
                logp_combination += relation.cluster_or_prior_logp(prng, &key, items, value);
            }
            logps.push(logp_combination);
        }
        logsumexp(&logps)
    }

    /// Joint score of the domain partitions and every relation's clusters.
    pub fn logp_score(&self) -> f64 {
        let crp_score: f64 = self
            .domains
            .values()
            .map(|domain| domain.crp.logp_score())
            .sum();
        let relation_score: f64 = self.relations.values().map(RelationVariant::logp_score).sum();
        let total = crp_score + relation_score;
        assert!(!total.is_nan(), "IRM logp_score is NaN");
        total
    }

    /// Resample relation cluster hyperparameters and domain concentration
    /// parameters.
    pub fn transition_hyperparameters(
        &mut self,
        prng: &mut Prng,
        num_theta_steps: usize,
    ) -> Result<()> {
        for relation in self.relations.values() {
            relation.transition_cluster_hparams(prng, num_theta_steps)?;
        }
        for domain in self.domains.values_mut() {
            domain.crp.transition_alpha(prng);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{DistributionFamily, DistributionSpec};
    use crate::emissions::{EmissionFamily, EmissionSpec};
    use rand::SeedableRng;

    fn two_relation_schema() -> Schema {
        let mut schema = Schema::new();
        schema.insert(
            "R1".to_string(),
            RelationSchema::Clean {
                domains: vec!["D1".to_string(), "D1".to_string()],
                spec: DistributionSpec::new(DistributionFamily::Bernoulli),
                observed: true,
            },
        );
        schema.insert(
            "R2".to_string(),
            RelationSchema::Clean {
                domains: vec!["D1".to_string(), "D2".to_string()],
                spec: DistributionSpec::new(DistributionFamily::Bernoulli),
                observed: true,
            },
        );
        schema
    }

    #[test]
    fn test_new_creates_domains() {
        let mut prng = Prng::seed_from_u64(1);
        let irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();
        assert_eq!(irm.domains.len(), 2);
        assert_eq!(irm.domain_to_relations["D1"].len(), 2);
        assert_eq!(irm.domain_to_relations["D2"].len(), 1);
    }

    #[test]
    fn test_incorporate_and_score() {
        let mut prng = Prng::seed_from_u64(2);
        let mut irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();
        irm.incorporate(&mut prng, "R1", &vec![0, 1], &Value::Bool(true))
            .unwrap();
        irm.incorporate(&mut prng, "R1", &vec![1, 1], &Value::Bool(true))
            .unwrap();
        irm.incorporate(&mut prng, "R2", &vec![0, 0], &Value::Bool(false))
            .unwrap();
        assert!(irm.logp_score() < 0.0);
        assert!(irm.has_observation("D1", 0));
        assert!(!irm.has_observation("D2", 3));
    }

    #[test]
    fn test_arity_mismatch_is_an_error() {
        let mut prng = Prng::seed_from_u64(3);
        let mut irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();
        assert!(matches!(
            irm.incorporate(&mut prng, "R1", &vec![0], &Value::Bool(true)),
            Err(EngineError::ObservationArityMismatch { .. })
        ));
    }

    #[test]
    fn test_transition_cluster_assignment_keeps_score_finite() {
        let mut prng = Prng::seed_from_u64(4);
        let mut irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();
        for i in 0..6 {
            irm.incorporate(&mut prng, "R1", &vec![i, (i + 1) % 6], &Value::Bool(i % 2 == 0))
                .unwrap();
            irm.incorporate(&mut prng, "R2", &vec![i, 0], &Value::Bool(true))
                .unwrap();
        }
        for _ in 0..5 {
            irm.transition_cluster_assignments_all(&mut prng);
        }
        assert!(irm.logp_score().is_finite());
        // Round-trip consistency: unincorporating everything zeroes the
        // relation contribution.
        for i in 0..6 {
            irm.unincorporate("R1", &vec![i, (i + 1) % 6]);
            irm.unincorporate("R2", &vec![i, 0]);
        }
        assert_eq!(irm.relations["R1"].data_len(), 0);
    }

    #[test]
    fn test_logp_matches_score_delta_for_fresh_entities() {
        // Property: for an observation whose entities are all absent, logp
        // equals the logsumexp over incorporation into every table
        // combination (including the fresh table).
        let mut prng = Prng::seed_from_u64(5);
        let mut irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();
        for i in 0..4 {
            irm.incorporate(&mut prng, "R2", &vec![i, i], &Value::Bool(true))
                .unwrap();
        }
        let observation = vec![(
            "R2".to_string(),
            vec![17, 23],
            Value::Bool(true),
        )];
        let lp = irm.logp(&observation, &mut prng);
        assert!(lp.is_finite() && lp < 0.0);

        // Manual enumeration over both domains' seatings.
        let d1 = &irm.domains["D1"];
        let d2 = &irm.domains["D2"];
        let z1 = (d1.crp.alpha + d1.crp.n as f64).ln();
        let z2 = (d2.crp.alpha + d2.crp.n as f64).ln();
        let mut manual = Vec::new();
        for (t1, w1) in d1.tables_weights() {
            for (t2, w2) in d2.tables_weights() {
                let key = vec![t1, t2];
                let cluster_lp = irm.relations["R2"].cluster_or_prior_logp(
                    &mut prng,
                    &key,
                    &vec![17, 23],
                    &Value::Bool(true),
                );
                manual.push(w1.ln() - z1 + w2.ln() - z2 + cluster_lp);
            }
        }
        let expected = crate::math::logsumexp(&manual);
        assert!((lp - expected).abs() < 1e-9, "{lp} vs {expected}");
    }

    #[test]
    fn test_remove_relation_releases_domains() {
        let mut prng = Prng::seed_from_u64(6);
        let mut irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();
        irm.incorporate(&mut prng, "R1", &vec![0, 1], &Value::Bool(true))
            .unwrap();
        irm.incorporate(&mut prng, "R2", &vec![0, 5], &Value::Bool(false))
            .unwrap();

        irm.remove_relation("R2");
        assert!(!irm.has_relation("R2"));
        // D2 had no other relation and disappears entirely.
        assert!(!irm.domains.contains_key("D2"));
        // Item 0 is still observed by R1 and stays in D1.
        assert!(irm.domains["D1"].has_item(0));
    }

    #[test]
    fn test_noisy_relation_in_irm() {
        let mut prng = Prng::seed_from_u64(7);
        let mut schema = Schema::new();
        schema.insert(
            "base".to_string(),
            RelationSchema::Clean {
                domains: vec!["D1".to_string()],
                spec: DistributionSpec::new(DistributionFamily::Normal),
                observed: false,
            },
        );
        schema.insert(
            "obs".to_string(),
            RelationSchema::Noisy {
                domains: vec!["D1".to_string(), "D2".to_string()],
                spec: EmissionSpec::new(EmissionFamily::Gaussian, true),
                base: "base".to_string(),
                observed: true,
            },
        );
        let mut irm = Irm::new(&schema, &mut prng).unwrap();
        irm.incorporate(&mut prng, "base", &vec![0], &Value::Double(1.0))
            .unwrap();
        irm.incorporate(&mut prng, "obs", &vec![0, 0], &Value::Double(1.1))
            .unwrap();
        irm.incorporate(&mut prng, "obs", &vec![0, 1], &Value::Double(0.9))
            .unwrap();
        assert!(irm.logp_score().is_finite());

        // Gibbs over the shared entity keeps the model consistent.
        irm.transition_cluster_assignment_item(&mut prng, "D1", 0);
        assert_eq!(irm.relations["obs"].data_len(), 2);
    }
}
