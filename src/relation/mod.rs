//! Relations: tuples of entities mapped to values through
//! cluster-conditional models.
//!
//! [`Relation`] is the static dispatch between clean and noisy relations
//! of one value type; [`RelationVariant`] is the dynamic dispatch over
//! the four supported value types, holding shared cells so a noisy
//! relation can keep a non-owning link to its base.

pub mod buckets;
pub mod clean;
pub mod latent;
pub mod noisy;

pub use buckets::{ClusterKey, DomainMap, Items};
pub use clean::CleanRelation;
pub use latent::transition_latent_value;
pub use noisy::{EmissionRelation, NoisyRelation};

use std::cell::RefCell;
use std::rc::Rc;

use crate::crp::{Item, Table};
use crate::error::Result;
use crate::value::{RelationValue, Value};
use crate::Prng;

/// A relation of one concrete value type.
pub enum Relation<V: RelationValue> {
    Clean(CleanRelation<V>),
    Noisy(NoisyRelation<V>),
}

/// Shared handle to a relation. Noisy relations hold one for their base;
/// the owning IRM holds another. The cell identity is stable across
/// IRM-to-IRM moves so base links never dangle.
pub type RelationCell<V> = Rc<RefCell<Relation<V>>>;

impl<V: RelationValue> Relation<V> {
    pub fn name(&self) -> &str {
        match self {
            Relation::Clean(r) => &r.name,
            Relation::Noisy(r) => &r.name,
        }
    }

    pub fn domains(&self) -> &[String] {
        match self {
            Relation::Clean(r) => &r.domains,
            Relation::Noisy(r) => r.domains(),
        }
    }

    pub fn arity(&self) -> usize {
        self.domains().len()
    }

    pub fn contains(&self, items: &Items) -> bool {
        match self {
            Relation::Clean(r) => r.contains(items),
            Relation::Noisy(r) => r.contains(items),
        }
    }

    pub fn value(&self, items: &Items) -> V {
        match self {
            Relation::Clean(r) => r.value(items).clone(),
            Relation::Noisy(r) => r.value(items),
        }
    }

    pub fn data_pairs(&self) -> Vec<(Items, V)> {
        match self {
            Relation::Clean(r) => r
                .data()
                .iter()
                .map(|(items, value)| (items.clone(), value.clone()))
                .collect(),
            Relation::Noisy(r) => r
                .data()
                .iter()
                .map(|(items, value)| (items.clone(), value.clone()))
                .collect(),
        }
    }

    pub fn incorporate(
        &mut self,
        prng: &mut Prng,
        domains: &mut DomainMap,
        items: &Items,
        value: V,
    ) {
        match self {
            Relation::Clean(r) => r.incorporate(prng, domains, items, value),
            Relation::Noisy(r) => r.incorporate(prng, domains, items, value),
        }
    }

    pub fn unincorporate(&mut self, domains: &mut DomainMap, items: &Items) {
        match self {
            Relation::Clean(r) => r.unincorporate(domains, items),
            Relation::Noisy(r) => r.unincorporate(domains, items),
        }
    }

    pub fn logp(&self, domains: &DomainMap, items: &Items, value: &V, prng: &mut Prng) -> f64 {
        match self {
            Relation::Clean(r) => r.logp(domains, items, value, prng),
            Relation::Noisy(r) => r.logp(domains, items, value, prng),
        }
    }

    pub fn logp_score(&self) -> f64 {
        match self {
            Relation::Clean(r) => r.logp_score(),
            Relation::Noisy(r) => r.logp_score(),
        }
    }

    pub fn logp_gibbs_exact(
        &mut self,
        domains: &DomainMap,
        domain: &str,
        item: Item,
        tables: &[Table],
        prng: &mut Prng,
    ) -> Vec<f64> {
        match self {
            Relation::Clean(r) => r.logp_gibbs_exact(domains, domain, item, tables, prng),
            Relation::Noisy(r) => r.logp_gibbs_exact(domains, domain, item, tables, prng),
        }
    }

    pub fn set_cluster_assignment_gibbs(
        &mut self,
        domains: &DomainMap,
        domain: &str,
        item: Item,
        table: Table,
        prng: &mut Prng,
    ) {
        match self {
            Relation::Clean(r) => r.set_cluster_assignment_gibbs(domains, domain, item, table, prng),
            Relation::Noisy(r) => r.set_cluster_assignment_gibbs(domains, domain, item, table, prng),
        }
    }

    pub fn has_observation(&self, domain: &str, item: Item) -> bool {
        match self {
            Relation::Clean(r) => r.has_observation(domain, item),
            Relation::Noisy(r) => r.has_observation(domain, item),
        }
    }

    pub fn tuples_of(&self, domain: &str, item: Item) -> Vec<Items> {
        match self {
            Relation::Clean(r) => r.tuples_of(domain, item),
            Relation::Noisy(r) => r.tuples_of(domain, item),
        }
    }

    pub fn items_of(&self, domain: &str) -> Vec<Item> {
        match self {
            Relation::Clean(r) => r.items_of(domain),
            Relation::Noisy(r) => r.emission().items_of(domain),
        }
    }

    pub fn incorporate_to_cluster(&mut self, domains: &DomainMap, items: &Items, value: &V) {
        match self {
            Relation::Clean(r) => r.incorporate_to_cluster(domains, items, value),
            Relation::Noisy(r) => r.incorporate_to_cluster(domains, items, value),
        }
    }

    pub fn unincorporate_from_cluster(&mut self, domains: &DomainMap, items: &Items) {
        match self {
            Relation::Clean(r) => r.unincorporate_from_cluster(domains, items),
            Relation::Noisy(r) => r.unincorporate_from_cluster(domains, items),
        }
    }

    pub fn update_value(&mut self, items: &Items, value: V) {
        match self {
            Relation::Clean(r) => r.update_value(items, value),
            Relation::Noisy(r) => r.update_value(items, value),
        }
    }

    pub fn cleanup_data(&mut self, domains: &mut DomainMap, items: &Items) {
        match self {
            Relation::Clean(r) => r.cleanup_data(domains, items),
            Relation::Noisy(r) => r.cleanup_data(domains, items),
        }
    }

    pub fn cleanup_clusters(&mut self) {
        match self {
            Relation::Clean(r) => r.cleanup_clusters(),
            Relation::Noisy(r) => r.cleanup_clusters(),
        }
    }

    pub fn cluster_or_prior_logp(
        &self,
        prng: &mut Prng,
        key: &ClusterKey,
        items: &Items,
        value: &V,
    ) -> f64 {
        match self {
            Relation::Clean(r) => r.cluster_or_prior_logp(prng, key, value),
            Relation::Noisy(r) => r.cluster_or_prior_logp(prng, key, items, value),
        }
    }

    pub fn cluster_or_prior_logp_from_items(
        &self,
        prng: &mut Prng,
        domains: &DomainMap,
        items: &Items,
        value: &V,
    ) -> f64 {
        match self {
            Relation::Clean(r) => {
                let key = r.cluster_key(domains, items);
                r.cluster_or_prior_logp(prng, &key, value)
            }
            Relation::Noisy(r) => r.cluster_or_prior_logp_from_items(prng, domains, items, value),
        }
    }

    pub fn nearest(
        &self,
        prng: &mut Prng,
        candidate: &V,
        domains: &DomainMap,
        items: &Items,
    ) -> V {
        match self {
            Relation::Clean(r) => r.nearest(prng, candidate, domains, items),
            // The emission channel has no support constraints of its own.
            Relation::Noisy(_) => candidate.clone(),
        }
    }

    pub fn sample_and_incorporate(
        &mut self,
        prng: &mut Prng,
        domains: &mut DomainMap,
        items: &Items,
    ) -> V {
        match self {
            Relation::Clean(r) => clean::sample_and_incorporate(r, prng, domains, items),
            Relation::Noisy(r) => r.sample_and_incorporate(prng, domains, items),
        }
    }

    pub fn transition_cluster_hparams(
        &mut self,
        prng: &mut Prng,
        num_theta_steps: usize,
    ) -> Result<()> {
        match self {
            Relation::Clean(r) => r.transition_cluster_hparams(prng, num_theta_steps),
            Relation::Noisy(r) => r.transition_cluster_hparams(prng, num_theta_steps),
        }
    }

    pub fn as_noisy(&self) -> Option<&NoisyRelation<V>> {
        match self {
            Relation::Clean(_) => None,
            Relation::Noisy(r) => Some(r),
        }
    }

    pub fn as_noisy_mut(&mut self) -> Option<&mut NoisyRelation<V>> {
        match self {
            Relation::Clean(_) => None,
            Relation::Noisy(r) => Some(r),
        }
    }
}

/// Dispatch a `RelationVariant` arm, binding the typed cell.
macro_rules! with_cell {
    ($variant:expr, $cell:ident => $body:expr) => {
        match $variant {
            RelationVariant::Bool($cell) => $body,
            RelationVariant::Int($cell) => $body,
            RelationVariant::Double($cell) => $body,
            RelationVariant::Str($cell) => $body,
        }
    };
}

/// A relation of any supported value type, behind a shared cell.
#[derive(Clone)]
pub enum RelationVariant {
    Bool(RelationCell<bool>),
    Int(RelationCell<i64>),
    Double(RelationCell<f64>),
    Str(RelationCell<String>),
}

fn expect_typed<V: RelationValue>(relation: &str, value: &Value) -> V {
    V::from_value(value).unwrap_or_else(|| {
        panic!(
            "relation {relation}: value {value:?} does not match declared type {}",
            V::VALUE_TYPE
        )
    })
}

impl RelationVariant {
    pub fn name(&self) -> String {
        with_cell!(self, cell => cell.borrow().name().to_string())
    }

    pub fn domain_names(&self) -> Vec<String> {
        with_cell!(self, cell => cell.borrow().domains().to_vec())
    }

    pub fn arity(&self) -> usize {
        with_cell!(self, cell => cell.borrow().arity())
    }

    pub fn data_len(&self) -> usize {
        with_cell!(self, cell => cell.borrow().data_pairs().len())
    }

    pub fn data_contains(&self, items: &Items) -> bool {
        with_cell!(self, cell => cell.borrow().contains(items))
    }

    pub fn value_at(&self, items: &Items) -> Value {
        with_cell!(self, cell => cell.borrow().value(items).into_value())
    }

    pub fn data_pairs(&self) -> Vec<(Items, Value)> {
        with_cell!(self, cell => cell
            .borrow()
            .data_pairs()
            .into_iter()
            .map(|(items, value)| (items, value.into_value()))
            .collect())
    }

    pub fn incorporate(
        &self,
        prng: &mut Prng,
        domains: &mut DomainMap,
        items: &Items,
        value: &Value,
    ) {
        with_cell!(self, cell => {
            let typed = expect_typed(cell.borrow().name(), value);
            cell.borrow_mut().incorporate(prng, domains, items, typed);
        });
    }

    pub fn unincorporate(&self, domains: &mut DomainMap, items: &Items) {
        with_cell!(self, cell => cell.borrow_mut().unincorporate(domains, items));
    }

    pub fn logp(
        &self,
        domains: &DomainMap,
        items: &Items,
        value: &Value,
        prng: &mut Prng,
    ) -> f64 {
        with_cell!(self, cell => {
            let typed = expect_typed(cell.borrow().name(), value);
            cell.borrow().logp(domains, items, &typed, prng)
        })
    }

    pub fn logp_score(&self) -> f64 {
        with_cell!(self, cell => cell.borrow().logp_score())
    }

    pub fn logp_gibbs_exact(
        &self,
        domains: &DomainMap,
        domain: &str,
        item: Item,
        tables: &[Table],
        prng: &mut Prng,
    ) -> Vec<f64> {
        with_cell!(self, cell => cell
            .borrow_mut()
            .logp_gibbs_exact(domains, domain, item, tables, prng))
    }

    pub fn set_cluster_assignment_gibbs(
        &self,
        domains: &DomainMap,
        domain: &str,
        item: Item,
        table: Table,
        prng: &mut Prng,
    ) {
        with_cell!(self, cell => cell
            .borrow_mut()
            .set_cluster_assignment_gibbs(domains, domain, item, table, prng));
    }

    pub fn has_observation(&self, domain: &str, item: Item) -> bool {
        with_cell!(self, cell => cell.borrow().has_observation(domain, item))
    }

    pub fn tuples_of(&self, domain: &str, item: Item) -> Vec<Items> {
        with_cell!(self, cell => cell.borrow().tuples_of(domain, item))
    }

    pub fn items_of(&self, domain: &str) -> Vec<Item> {
        with_cell!(self, cell => cell.borrow().items_of(domain))
    }

    pub fn incorporate_to_cluster(&self, domains: &DomainMap, items: &Items, value: &Value) {
        with_cell!(self, cell => {
            let typed = expect_typed(cell.borrow().name(), value);
            cell.borrow_mut().incorporate_to_cluster(domains, items, &typed);
        });
    }

    pub fn unincorporate_from_cluster(&self, domains: &DomainMap, items: &Items) {
        with_cell!(self, cell => cell.borrow_mut().unincorporate_from_cluster(domains, items));
    }

    pub fn cleanup_data(&self, domains: &mut DomainMap, items: &Items) {
        with_cell!(self, cell => cell.borrow_mut().cleanup_data(domains, items));
    }

    pub fn cleanup_clusters(&self) {
        with_cell!(self, cell => cell.borrow_mut().cleanup_clusters());
    }

    pub fn update_value(&self, items: &Items, value: &Value) {
        with_cell!(self, cell => {
            let typed = expect_typed(cell.borrow().name(), value);
            cell.borrow_mut().update_value(items, typed);
        });
    }

    pub fn cluster_or_prior_logp(
        &self,
        prng: &mut Prng,
        key: &ClusterKey,
        items: &Items,
        value: &Value,
    ) -> f64 {
        with_cell!(self, cell => {
            let typed = expect_typed(cell.borrow().name(), value);
            cell.borrow().cluster_or_prior_logp(prng, key, items, &typed)
        })
    }

    pub fn cluster_or_prior_logp_from_items(
        &self,
        prng: &mut Prng,
        domains: &DomainMap,
        items: &Items,
        value: &Value,
    ) -> f64 {
        with_cell!(self, cell => {
            let typed = expect_typed(cell.borrow().name(), value);
            cell.borrow()
                .cluster_or_prior_logp_from_items(prng, domains, items, &typed)
        })
    }

    pub fn sample_and_incorporate(
        &self,
        prng: &mut Prng,
        domains: &mut DomainMap,
        items: &Items,
    ) -> Value {
        with_cell!(self, cell => cell
            .borrow_mut()
            .sample_and_incorporate(prng, domains, items)
            .into_value())
    }

    pub fn transition_cluster_hparams(
        &self,
        prng: &mut Prng,
        num_theta_steps: usize,
    ) -> Result<()> {
        with_cell!(self, cell => cell
            .borrow_mut()
            .transition_cluster_hparams(prng, num_theta_steps))
    }

    /// Swap the relation contents held by two same-typed cells.
    pub fn swap_contents(&self, other: &RelationVariant) {
        match (self, other) {
            (RelationVariant::Bool(a), RelationVariant::Bool(b)) => {
                std::mem::swap(&mut *a.borrow_mut(), &mut *b.borrow_mut());
            }
            (RelationVariant::Int(a), RelationVariant::Int(b)) => {
                std::mem::swap(&mut *a.borrow_mut(), &mut *b.borrow_mut());
            }
            (RelationVariant::Double(a), RelationVariant::Double(b)) => {
                std::mem::swap(&mut *a.borrow_mut(), &mut *b.borrow_mut());
            }
            (RelationVariant::Str(a), RelationVariant::Str(b)) => {
                std::mem::swap(&mut *a.borrow_mut(), &mut *b.borrow_mut());
            }
            _ => panic!("cannot swap relations of different value types"),
        }
    }

    /// Re-point a noisy relation's base link at `base`'s cell.
    pub fn rewire_noisy_base(&self, base: &RelationVariant) {
        match (self, base) {
            (RelationVariant::Bool(child), RelationVariant::Bool(base)) => {
                if let Some(noisy) = child.borrow_mut().as_noisy_mut() {
                    noisy.set_base(Rc::clone(base));
                }
            }
            (RelationVariant::Int(child), RelationVariant::Int(base)) => {
                if let Some(noisy) = child.borrow_mut().as_noisy_mut() {
                    noisy.set_base(Rc::clone(base));
                }
            }
            (RelationVariant::Double(child), RelationVariant::Double(base)) => {
                if let Some(noisy) = child.borrow_mut().as_noisy_mut() {
                    noisy.set_base(Rc::clone(base));
                }
            }
            (RelationVariant::Str(child), RelationVariant::Str(base)) => {
                if let Some(noisy) = child.borrow_mut().as_noisy_mut() {
                    noisy.set_base(Rc::clone(base));
                }
            }
            _ => panic!("cannot rewire across value types"),
        }
    }
}
