//! Noisy relations: dirty observations of a base relation's clean values
//! through an emission channel.
//!
//! A noisy relation's domains extend its base's domains as a prefix, so
//! the first entries of each tuple index the base tuple being observed.
//! Internally the `(clean, dirty)` pairs live in an emission relation
//! whose cluster models are typed [`Emission`] objects.

use std::collections::{BTreeMap, BTreeSet};

use crate::distributions::Distribution;
use crate::emissions::{Emission, EmissionSpec};
use crate::error::Result;
use crate::value::RelationValue;
use crate::Prng;

use super::buckets::{Buckets, ClusterKey, DomainMap, Items, PriorSpec};
use super::RelationCell;

/// The pair-valued relation inside every noisy relation.
pub type EmissionRelation<V> = Buckets<(V, V), Box<dyn Emission<V>>, EmissionSpec>;

impl<V: RelationValue> PriorSpec<Box<dyn Emission<V>>> for EmissionSpec {
    fn make_model(&self, prng: &mut Prng) -> Box<dyn Emission<V>> {
        let _ = prng;
        V::make_emission(self).expect("emission spec validated at relation construction")
    }
}

pub struct NoisyRelation<V: RelationValue> {
    pub name: String,
    base_name: String,
    base: RelationCell<V>,
    base_arity: usize,
    data: BTreeMap<Items, V>,
    /// Base tuple to the noisy tuples observing it.
    base_to_noisy: BTreeMap<Items, BTreeSet<Items>>,
    emission: EmissionRelation<V>,
}

impl<V: RelationValue> NoisyRelation<V> {
    pub fn new(
        name: impl Into<String>,
        spec: EmissionSpec,
        domains: Vec<String>,
        base_name: impl Into<String>,
        base: RelationCell<V>,
    ) -> Result<Self> {
        let name = name.into();
        V::make_emission(&spec)?;
        let base_arity = base.borrow().arity();
        assert!(
            domains.len() >= base_arity,
            "noisy relation {name}: domains shorter than base arity"
        );
        Ok(NoisyRelation {
            name: name.clone(),
            base_name: base_name.into(),
            base,
            base_arity,
            data: BTreeMap::new(),
            base_to_noisy: BTreeMap::new(),
            emission: Buckets::new(format!("{name}_emission"), domains, spec),
        })
    }

    pub fn domains(&self) -> &[String] {
        &self.emission.domains
    }

    pub fn arity(&self) -> usize {
        self.emission.arity()
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn base_cell(&self) -> &RelationCell<V> {
        &self.base
    }

    /// Re-point the base link at another cell holding the same relation
    /// (after a cross-IRM move re-seats cell contents).
    pub fn set_base(&mut self, base: RelationCell<V>) {
        self.base_arity = base.borrow().arity();
        self.base = base;
    }

    pub fn data(&self) -> &BTreeMap<Items, V> {
        &self.data
    }

    pub fn emission(&self) -> &EmissionRelation<V> {
        &self.emission
    }

    /// The base tuple a noisy tuple observes.
    pub fn base_items(&self, items: &Items) -> Items {
        items[..self.base_arity].to_vec()
    }

    /// The clean value behind a noisy tuple, resolved through the base
    /// (recursively, for chained noisy relations).
    pub fn base_value(&self, items: &Items) -> V {
        let base_items = self.base_items(items);
        self.base.borrow().value(&base_items)
    }

    /// Noisy tuples currently observing a base tuple.
    pub fn noisy_tuples_for(&self, base_items: &Items) -> Vec<Items> {
        self.base_to_noisy
            .get(base_items)
            .map(|tuples| tuples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, items: &Items) -> bool {
        self.data.contains_key(items)
    }

    pub fn value(&self, items: &Items) -> V {
        self.data
            .get(items)
            .unwrap_or_else(|| panic!("relation {}: unknown tuple {items:?}", self.name))
            .clone()
    }

    pub fn incorporate(
        &mut self,
        prng: &mut Prng,
        domains: &mut DomainMap,
        items: &Items,
        value: V,
    ) {
        let base_items = self.base_items(items);
        let clean = self.base_value(items);
        self.emission
            .incorporate(prng, domains, items, (clean, value.clone()));
        self.data.insert(items.clone(), value);
        self.base_to_noisy
            .entry(base_items)
            .or_default()
            .insert(items.clone());
    }

    pub fn unincorporate(&mut self, domains: &mut DomainMap, items: &Items) {
        assert!(
            self.data.contains_key(items),
            "relation {}: unknown tuple {items:?}",
            self.name
        );
        self.emission.unincorporate(domains, items);
        self.forget(items);
    }

    fn forget(&mut self, items: &Items) {
        self.data.remove(items);
        let base_items = self.base_items(items);
        if let Some(tuples) = self.base_to_noisy.get_mut(&base_items) {
            tuples.remove(items);
            if tuples.is_empty() {
                self.base_to_noisy.remove(&base_items);
            }
        }
    }

    pub fn logp(&self, domains: &DomainMap, items: &Items, value: &V, prng: &mut Prng) -> f64 {
        let pair = (self.base_value(items), value.clone());
        self.emission.logp(domains, items, &pair, prng)
    }

    pub fn logp_score(&self) -> f64 {
        self.emission.logp_score()
    }

    pub fn logp_gibbs_exact(
        &mut self,
        domains: &DomainMap,
        domain: &str,
        item: usize,
        tables: &[usize],
        prng: &mut Prng,
    ) -> Vec<f64> {
        self.emission.logp_gibbs_exact(domains, domain, item, tables, prng)
    }

    pub fn set_cluster_assignment_gibbs(
        &mut self,
        domains: &DomainMap,
        domain: &str,
        item: usize,
        table: usize,
        prng: &mut Prng,
    ) {
        self.emission
            .set_cluster_assignment_gibbs(domains, domain, item, table, prng);
    }

    pub fn has_observation(&self, domain: &str, item: usize) -> bool {
        self.emission.has_observation(domain, item)
    }

    pub fn tuples_of(&self, domain: &str, item: usize) -> Vec<Items> {
        self.emission.tuples_of(domain, item)
    }

    /// Transient cluster incorporate: pairs the dirty value with the
    /// base's *current* clean value and refreshes the stored pair, so the
    /// paired [`Self::unincorporate_from_cluster`] removes exactly what
    /// was added.
    pub fn incorporate_to_cluster(&mut self, domains: &DomainMap, items: &Items, value: &V) {
        let pair = (self.base_value(items), value.clone());
        self.emission.update_value(items, pair.clone());
        self.emission.incorporate_to_cluster(domains, items, &pair);
    }

    pub fn unincorporate_from_cluster(&mut self, domains: &DomainMap, items: &Items) {
        self.emission.unincorporate_from_cluster(domains, items);
    }

    /// Rewrite the stored dirty value; cluster statistics stay with the
    /// transient interface.
    pub fn update_value(&mut self, items: &Items, value: V) {
        let slot = self
            .data
            .get_mut(items)
            .unwrap_or_else(|| panic!("relation {}: unknown tuple {items:?}", self.name));
        *slot = value.clone();
        let pair = (self.base_value(items), value);
        self.emission.update_value(items, pair);
    }

    pub fn cleanup_data(&mut self, domains: &mut DomainMap, items: &Items) {
        self.emission.cleanup_data(domains, items);
        self.forget(items);
    }

    pub fn cleanup_clusters(&mut self) {
        self.emission.cleanup_clusters();
    }

    pub fn cluster_or_prior_logp(
        &self,
        prng: &mut Prng,
        key: &ClusterKey,
        items: &Items,
        value: &V,
    ) -> f64 {
        let base_items = self.base_items(items);
        if !self.base.borrow().contains(&base_items) {
            return f64::NEG_INFINITY;
        }
        let pair = (self.base_value(items), value.clone());
        self.emission.cluster_or_prior_logp(prng, key, &pair)
    }

    pub fn cluster_or_prior_logp_from_items(
        &self,
        prng: &mut Prng,
        domains: &DomainMap,
        items: &Items,
        value: &V,
    ) -> f64 {
        let base_items = self.base_items(items);
        if !self.base.borrow().contains(&base_items) {
            return f64::NEG_INFINITY;
        }
        let key = self.emission.cluster_key(domains, items);
        let pair = (self.base_value(items), value.clone());
        self.emission.cluster_or_prior_logp(prng, &key, &pair)
    }

    /// Draw a dirty value for a new tuple by corrupting the base's clean
    /// value through the tuple's emission cluster, then incorporate it.
    pub fn sample_and_incorporate(
        &mut self,
        prng: &mut Prng,
        domains: &mut DomainMap,
        items: &Items,
    ) -> V {
        let key = self.emission.incorporate_items(prng, domains, items);
        let clean = self.base_value(items);
        let cluster = self
            .emission
            .cluster_mut(&key)
            .expect("cluster created by incorporate_items");
        let dirty = cluster.sample_corrupted(&clean, prng);
        cluster.incorporate(&(clean.clone(), dirty.clone()));
        self.emission
            .insert_value(items.clone(), (clean, dirty.clone()));
        self.data.insert(items.clone(), dirty.clone());
        let base_items = self.base_items(items);
        self.base_to_noisy
            .entry(base_items)
            .or_default()
            .insert(items.clone());
        dirty
    }

    pub fn transition_cluster_hparams(
        &mut self,
        prng: &mut Prng,
        num_theta_steps: usize,
    ) -> Result<()> {
        self.emission.transition_cluster_hparams(prng, num_theta_steps)
    }
}
