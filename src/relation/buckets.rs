//! Shared bucketing machinery behind clean and noisy relations.
//!
//! A bucketed relation maps entity tuples to values and groups them into
//! clusters keyed by the tuple of per-domain CRP assignments. The cluster
//! model type is generic: clean relations store plain distributions,
//! noisy relations store emissions over `(clean, dirty)` pairs. The
//! invariant maintained throughout is that each cluster's sufficient
//! statistics are exactly the incorporation of every stored tuple whose
//! cluster key maps to it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::crp::{Item, Table};
use crate::distributions::Distribution;
use crate::domain::Domain;
use crate::error::Result;
use crate::math::{logsumexp, product};
use crate::Prng;

/// An entity tuple: one item per domain position.
pub type Items = Vec<Item>;

/// A cluster key: one CRP table per domain position.
pub type ClusterKey = Vec<Table>;

/// The domains an IRM owns, shared by all of its relations.
pub type DomainMap = BTreeMap<String, Domain>;

/// Bound on values stored in a bucketed relation (`V` for clean
/// relations, `(V, V)` for the pair relation inside a noisy one).
pub trait StoredValue: Clone + PartialEq + fmt::Debug + 'static {}
impl<T: Clone + PartialEq + fmt::Debug + 'static> StoredValue for T {}

/// A spec that can mint fresh cluster models of type `C`.
pub trait PriorSpec<C> {
    fn make_model(&self, prng: &mut Prng) -> C;
}

/// Threshold below which a cluster's observation count reads as empty;
/// counts move in unit steps, so anything under one half is zero.
const EMPTY: f64 = 0.5;

pub struct Buckets<Val, C, P>
where
    Val: StoredValue,
    C: Distribution<Val>,
    P: PriorSpec<C>,
{
    pub name: String,
    /// Domain names, in tuple-position order. Duplicates are allowed.
    pub domains: Vec<String>,
    pub prior: P,
    clusters: BTreeMap<ClusterKey, C>,
    data: BTreeMap<Items, Val>,
    /// Per-domain reverse index: item to the stored tuples mentioning it.
    data_r: BTreeMap<String, BTreeMap<Item, BTreeSet<Items>>>,
}

impl<Val, C, P> Buckets<Val, C, P>
where
    Val: StoredValue,
    C: Distribution<Val>,
    P: PriorSpec<C>,
{
    pub fn new(name: impl Into<String>, domains: Vec<String>, prior: P) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "relation name must be non-empty");
        assert!(!domains.is_empty(), "relation needs at least one domain");
        let mut data_r = BTreeMap::new();
        for domain in &domains {
            data_r.entry(domain.clone()).or_insert_with(BTreeMap::new);
        }
        Buckets {
            name,
            domains,
            prior,
            clusters: BTreeMap::new(),
            data: BTreeMap::new(),
            data_r,
        }
    }

    pub fn arity(&self) -> usize {
        self.domains.len()
    }

    pub fn data(&self) -> &BTreeMap<Items, Val> {
        &self.data
    }

    pub fn clusters(&self) -> &BTreeMap<ClusterKey, C> {
        &self.clusters
    }

    pub(crate) fn cluster_mut(&mut self, key: &ClusterKey) -> Option<&mut C> {
        self.clusters.get_mut(key)
    }

    /// Record a value for a tuple whose items and cluster were already
    /// prepared with [`Self::incorporate_items`].
    pub(crate) fn insert_value(&mut self, items: Items, value: Val) {
        let previous = self.data.insert(items, value);
        assert!(previous.is_none(), "relation {}: tuple stored twice", self.name);
    }

    pub fn value(&self, items: &Items) -> &Val {
        self.data
            .get(items)
            .unwrap_or_else(|| panic!("relation {}: unknown tuple {items:?}", self.name))
    }

    pub fn contains(&self, items: &Items) -> bool {
        self.data.contains_key(items)
    }

    pub fn has_observation(&self, domain: &str, item: Item) -> bool {
        self.data_r
            .get(domain)
            .is_some_and(|by_item| by_item.contains_key(&item))
    }

    /// Items of `domain` mentioned by at least one stored tuple.
    pub fn items_of(&self, domain: &str) -> Vec<Item> {
        self.data_r
            .get(domain)
            .map(|by_item| by_item.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Stored tuples mentioning `item` in `domain`.
    pub fn tuples_of(&self, domain: &str, item: Item) -> Vec<Items> {
        self.data_r
            .get(domain)
            .and_then(|by_item| by_item.get(&item))
            .map(|tuples| tuples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cluster_key(&self, domains: &DomainMap, items: &Items) -> ClusterKey {
        assert_eq!(
            items.len(),
            self.domains.len(),
            "relation {}: arity mismatch for {items:?}",
            self.name
        );
        self.domains
            .iter()
            .zip(items)
            .map(|(name, item)| domains[name].cluster_of(*item))
            .collect()
    }

    /// Cluster key under the hypothesis that `item` of `domain` sits at
    /// `table`.
    pub fn cluster_key_gibbs(
        &self,
        domains: &DomainMap,
        items: &Items,
        domain: &str,
        item: Item,
        table: Table,
    ) -> ClusterKey {
        let mut hits = 0;
        let key = self
            .domains
            .iter()
            .zip(items)
            .map(|(name, tuple_item)| {
                if name == domain && *tuple_item == item {
                    hits += 1;
                    table
                } else {
                    domains[name].cluster_of(*tuple_item)
                }
            })
            .collect();
        assert!(hits > 0, "tuple {items:?} does not mention {domain}:{item}");
        key
    }

    /// Absorb the tuple's items into their domains and ensure its cluster
    /// exists. Returns the cluster key.
    pub fn incorporate_items(
        &mut self,
        prng: &mut Prng,
        domains: &mut DomainMap,
        items: &Items,
    ) -> ClusterKey {
        assert!(
            !self.data.contains_key(items),
            "relation {}: tuple {items:?} incorporated twice",
            self.name
        );
        for (name, item) in self.domains.iter().zip(items) {
            domains
                .get_mut(name)
                .unwrap_or_else(|| panic!("relation {}: unknown domain {name}", self.name))
                .incorporate(prng, *item);
            self.data_r
                .get_mut(name)
                .expect("reverse index initialized at construction")
                .entry(*item)
                .or_default()
                .insert(items.clone());
        }
        let key = self.cluster_key(domains, items);
        if !self.clusters.contains_key(&key) {
            let model = self.prior.make_model(prng);
            self.clusters.insert(key.clone(), model);
        }
        key
    }

    pub fn incorporate(
        &mut self,
        prng: &mut Prng,
        domains: &mut DomainMap,
        items: &Items,
        value: Val,
    ) {
        let key = self.incorporate_items(prng, domains, items);
        self.clusters
            .get_mut(&key)
            .expect("cluster created above")
            .incorporate(&value);
        self.data.insert(items.clone(), value);
    }

    pub fn unincorporate(&mut self, domains: &mut DomainMap, items: &Items) {
        let value = self.value(items).clone();
        let key = self.cluster_key(domains, items);
        let cluster = self
            .clusters
            .get_mut(&key)
            .unwrap_or_else(|| panic!("relation {}: missing cluster {key:?}", self.name));
        cluster.unincorporate(&value);
        if cluster.count() < EMPTY {
            self.clusters.remove(&key);
        }
        self.forget_tuple(domains, items, true);
    }

    /// Drop the tuple from `data` and the reverse index. With
    /// `release_domains`, items that no longer appear in any of this
    /// relation's tuples leave their domain CRPs too.
    fn forget_tuple(&mut self, domains: &mut DomainMap, items: &Items, release_domains: bool) {
        for (name, item) in self.domains.iter().zip(items) {
            let by_item = self
                .data_r
                .get_mut(name)
                .expect("reverse index initialized at construction");
            if let Some(tuples) = by_item.get_mut(item) {
                tuples.remove(items);
                if tuples.is_empty() {
                    by_item.remove(item);
                    if release_domains {
                        domains
                            .get_mut(name)
                            .expect("domain exists while data references it")
                            .unincorporate(*item);
                    }
                }
            }
        }
        self.data.remove(items);
    }

    /// Remove the tuple's bookkeeping without touching cluster statistics
    /// or domain CRPs. Used by the entity-linkage resampler, which settles
    /// both separately.
    pub fn cleanup_data(&mut self, domains: &mut DomainMap, items: &Items) {
        self.forget_tuple(domains, items, false);
    }

    /// Drop clusters whose statistics have drained to zero.
    pub fn cleanup_clusters(&mut self) {
        self.clusters.retain(|_, cluster| cluster.count() >= EMPTY);
    }

    pub fn logp_score(&self) -> f64 {
        self.clusters.values().map(Distribution::logp_score).sum()
    }

    /// Mutate cluster statistics only; `data` and the reverse index stay
    /// untouched. Every call must be paired with
    /// [`Self::unincorporate_from_cluster`] on the same tuple before any
    /// other method observes the relation. Empty clusters survive the
    /// pairing on purpose.
    pub fn incorporate_to_cluster(&mut self, domains: &DomainMap, items: &Items, value: &Val) {
        let key = self.cluster_key(domains, items);
        self.clusters
            .get_mut(&key)
            .unwrap_or_else(|| panic!("relation {}: missing cluster {key:?}", self.name))
            .incorporate(value);
    }

    /// Inverse half of the transient cluster interface.
    pub fn unincorporate_from_cluster(&mut self, domains: &DomainMap, items: &Items) {
        let value = self.value(items).clone();
        let key = self.cluster_key(domains, items);
        self.clusters
            .get_mut(&key)
            .unwrap_or_else(|| panic!("relation {}: missing cluster {key:?}", self.name))
            .unincorporate(&value);
    }

    /// Rewrite the stored value for a tuple. Cluster statistics are the
    /// caller's responsibility (the transient interface above).
    pub fn update_value(&mut self, items: &Items, value: Val) {
        let slot = self
            .data
            .get_mut(items)
            .unwrap_or_else(|| panic!("relation {}: unknown tuple {items:?}", self.name));
        *slot = value;
    }

    /// Exact Gibbs scores for reseating `item` of `domain` at each
    /// candidate table: the incremental log-score of detaching every
    /// affected tuple group and reattaching it under the hypothesis.
    pub fn logp_gibbs_exact(
        &mut self,
        domains: &DomainMap,
        domain: &str,
        item: Item,
        tables: &[Table],
        prng: &mut Prng,
    ) -> Vec<f64> {
        // Group the affected tuples by their current cluster.
        let mut groups: BTreeMap<ClusterKey, (Items, Vec<Val>)> = BTreeMap::new();
        for items in self.tuples_of(domain, item) {
            let key = self.cluster_key(domains, &items);
            let value = self.value(&items).clone();
            groups
                .entry(key)
                .or_insert_with(|| (items.clone(), Vec::new()))
                .1
                .push(value);
        }
        let current_table = domains[domain].cluster_of(item);

        let mut logps = Vec::with_capacity(tables.len());
        for &table in tables {
            let mut lp_table = 0.0;
            for (key, (first_items, values)) in &groups {
                if table == current_table {
                    let cluster = self
                        .clusters
                        .get_mut(key)
                        .expect("occupied cluster for stored tuples");
                    let logp0 = cluster.logp_score();
                    for value in values {
                        cluster.unincorporate(value);
                    }
                    let logp1 = cluster.logp_score();
                    for value in values {
                        cluster.incorporate(value);
                    }
                    lp_table += logp0 - logp1;
                } else {
                    let hypothesis =
                        self.cluster_key_gibbs(domains, first_items, domain, item, table);
                    if let Some(cluster) = self.clusters.get_mut(&hypothesis) {
                        let logp0 = cluster.logp_score();
                        for value in values {
                            cluster.incorporate(value);
                        }
                        let logp1 = cluster.logp_score();
                        for value in values {
                            cluster.unincorporate(value);
                        }
                        lp_table += logp1 - logp0;
                    } else {
                        // The hypothesis opens a fresh cluster: score the
                        // group against a prior-sampled model.
                        let mut prior = self.prior.make_model(prng);
                        let logp0 = prior.logp_score();
                        for value in values {
                            prior.incorporate(value);
                        }
                        lp_table += prior.logp_score() - logp0;
                    }
                }
            }
            logps.push(lp_table);
        }
        logps
    }

    /// Apply a Gibbs reseating decision: detach every affected tuple from
    /// its cluster and attach it under the new table. The caller reseats
    /// the domain itself afterwards.
    pub fn set_cluster_assignment_gibbs(
        &mut self,
        domains: &DomainMap,
        domain: &str,
        item: Item,
        table: Table,
        prng: &mut Prng,
    ) {
        assert_ne!(
            domains[domain].cluster_of(item),
            table,
            "reseating {domain}:{item} onto its own table"
        );
        for items in self.tuples_of(domain, item) {
            let value = self.value(&items).clone();
            let old_key = self.cluster_key(domains, &items);
            let cluster = self
                .clusters
                .get_mut(&old_key)
                .expect("occupied cluster for stored tuple");
            cluster.unincorporate(&value);
            if cluster.count() < EMPTY {
                self.clusters.remove(&old_key);
            }
            let new_key = self.cluster_key_gibbs(domains, &items, domain, item, table);
            if !self.clusters.contains_key(&new_key) {
                let model = self.prior.make_model(prng);
                self.clusters.insert(new_key.clone(), model);
            }
            self.clusters
                .get_mut(&new_key)
                .expect("cluster just ensured")
                .incorporate(&value);
        }
    }

    /// Predictive log probability of observing `value` at `items`,
    /// marginalizing over table assignments for any item not yet in its
    /// domain (CRP-weighted Cartesian enumeration).
    pub fn logp(&self, domains: &DomainMap, items: &Items, value: &Val, prng: &mut Prng) -> f64 {
        assert_eq!(items.len(), self.domains.len());
        let mut table_lists: Vec<Vec<Table>> = Vec::with_capacity(items.len());
        let mut weight_lists: Vec<Vec<f64>> = Vec::with_capacity(items.len());
        let mut index_lists: Vec<Vec<usize>> = Vec::with_capacity(items.len());
        for (name, item) in self.domains.iter().zip(items) {
            let domain = &domains[name];
            if domain.has_item(*item) {
                table_lists.push(vec![domain.cluster_of(*item)]);
                weight_lists.push(vec![0.0]);
                index_lists.push(vec![0]);
            } else {
                let weights = domain.tables_weights();
                let z = (domain.crp.alpha + domain.crp.n as f64).ln();
                let mut tables = Vec::with_capacity(weights.len());
                let mut log_weights = Vec::with_capacity(weights.len());
                let mut indices = Vec::with_capacity(weights.len());
                for (i, (table, weight)) in weights.iter().enumerate() {
                    tables.push(*table);
                    log_weights.push(weight.ln() - z);
                    indices.push(i);
                }
                table_lists.push(tables);
                weight_lists.push(log_weights);
                index_lists.push(indices);
            }
        }
        let prior = self.prior.make_model(prng);
        let mut logps = Vec::new();
        for combination in product(&index_lists) {
            let mut key = ClusterKey::with_capacity(items.len());
            let mut logp_weight = 0.0;
            for (position, &index) in combination.iter().enumerate() {
                key.push(table_lists[position][index]);
                logp_weight += weight_lists[position][index];
            }
            let logp_value = match self.clusters.get(&key) {
                Some(cluster) => cluster.logp(value),
                None => prior.logp(value),
            };
            logps.push(logp_weight + logp_value);
        }
        logsumexp(&logps)
    }

    /// Log probability of `value` under the cluster at `key`, or under a
    /// fresh prior when that cluster does not exist.
    pub fn cluster_or_prior_logp(
        &self,
        prng: &mut Prng,
        key: &ClusterKey,
        value: &Val,
    ) -> f64 {
        match self.clusters.get(key) {
            Some(cluster) => cluster.logp(value),
            None => self.prior.make_model(prng).logp(value),
        }
    }

    /// Closest in-support value to `candidate` under the cluster at
    /// `items` (or the prior when the tuple is unclustered).
    pub fn nearest(
        &self,
        prng: &mut Prng,
        candidate: &Val,
        domains: &DomainMap,
        items: &Items,
    ) -> Val {
        let in_domains = self
            .domains
            .iter()
            .zip(items)
            .all(|(name, item)| domains[name].has_item(*item));
        if in_domains {
            let key = self.cluster_key(domains, items);
            if let Some(cluster) = self.clusters.get(&key) {
                return cluster.nearest(candidate);
            }
        }
        self.prior.make_model(prng).nearest(candidate)
    }

    /// Resample hyperparameters (and latent parameters, for nonconjugate
    /// models) of every cluster.
    pub fn transition_cluster_hparams(
        &mut self,
        prng: &mut Prng,
        num_theta_steps: usize,
    ) -> Result<()> {
        for cluster in self.clusters.values_mut() {
            for _ in 0..num_theta_steps {
                cluster.transition_theta(prng);
            }
            cluster.transition_hyperparameters(prng)?;
        }
        Ok(())
    }
}
