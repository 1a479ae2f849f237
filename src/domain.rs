//! Domain: a named entity set clustered by a CRP
//!
//! Relations share domains by name; an entity id is only meaningful within
//! its domain.

use std::collections::{BTreeMap, BTreeSet};

use crate::crp::{Crp, Item, Table};
use crate::Prng;

#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    pub items: BTreeSet<Item>,
    pub crp: Crp,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "domain name must be non-empty");
        Domain {
            name,
            items: BTreeSet::new(),
            crp: Crp::new(),
        }
    }

    /// Add `item`, sampling a table from the CRP predictive if it is new.
    /// Re-incorporating an existing item is a no-op.
    pub fn incorporate(&mut self, prng: &mut Prng, item: Item) {
        if self.items.contains(&item) {
            return;
        }
        let table = self.crp.sample(prng);
        self.items.insert(item);
        self.crp.incorporate(item, table);
    }

    /// Add a new `item` at a caller-chosen table (used when loading saved
    /// clusters and when restoring Gibbs bookkeeping).
    pub fn incorporate_to_table(&mut self, item: Item, table: Table) {
        assert!(
            !self.items.contains(&item),
            "item {item} already in domain {}",
            self.name
        );
        self.items.insert(item);
        self.crp.incorporate(item, table);
    }

    pub fn unincorporate(&mut self, item: Item) {
        assert!(
            self.items.contains(&item),
            "item {item} not in domain {}",
            self.name
        );
        self.crp.unincorporate(item);
        self.items.remove(&item);
    }

    pub fn has_item(&self, item: Item) -> bool {
        self.items.contains(&item)
    }

    pub fn cluster_of(&self, item: Item) -> Table {
        assert!(
            self.items.contains(&item),
            "item {item} not in domain {}",
            self.name
        );
        self.crp.assignments[&item]
    }

    /// Move `item` to `table` without resampling (the Gibbs choice was made
    /// by the caller, which already reweighted every relation).
    pub fn set_cluster_assignment_gibbs(&mut self, item: Item, table: Table) {
        assert_ne!(
            self.cluster_of(item),
            table,
            "item {item} already at table {table}"
        );
        self.crp.unincorporate(item);
        self.crp.incorporate(item, table);
    }

    pub fn tables_weights(&self) -> BTreeMap<Table, f64> {
        self.crp.tables_weights()
    }

    pub fn tables_weights_gibbs(&self, item: Item) -> BTreeMap<Table, f64> {
        self.crp.tables_weights_gibbs(self.cluster_of(item))
    }
}
