//! Chinese Restaurant Process
//!
//! Partition bookkeeping for entities and relations: customers are mapped
//! to tables, new customers join an existing table proportionally to its
//! occupancy or open a fresh table proportionally to the concentration
//! `alpha`. The exchangeable joint probability and the Gibbs reweighting
//! used when reseating a single customer both live here.

use std::collections::{BTreeMap, BTreeSet};

use statrs::function::gamma::ln_gamma;

use crate::math::{choice, log_choice, log_linspace};
use crate::Prng;

/// Customer identifier. Only meaningful within one CRP.
pub type Item = usize;

/// Table identifier within one CRP.
pub type Table = usize;

#[derive(Debug, Clone)]
pub struct Crp {
    /// Concentration parameter, always positive.
    pub alpha: f64,
    /// Number of customers.
    pub n: usize,
    /// Map from table id to the customers seated there.
    pub tables: BTreeMap<Table, BTreeSet<Item>>,
    /// Map from customer to its table id.
    pub assignments: BTreeMap<Item, Table>,
}

impl Crp {
    pub fn new() -> Self {
        Crp {
            alpha: 1.0,
            n: 0,
            tables: BTreeMap::new(),
            assignments: BTreeMap::new(),
        }
    }

    /// Seat `item` at `table`. The item must not already be seated.
    pub fn incorporate(&mut self, item: Item, table: Table) {
        assert!(
            !self.assignments.contains_key(&item),
            "CRP customer {item} incorporated twice"
        );
        self.tables.entry(table).or_default().insert(item);
        self.assignments.insert(item, table);
        self.n += 1;
    }

    /// Remove `item` from its table; empty tables are deleted.
    pub fn unincorporate(&mut self, item: Item) {
        let table = *self
            .assignments
            .get(&item)
            .unwrap_or_else(|| panic!("CRP customer {item} is not seated"));
        let occupants = self.tables.get_mut(&table).expect("table of seated item");
        occupants.remove(&item);
        if occupants.is_empty() {
            self.tables.remove(&table);
        }
        self.assignments.remove(&item);
        self.n -= 1;
    }

    /// Sample a table for a new customer from the predictive distribution.
    pub fn sample(&self, prng: &mut Prng) -> Table {
        let dist = self.tables_weights();
        let tables: Vec<Table> = dist.keys().copied().collect();
        let weights: Vec<f64> = dist.values().copied().collect();
        tables[choice(&weights, prng)]
    }

    /// Log probability that a new customer opens a fresh table.
    pub fn logp_new_table(&self) -> f64 {
        self.alpha.ln() - (self.n as f64 + self.alpha).ln()
    }

    /// Log predictive probability that a new customer joins `table`.
    pub fn logp(&self, table: Table) -> f64 {
        let dist = self.tables_weights();
        match dist.get(&table) {
            Some(numer) => numer.ln() - (self.n as f64 + self.alpha).ln(),
            None => f64::NEG_INFINITY,
        }
    }

    /// Exchangeable CRP joint:
    /// `K log(alpha) + sum_k lgamma(n_k) + lgamma(alpha) - lgamma(N + alpha)`.
    pub fn logp_score(&self) -> f64 {
        let term1 = self.tables.len() as f64 * self.alpha.ln();
        let term2: f64 = self
            .tables
            .values()
            .map(|customers| ln_gamma(customers.len() as f64))
            .sum();
        term1 + term2 + ln_gamma(self.alpha) - ln_gamma(self.n as f64 + self.alpha)
    }

    /// Largest occupied table id, or 0 when empty.
    pub fn max_table(&self) -> Table {
        self.tables.keys().next_back().copied().unwrap_or(0)
    }

    /// Occupied tables weighted by occupancy, plus a fresh table
    /// (`max_table + 1`) weighted by `alpha`.
    pub fn tables_weights(&self) -> BTreeMap<Table, f64> {
        let mut dist = BTreeMap::new();
        if self.n == 0 {
            dist.insert(0, 1.0);
            return dist;
        }
        for (table, customers) in &self.tables {
            dist.insert(*table, customers.len() as f64);
        }
        dist.insert(self.max_table() + 1, self.alpha);
        dist
    }

    /// Weights for a Gibbs reseating of the single customer currently at
    /// `table`: its own table loses one customer, and if that empties the
    /// table the fresh-table slot collapses onto it.
    pub fn tables_weights_gibbs(&self, table: Table) -> BTreeMap<Table, f64> {
        assert!(self.n > 0, "Gibbs weights on an empty CRP");
        assert!(self.tables.contains_key(&table), "unknown table {table}");
        let mut dist = self.tables_weights();
        let w = dist.get_mut(&table).expect("occupied table");
        *w -= 1.0;
        if *w == 0.0 {
            *w = self.alpha;
            dist.remove(&(self.max_table() + 1));
        }
        dist
    }

    /// Grid-Gibbs transition of alpha over 20 log-uniform points spanning
    /// `[1/N, N + 1]`.
    pub fn transition_alpha(&mut self, prng: &mut Prng) {
        if self.n == 0 {
            return;
        }
        let grid = log_linspace(1.0 / self.n as f64, self.n as f64 + 1.0, 20, true);
        let mut logps = Vec::with_capacity(grid.len());
        for g in &grid {
            self.alpha = *g;
            logps.push(self.logp_score());
        }
        self.alpha = grid[log_choice(&logps, prng)];
    }
}

impl Default for Crp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_incorporate_unincorporate() {
        let mut crp = Crp::new();
        crp.incorporate(0, 0);
        crp.incorporate(1, 0);
        crp.incorporate(2, 1);
        assert_eq!(crp.n, 3);
        assert_eq!(crp.tables[&0].len(), 2);
        assert_eq!(crp.assignments[&2], 1);

        crp.unincorporate(2);
        assert_eq!(crp.n, 2);
        assert!(!crp.tables.contains_key(&1));
    }

    #[test]
    #[should_panic(expected = "incorporated twice")]
    fn test_duplicate_incorporate_panics() {
        let mut crp = Crp::new();
        crp.incorporate(0, 0);
        crp.incorporate(0, 1);
    }

    #[test]
    fn test_tables_weights() {
        let mut crp = Crp::new();
        assert_eq!(crp.tables_weights()[&0], 1.0);

        crp.incorporate(0, 0);
        crp.incorporate(1, 0);
        crp.incorporate(2, 3);
        let dist = crp.tables_weights();
        assert_eq!(dist[&0], 2.0);
        assert_eq!(dist[&3], 1.0);
        // Fresh table sits just past the largest occupied id.
        assert_eq!(dist[&4], crp.alpha);
        assert_eq!(dist.len(), 3);
    }

    #[test]
    fn test_tables_weights_gibbs_decrements() {
        let mut crp = Crp::new();
        crp.incorporate(0, 0);
        crp.incorporate(1, 0);
        crp.incorporate(2, 1);
        let dist = crp.tables_weights_gibbs(0);
        assert_eq!(dist[&0], 1.0);
        assert_eq!(dist[&1], 1.0);
        assert_eq!(dist[&2], crp.alpha);
    }

    #[test]
    fn test_tables_weights_gibbs_singleton_collapses() {
        let mut crp = Crp::new();
        crp.incorporate(0, 0);
        crp.incorporate(1, 0);
        crp.incorporate(2, 1);
        // Customer 2 is alone at table 1: its table becomes the fresh slot.
        let dist = crp.tables_weights_gibbs(1);
        assert_eq!(dist.len(), 2);
        assert_eq!(dist[&0], 2.0);
        assert_eq!(dist[&1], crp.alpha);
    }

    #[test]
    fn test_logp_score_two_tables() {
        let mut crp = Crp::new();
        crp.incorporate(0, 0);
        crp.incorporate(1, 0);
        crp.incorporate(2, 1);
        // K=2, n_1=2, n_2=1, alpha=1:
        // 2*ln(1) + ln(1!) + ln(0!) + ln Gamma(1) - ln Gamma(4) = -ln 6
        let expected = -(6.0_f64.ln());
        assert!((crp.logp_score() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_logp_matches_weights() {
        let mut crp = Crp::new();
        crp.incorporate(0, 0);
        crp.incorporate(1, 0);
        let lp_existing = crp.logp(0);
        assert!((lp_existing - (2.0_f64 / 3.0).ln()).abs() < 1e-12);
        let lp_new = crp.logp_new_table();
        assert!((lp_new - (1.0_f64 / 3.0).ln()).abs() < 1e-12);
        assert_eq!(crp.logp(17), f64::NEG_INFINITY);
    }

    #[test]
    fn test_sample_is_valid_table() {
        let mut prng = Prng::seed_from_u64(0);
        let mut crp = Crp::new();
        crp.incorporate(0, 0);
        crp.incorporate(1, 0);
        for _ in 0..50 {
            let t = crp.sample(&mut prng);
            assert!(t == 0 || t == 1);
        }
    }

    // One big table should pull the concentration below its prior value.
    #[test]
    fn test_transition_alpha_single_table() {
        let mut below_half = 0;
        for seed in 0..10 {
            let mut prng = Prng::seed_from_u64(seed);
            let mut crp = Crp::new();
            for item in 0..100 {
                crp.incorporate(item, 0);
            }
            crp.transition_alpha(&mut prng);
            assert!(crp.alpha < 1.0, "seed {seed}: alpha = {}", crp.alpha);
            if crp.alpha < 0.5 {
                below_half += 1;
            }
        }
        assert!(below_half >= 8, "only {below_half}/10 seeds below 0.5");
    }

    #[test]
    fn test_exchangeability() {
        // Same partition reached in different orders scores identically.
        let assignment_plans: [&[(Item, Table)]; 2] = [
            &[(0, 0), (1, 0), (2, 1), (3, 1), (4, 2)],
            &[(4, 2), (2, 1), (0, 0), (3, 1), (1, 0)],
        ];
        let mut scores = Vec::new();
        for plan in assignment_plans {
            let mut crp = Crp::new();
            for (item, table) in plan {
                crp.incorporate(*item, *table);
            }
            scores.push(crp.logp_score());
        }
        assert!((scores[0] - scores[1]).abs() < 1e-12);
    }
}
