//! Clean relations: entity tuples mapped straight to a cluster-conditional
//! distribution over their values.

use crate::distributions::{Distribution, DistributionSpec};
use crate::error::Result;
use crate::value::RelationValue;
use crate::Prng;

use super::buckets::{Buckets, DomainMap, Items, PriorSpec};

/// A clean relation is the bucket machinery with plain distributions as
/// cluster models.
pub type CleanRelation<V> = Buckets<V, Box<dyn Distribution<V>>, DistributionSpec>;

impl<V: RelationValue> PriorSpec<Box<dyn Distribution<V>>> for DistributionSpec {
    fn make_model(&self, prng: &mut Prng) -> Box<dyn Distribution<V>> {
        V::make_prior(self, prng).expect("distribution spec validated at relation construction")
    }
}

/// Build a clean relation, resolving the spec once up front so later
/// cluster creation cannot fail.
pub fn new_clean_relation<V: RelationValue>(
    name: impl Into<String>,
    spec: DistributionSpec,
    domains: Vec<String>,
    prng: &mut Prng,
) -> Result<CleanRelation<V>> {
    V::make_prior(&spec, prng)?;
    Ok(Buckets::new(name, domains, spec))
}

/// Draw a value for a new tuple from its cluster (or a fresh prior) and
/// incorporate it.
pub fn sample_and_incorporate<V: RelationValue>(
    relation: &mut CleanRelation<V>,
    prng: &mut Prng,
    domains: &mut DomainMap,
    items: &Items,
) -> V {
    let key = relation.incorporate_items(prng, domains, items);
    let cluster = relation
        .cluster_mut(&key)
        .expect("cluster created by incorporate_items");
    let value = cluster.sample(prng);
    cluster.incorporate(&value);
    relation.insert_value(items.clone(), value.clone());
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::DistributionFamily;
    use crate::domain::Domain;
    use rand::SeedableRng;

    fn domains_map(names: &[&str]) -> DomainMap {
        names
            .iter()
            .map(|name| ((*name).to_string(), Domain::new(*name)))
            .collect()
    }

    fn bernoulli_relation(domains: &[&str], prng: &mut Prng) -> CleanRelation<bool> {
        new_clean_relation(
            "R1",
            DistributionSpec::new(DistributionFamily::Bernoulli),
            domains.iter().map(ToString::to_string).collect(),
            prng,
        )
        .unwrap()
    }

    #[test]
    fn test_incorporate_tracks_domains_and_clusters() {
        let mut prng = Prng::seed_from_u64(1);
        let mut domains = domains_map(&["D1", "D2", "D3"]);
        let mut relation = bernoulli_relation(&["D1", "D2", "D3"], &mut prng);

        relation.incorporate(&mut prng, &mut domains, &vec![0, 1, 3], true);
        relation.incorporate(&mut prng, &mut domains, &vec![1, 1, 3], true);
        relation.incorporate(&mut prng, &mut domains, &vec![0, 1, 4], false);

        assert_eq!(relation.data().len(), 3);
        assert!(domains["D1"].has_item(0));
        assert!(domains["D1"].has_item(1));
        assert!(domains["D2"].has_item(1));
        assert!(domains["D3"].has_item(4));
        assert!(relation.has_observation("D1", 0));
        assert!(!relation.has_observation("D1", 7));
    }

    #[test]
    fn test_unincorporate_releases_items_when_last_reference_drops() {
        let mut prng = Prng::seed_from_u64(2);
        let mut domains = domains_map(&["D1", "D2"]);
        let mut relation = bernoulli_relation(&["D1", "D2"], &mut prng);
        relation.incorporate(&mut prng, &mut domains, &vec![0, 1], true);
        relation.incorporate(&mut prng, &mut domains, &vec![0, 2], true);
        relation.incorporate(&mut prng, &mut domains, &vec![3, 0], true);
        relation.incorporate(&mut prng, &mut domains, &vec![3, 1], true);

        relation.unincorporate(&mut domains, &vec![3, 1]);
        assert_eq!(relation.data().len(), 3);
        // {3,0} and {0,1} still reference these items.
        assert!(domains["D1"].has_item(3));
        assert!(domains["D2"].has_item(1));

        relation.unincorporate(&mut domains, &vec![0, 2]);
        assert!(domains["D1"].has_item(0));
        assert!(!domains["D2"].has_item(2));

        relation.unincorporate(&mut domains, &vec![0, 1]);
        assert!(!domains["D1"].has_item(0));
        assert!(!domains["D2"].has_item(1));
    }

    #[test]
    fn test_logp_score_round_trip() {
        let mut prng = Prng::seed_from_u64(3);
        let mut domains = domains_map(&["D1"]);
        let mut relation = bernoulli_relation(&["D1"], &mut prng);
        relation.incorporate(&mut prng, &mut domains, &vec![0], true);
        let score = relation.logp_score();

        relation.incorporate(&mut prng, &mut domains, &vec![1], false);
        relation.unincorporate(&mut domains, &vec![1]);
        let tolerance = 1e-8 * score.abs().max(1.0);
        assert!((relation.logp_score() - score).abs() < tolerance);
    }

    #[test]
    fn test_single_cluster_beta_bernoulli_scores() {
        let mut prng = Prng::seed_from_u64(4);
        let mut domains = domains_map(&["D"]);
        let mut relation = bernoulli_relation(&["D"], &mut prng);

        relation.incorporate(&mut prng, &mut domains, &vec![0], true);
        assert!((relation.logp_score() - (-0.6931471805599453)).abs() < 1e-6);

        // Force the second item into the same cluster so both observations
        // share one Beta-Bernoulli.
        let table = domains["D"].cluster_of(0);
        domains.get_mut("D").unwrap().incorporate_to_table(7, table);
        relation.incorporate(&mut prng, &mut domains, &vec![7], false);
        assert!((relation.logp_score() - (-1.791759469228055)).abs() < 1e-6);
    }

    #[test]
    fn test_gibbs_exact_matches_detach_reattach() {
        let mut prng = Prng::seed_from_u64(5);
        let mut domains = domains_map(&["D1", "D2"]);
        let mut relation = bernoulli_relation(&["D1", "D2"], &mut prng);
        for (i, value) in [true, true, false, true, false].iter().enumerate() {
            relation.incorporate(&mut prng, &mut domains, &vec![i, i % 2], *value);
        }

        let item = 2;
        let current = domains["D1"].cluster_of(item);
        let full_score = relation.logp_score();

        // Score of the current table from the exact Gibbs path.
        let gibbs = relation.logp_gibbs_exact(&domains, "D1", item, &[current], &mut prng);

        // The same quantity computed by actually detaching the tuples.
        let affected = relation.tuples_of("D1", item);
        for items in &affected {
            relation.unincorporate_from_cluster(&domains, items);
        }
        let score_without = relation.logp_score();
        for items in &affected {
            let value = *relation.value(items);
            relation.incorporate_to_cluster(&domains, items, &value);
        }
        assert!((gibbs[0] - (full_score - score_without)).abs() < 1e-9);
        assert!((relation.logp_score() - full_score).abs() < 1e-9);
    }

    #[test]
    fn test_set_cluster_assignment_gibbs_moves_tuples() {
        let mut prng = Prng::seed_from_u64(6);
        let mut domains = domains_map(&["D1", "D2"]);
        let mut relation = bernoulli_relation(&["D1", "D2"], &mut prng);
        relation.incorporate(&mut prng, &mut domains, &vec![0, 0], true);
        relation.incorporate(&mut prng, &mut domains, &vec![1, 0], false);

        let score_before = relation.logp_score();
        let current = domains["D1"].cluster_of(0);
        let target = current + 17;
        relation.set_cluster_assignment_gibbs(&domains, "D1", 0, target, &mut prng);
        domains
            .get_mut("D1")
            .unwrap()
            .set_cluster_assignment_gibbs(0, target);

        // Moving back restores the original score.
        relation.set_cluster_assignment_gibbs(&domains, "D1", 0, current, &mut prng);
        domains
            .get_mut("D1")
            .unwrap()
            .set_cluster_assignment_gibbs(0, current);
        assert!((relation.logp_score() - score_before).abs() < 1e-9);
    }

    #[test]
    fn test_logp_marginalizes_fresh_items() {
        let mut prng = Prng::seed_from_u64(7);
        let mut domains = domains_map(&["D1"]);
        let mut relation = bernoulli_relation(&["D1"], &mut prng);
        relation.incorporate(&mut prng, &mut domains, &vec![0], true);

        // Item 9 is new: logp marginalizes over joining item 0's table or
        // opening a fresh one.
        let lp = relation.logp(&domains, &vec![9], &true, &mut prng);
        assert!(lp.is_finite());
        assert!(lp < 0.0);
        // A seen item scores through its cluster alone.
        let lp_existing = relation.logp(&domains, &vec![0], &true, &mut prng);
        assert!(lp_existing > lp);
    }

    #[test]
    fn test_sample_and_incorporate_stores_value() {
        let mut prng = Prng::seed_from_u64(8);
        let mut domains = domains_map(&["D1"]);
        let mut relation = bernoulli_relation(&["D1"], &mut prng);
        let value = sample_and_incorporate(&mut relation, &mut prng, &mut domains, &vec![5]);
        assert_eq!(*relation.value(&vec![5]), value);
        assert_eq!(relation.data().len(), 1);
    }
}
