//! Property tests for the core invariants: CRP exchangeability, the
//! incorporate/unincorporate round trip, and exact-Gibbs consistency.

use entwine::distributions::{DistributionFamily, DistributionSpec};
use entwine::{Irm, Prng, RelationSchema, Schema, Value};
use proptest::prelude::*;
use rand::SeedableRng;

fn bernoulli_schema() -> Schema {
    let mut schema = Schema::new();
    schema.insert(
        "R".to_string(),
        RelationSchema::Clean {
            domains: vec!["D1".to_string(), "D2".to_string()],
            spec: DistributionSpec::new(DistributionFamily::Bernoulli),
            observed: true,
        },
    );
    schema
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Property 1: the CRP joint is exchangeable in incorporation order.
    #[test]
    fn crp_exchangeability(
        assignments in proptest::collection::vec(0..4usize, 1..12),
        order in any::<u64>(),
    ) {
        let indexed: Vec<(usize, usize)> =
            assignments.iter().copied().enumerate().collect();

        let mut forward = entwine::Crp::new();
        for (item, table) in &indexed {
            forward.incorporate(*item, *table);
        }

        // A deterministic pseudo-shuffle of the same assignments.
        let mut shuffled = indexed;
        let mut state = order;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            shuffled.swap(i, (state as usize) % (i + 1));
        }
        let mut backward = entwine::Crp::new();
        for (item, table) in &shuffled {
            backward.incorporate(*item, *table);
        }

        prop_assert!((forward.logp_score() - backward.logp_score()).abs() < 1e-10);
    }

    // Property 2: incorporate followed by unincorporate restores the
    // score to within 1e-8 * max(1, |score|).
    #[test]
    fn relation_round_trip(
        rows in proptest::collection::btree_map(
            (0..6usize, 0..6usize),
            proptest::bool::ANY,
            1..10,
        ),
        extra_value in proptest::bool::ANY,
    ) {
        let mut prng = Prng::seed_from_u64(99);
        let mut irm = Irm::new(&bernoulli_schema(), &mut prng).unwrap();
        for ((i, j), value) in &rows {
            irm.incorporate(&mut prng, "R", &vec![*i, *j], &Value::Bool(*value)).unwrap();
        }
        let score = irm.logp_score();

        // A tuple not present in the data.
        let fresh = vec![17, 23];
        irm.incorporate(&mut prng, "R", &fresh, &Value::Bool(extra_value)).unwrap();
        irm.unincorporate("R", &fresh);

        let tolerance = 1e-8 * score.abs().max(1.0);
        prop_assert!((irm.logp_score() - score).abs() < tolerance);
    }

    // Property 3: the exact Gibbs score of an item's current table equals
    // the difference between the full score and the score with the item's
    // tuples detached.
    #[test]
    fn gibbs_exact_consistency(
        rows in proptest::collection::btree_map(
            (0..5usize, 0..5usize),
            proptest::bool::ANY,
            2..12,
        ),
    ) {
        let mut prng = Prng::seed_from_u64(7);
        let mut irm = Irm::new(&bernoulli_schema(), &mut prng).unwrap();
        for ((i, j), value) in &rows {
            irm.incorporate(&mut prng, "R", &vec![*i, *j], &Value::Bool(*value)).unwrap();
        }
        let item = *rows.keys().next().map(|(i, _)| i).expect("non-empty");
        let current = irm.domains["D1"].cluster_of(item);
        let full = irm.logp_score();

        let relation = irm.relations["R"].clone();
        let gibbs =
            relation.logp_gibbs_exact(&irm.domains, "D1", item, &[current], &mut prng);

        let tuples = relation.tuples_of("D1", item);
        for items in &tuples {
            relation.unincorporate_from_cluster(&irm.domains, items);
        }
        let without = irm.logp_score();
        for items in &tuples {
            let value = relation.value_at(items);
            relation.incorporate_to_cluster(&irm.domains, items, &value);
        }

        prop_assert!((gibbs[0] - (full - without)).abs() < 1e-9);
        prop_assert!((irm.logp_score() - full).abs() < 1e-9);
    }
}
