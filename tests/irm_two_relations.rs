//! End-to-end IRM inference over two relations sharing a domain.

use entwine::distributions::{DistributionFamily, DistributionSpec};
use entwine::inference::{inference_irm, InferenceConfig};
use entwine::{Irm, Prng, RelationSchema, Schema, Value};
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

/// Two blocks of D1 entities: 0..4 all link to each other and to the
/// "left" D2 items; 4..8 do the opposite.
fn block_value(i: usize, j: usize) -> bool {
    (i < 4) == (j < 4)
}

#[test]
fn test_irm_two_relations_inference() {
    let mut prng = Prng::seed_from_u64(10);
    let mut irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();

    for i in 0..8 {
        for j in 0..8 {
            irm.incorporate(&mut prng, "R1", &vec![i, j], &Value::Bool(block_value(i, j)))
                .unwrap();
        }
        for j in 0..4 {
            irm.incorporate(&mut prng, "R2", &vec![i, j], &Value::Bool(i < 4))
                .unwrap();
        }
    }

    let score_before = irm.logp_score();
    let config = InferenceConfig {
        iters: 10,
        num_theta_steps: 2,
        ..InferenceConfig::default()
    };
    inference_irm(&mut prng, &mut irm, &config).unwrap();
    let score_after = irm.logp_score();

    assert!(score_after.is_finite());
    assert!(
        score_after > score_before,
        "inference did not improve the score: {score_before} -> {score_after}"
    );

    // The block structure is strong enough that entities 0 and 1 should
    // co-cluster while 0 and 7 should not.
    let d1 = &irm.domains["D1"];
    assert_eq!(d1.cluster_of(0), d1.cluster_of(1));
    assert_ne!(d1.cluster_of(0), d1.cluster_of(7));
}

#[test]
fn test_irm_unincorporate_returns_to_baseline() {
    let mut prng = Prng::seed_from_u64(3);
    let mut irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();
    irm.incorporate(&mut prng, "R1", &vec![0, 1], &Value::Bool(true))
        .unwrap();
    let score_one = irm.logp_score();

    irm.incorporate(&mut prng, "R2", &vec![0, 9], &Value::Bool(false))
        .unwrap();
    irm.unincorporate("R2", &vec![0, 9]);
    let tolerance = 1e-8 * score_one.abs().max(1.0);
    assert!((irm.logp_score() - score_one).abs() < tolerance);
}

#[test]
fn test_irm_marginal_logp_of_fresh_pair() {
    let mut prng = Prng::seed_from_u64(7);
    let mut irm = Irm::new(&two_relation_schema(), &mut prng).unwrap();
    for i in 0..5 {
        irm.incorporate(&mut prng, "R1", &vec![i, i], &Value::Bool(true))
            .unwrap();
    }
    // Observing the same pattern at unseen entities is more likely than
    // the opposite pattern.
    let same = irm.logp(
        &[("R1".to_string(), vec![50, 50], Value::Bool(true))],
        &mut prng,
    );
    let flipped = irm.logp(
        &[("R1".to_string(), vec![50, 50], Value::Bool(false))],
        &mut prng,
    );
    assert!(same > flipped);
}
