//! HIRM over unary animal-attribute relations: relation clustering,
//! forced splits, and the independence factorization across sub-models.

use entwine::distributions::{DistributionFamily, DistributionSpec};
use entwine::{Hirm, Prng, RelationSchema, Schema, Value};
use rand::SeedableRng;

const ANIMALS: usize = 8;

fn animal_schema(relations: &[&str]) -> Schema {
    let mut schema = Schema::new();
    for name in relations {
        schema.insert(
            (*name).to_string(),
            RelationSchema::Clean {
                domains: vec!["animal".to_string()],
                spec: DistributionSpec::new(DistributionFamily::Bernoulli),
                observed: true,
            },
        );
    }
    schema
}

#[test]
fn test_hirm_animals_sweeps() {
    let mut prng = Prng::seed_from_u64(1);
    let relations = ["black", "furry", "solitary", "water"];
    let mut hirm = Hirm::new(&animal_schema(&relations), &mut prng).unwrap();

    // "black" and "furry" agree; "solitary" and "water" agree.
    for animal in 0..ANIMALS {
        let first_group = animal < ANIMALS / 2;
        hirm.incorporate(&mut prng, "black", &vec![animal], &Value::Bool(first_group))
            .unwrap();
        hirm.incorporate(&mut prng, "furry", &vec![animal], &Value::Bool(first_group))
            .unwrap();
        hirm.incorporate(&mut prng, "solitary", &vec![animal], &Value::Bool(animal % 2 == 0))
            .unwrap();
        hirm.incorporate(&mut prng, "water", &vec![animal], &Value::Bool(animal % 2 == 0))
            .unwrap();
    }

    let total_observations: usize = relations
        .iter()
        .map(|name| hirm.get_relation(name).data_len())
        .sum();
    assert_eq!(total_observations, 4 * ANIMALS);

    for _ in 0..10 {
        hirm.transition_cluster_assignments_all(&mut prng).unwrap();
    }
    assert_eq!(hirm.irms.len(), hirm.crp.tables.len());
    assert!(hirm.logp_score().is_finite());

    // No observation was lost across relation moves.
    let after: usize = relations
        .iter()
        .map(|name| hirm.get_relation(name).data_len())
        .sum();
    assert_eq!(after, total_observations);
}

#[test]
fn test_forced_assignment_and_independence() {
    let mut prng = Prng::seed_from_u64(5);
    let mut hirm = Hirm::new(&animal_schema(&["black", "solitary"]), &mut prng).unwrap();
    for animal in 0..ANIMALS {
        hirm.incorporate(&mut prng, "black", &vec![animal], &Value::Bool(animal < 4))
            .unwrap();
        hirm.incorporate(&mut prng, "solitary", &vec![animal], &Value::Bool(animal % 3 == 0))
            .unwrap();
    }

    // Place the relations in different sub-models.
    hirm.set_cluster_assignment_gibbs(&mut prng, "black", 120).unwrap();
    hirm.set_cluster_assignment_gibbs(&mut prng, "solitary", 741)
        .unwrap();
    assert_eq!(hirm.relation_to_table("black"), 120);
    assert_eq!(hirm.relation_to_table("solitary"), 741);

    // Observations of relations in different IRMs factorize exactly.
    let persiancat = 20;
    let sheep = 21;
    let joint = vec![
        ("black".to_string(), vec![persiancat], Value::Bool(true)),
        ("solitary".to_string(), vec![sheep], Value::Bool(true)),
    ];
    let lp_joint = hirm.logp(&joint, &mut prng);
    let lp_black = hirm.logp(&joint[..1].to_vec(), &mut prng);
    let lp_solitary = hirm.logp(&joint[1..].to_vec(), &mut prng);
    assert!(
        (lp_joint - (lp_black + lp_solitary)).abs() < 1e-8,
        "joint {lp_joint} vs {} + {}",
        lp_black,
        lp_solitary
    );
}

#[test]
fn test_score_stable_across_forced_moves() {
    let mut prng = Prng::seed_from_u64(9);
    let mut hirm = Hirm::new(&animal_schema(&["black", "furry"]), &mut prng).unwrap();
    for animal in 0..ANIMALS {
        hirm.incorporate(&mut prng, "black", &vec![animal], &Value::Bool(true))
            .unwrap();
        hirm.incorporate(&mut prng, "furry", &vec![animal], &Value::Bool(false))
            .unwrap();
    }
    // Moving a relation away and back restores a consistent model (same
    // data, finite score, matching bookkeeping).
    let home = hirm.relation_to_table("black");
    hirm.set_cluster_assignment_gibbs(&mut prng, "black", home + 50)
        .unwrap();
    hirm.set_cluster_assignment_gibbs(&mut prng, "black", home)
        .unwrap();
    assert_eq!(hirm.relation_to_table("black"), home);
    assert_eq!(hirm.get_relation("black").data_len(), ANIMALS);
    assert_eq!(hirm.irms.len(), hirm.crp.tables.len());
    assert!(hirm.logp_score().is_finite());
}
