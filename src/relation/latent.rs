//! Latent-value resampling.
//!
//! A base relation's value at one tuple is latent when noisy relations
//! observe it through emission channels. This move proposes replacement
//! clean values from the emission clusters, scores each candidate by the
//! incremental likelihood of all the attached dirty observations, and
//! commits one. Cluster assignments do not move, empty clusters are
//! retained throughout, and every relation ends with exactly the counts
//! it started with.

use crate::emissions::Emission;
use crate::math::log_choice;
use crate::value::RelationValue;
use crate::Prng;

use super::buckets::{DomainMap, Items};
use super::RelationCell;

/// One noisy observer of the base relation, paired with the domain map of
/// the IRM it lives in.
pub struct NoisyObserver<'a, V: RelationValue> {
    pub cell: &'a RelationCell<V>,
    pub domains: &'a DomainMap,
}

/// Resample the clean value of `base_items` in the base relation given
/// every noisy relation observing it.
pub fn transition_latent_value<V: RelationValue>(
    prng: &mut Prng,
    base: &RelationCell<V>,
    base_domains: &DomainMap,
    noisy_relations: &[NoisyObserver<'_, V>],
    base_items: &Items,
) {
    // Detach the latent value and every dirty observation from their
    // clusters, keeping the emptied clusters alive for re-population.
    base.borrow_mut()
        .unincorporate_from_cluster(base_domains, base_items);

    let mut detached: Vec<Vec<(Items, V)>> = Vec::with_capacity(noisy_relations.len());
    for observer in noisy_relations {
        let mut guard = observer.cell.borrow_mut();
        let noisy = guard.as_noisy_mut().expect("observer is a noisy relation");
        let mut observations = Vec::new();
        for items in noisy.noisy_tuples_for(base_items) {
            let dirty = noisy.value(&items);
            noisy.unincorporate_from_cluster(observer.domains, &items);
            observations.push((items, dirty));
        }
        detached.push(observations);
    }

    let all_dirty: Vec<V> = detached
        .iter()
        .flat_map(|observations| observations.iter().map(|(_, dirty)| dirty.clone()))
        .collect();

    // Candidate clean values: one proposal per emission cluster per noisy
    // relation, snapped into the base's support.
    let mut candidates: Vec<V> = Vec::new();
    if !all_dirty.is_empty() {
        for observer in noisy_relations {
            let guard = observer.cell.borrow();
            let noisy = guard.as_noisy().expect("observer is a noisy relation");
            for cluster in noisy.emission().clusters().values() {
                let proposal = cluster.propose_clean(&all_dirty, prng);
                let snapped = base
                    .borrow()
                    .nearest(prng, &proposal, base_domains, base_items);
                candidates.push(snapped);
            }
        }
    }
    if candidates.is_empty() {
        candidates.push(base.borrow().value(base_items));
    }

    // Baseline: the noisy relations' scores without this tuple's
    // observations.
    let baseline: f64 = noisy_relations
        .iter()
        .map(|observer| observer.cell.borrow().logp_score())
        .sum();

    let mut logps = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        attach(base, base_domains, noisy_relations, &detached, base_items, candidate);
        let score: f64 = noisy_relations
            .iter()
            .map(|observer| observer.cell.borrow().logp_score())
            .sum();
        logps.push(score - baseline);
        detach(base, base_domains, noisy_relations, &detached, base_items);
    }

    let winner = candidates[log_choice(&logps, prng)].clone();
    attach(base, base_domains, noisy_relations, &detached, base_items, &winner);
}

/// Write `candidate` as the base tuple's value and re-incorporate it plus
/// every detached dirty observation into the (possibly empty) clusters.
fn attach<V: RelationValue>(
    base: &RelationCell<V>,
    base_domains: &DomainMap,
    noisy_relations: &[NoisyObserver<'_, V>],
    detached: &[Vec<(Items, V)>],
    base_items: &Items,
    candidate: &V,
) {
    {
        let mut guard = base.borrow_mut();
        guard.update_value(base_items, candidate.clone());
        guard.incorporate_to_cluster(base_domains, base_items, candidate);
    }
    for (observer, observations) in noisy_relations.iter().zip(detached) {
        let mut guard = observer.cell.borrow_mut();
        for (items, dirty) in observations {
            guard.incorporate_to_cluster(observer.domains, items, dirty);
        }
    }
}

fn detach<V: RelationValue>(
    base: &RelationCell<V>,
    base_domains: &DomainMap,
    noisy_relations: &[NoisyObserver<'_, V>],
    detached: &[Vec<(Items, V)>],
    base_items: &Items,
) {
    for (observer, observations) in noisy_relations.iter().zip(detached) {
        let mut guard = observer.cell.borrow_mut();
        for (items, _) in observations {
            guard.unincorporate_from_cluster(observer.domains, items);
        }
    }
    base.borrow_mut()
        .unincorporate_from_cluster(base_domains, base_items);
}
