//! Character-conditioned string corruption channel.
//!
//! Insertions are conditioned on the previous clean character and
//! substitutions/deletions on the character being rewritten, with one
//! Dirichlet-categorical per context. Incorporation spreads its weight
//! over the ten most probable alignments of the pair under the current
//! model.

use super::alignment::{topk_alignments, AlignPiece, StrAlignment};
use super::Emission;
use crate::distributions::{DirichletCategorical, Distribution};
use crate::error::Result;
use crate::Prng;

const LOWEST_CHAR: u8 = b' ';
const HIGHEST_CHAR: u8 = b'~';

/// Alignments considered per incorporated pair.
const NUM_ALIGNMENTS: usize = 10;

fn num_contexts() -> usize {
    (HIGHEST_CHAR - LOWEST_CHAR + 1) as usize + 1
}

#[derive(Debug, Clone)]
pub struct BigramStringEmission {
    /// `insertions[ctx].sample() == 0` means no insertion; otherwise the
    /// inserted character. Context is the previous clean character, or
    /// index 0 at the start.
    insertions: Vec<DirichletCategorical>,
    /// `substitutions[ctx].sample() == 0` means deletion; otherwise the
    /// replacement character. Context is the clean character rewritten.
    substitutions: Vec<DirichletCategorical>,
    n: f64,
}

impl BigramStringEmission {
    pub fn new() -> Self {
        let k = num_contexts();
        BigramStringEmission {
            insertions: vec![DirichletCategorical::new(k); k],
            substitutions: vec![DirichletCategorical::new(k); k],
            n: 0.0,
        }
    }

    fn char_index(c: char) -> usize {
        let byte = u32::from(c);
        assert!(
            (u32::from(LOWEST_CHAR)..=u32::from(HIGHEST_CHAR)).contains(&byte),
            "character {c:?} outside printable ASCII"
        );
        (byte - u32::from(LOWEST_CHAR)) as usize + 1
    }

    fn context_index(context: Option<char>) -> usize {
        context.map_or(0, Self::char_index)
    }

    fn category_to_char(category: i64) -> Option<char> {
        if category == 0 {
            None
        } else {
            Some((LOWEST_CHAR + (category - 1) as u8) as char)
        }
    }

    /// Clean-side context in force before the newest alignment piece.
    fn insertion_context(alignment: &StrAlignment) -> Option<char> {
        for piece in alignment.pieces.iter().rev().skip(1) {
            match piece {
                AlignPiece::Deletion { deleted } => return Some(*deleted),
                AlignPiece::Insertion { .. } => continue,
                AlignPiece::Substitution { original, .. } => return Some(*original),
                AlignPiece::Match { c } => return Some(*c),
            }
        }
        None
    }

    /// Negated log probability of an alignment's newest piece, used as the
    /// alignment search cost.
    fn log_prob_distance(&self, alignment: &StrAlignment, old_cost: f64) -> f64 {
        let icontext = Self::context_index(Self::insertion_context(alignment));
        let log_prob = match alignment.pieces.last().expect("non-empty alignment") {
            // No insertion, then a deletion.
            AlignPiece::Deletion { deleted } => {
                self.insertions[icontext].logp(&0)
                    + self.substitutions[Self::char_index(*deleted)].logp(&0)
            }
            AlignPiece::Insertion { inserted } => {
                self.insertions[icontext].logp(&(Self::char_index(*inserted) as i64))
            }
            // No insertion, then a substitution (possibly the identity).
            AlignPiece::Substitution {
                original,
                replacement,
            } => {
                self.insertions[icontext].logp(&0)
                    + self.substitutions[Self::char_index(*original)]
                        .logp(&(Self::char_index(*replacement) as i64))
            }
            AlignPiece::Match { c } => {
                self.insertions[icontext].logp(&0)
                    + self.substitutions[Self::char_index(*c)].logp(&(Self::char_index(*c) as i64))
            }
        };
        old_cost - log_prob
    }

    fn alignments_for(&self, clean: &str, dirty: &str) -> Vec<StrAlignment> {
        topk_alignments(NUM_ALIGNMENTS, clean, dirty, &|alignment, old_cost| {
            self.log_prob_distance(alignment, old_cost)
        })
    }

    /// Most likely clean string behind a pair of dirty observations, by
    /// aligning them and letting the model vote on each piece.
    fn two_string_vote(&self, s1: &str, s2: &str) -> String {
        let alignments = topk_alignments(1, s1, s2, &|alignment, old_cost| {
            self.log_prob_distance(alignment, old_cost)
        });
        let mut clean = String::new();
        let mut left_context: Option<char> = None;
        for piece in &alignments[0].pieces {
            let new_char = match piece {
                AlignPiece::Deletion { deleted } => {
                    // Present in s1 only: was s2's copy deleted, or was
                    // s1's inserted?
                    let lp_deleted = self.substitutions[Self::char_index(*deleted)].logp(&0);
                    let lp_inserted = self.insertions[Self::context_index(left_context)]
                        .logp(&(Self::char_index(*deleted) as i64));
                    (lp_deleted > lp_inserted).then_some(*deleted)
                }
                AlignPiece::Insertion { inserted } => {
                    let lp_inserted = self.insertions[Self::context_index(left_context)]
                        .logp(&(Self::char_index(*inserted) as i64));
                    let lp_deleted = self.substitutions[Self::char_index(*inserted)].logp(&0);
                    (lp_deleted > lp_inserted).then_some(*inserted)
                }
                AlignPiece::Substitution {
                    original,
                    replacement,
                } => {
                    let lp_fwd = self.substitutions[Self::char_index(*original)]
                        .logp(&(Self::char_index(*replacement) as i64));
                    let lp_bwd = self.substitutions[Self::char_index(*replacement)]
                        .logp(&(Self::char_index(*original) as i64));
                    Some(if lp_fwd > lp_bwd { *original } else { *replacement })
                }
                AlignPiece::Match { c } => Some(*c),
            };
            if let Some(c) = new_char {
                clean.push(c);
                left_context = Some(c);
            }
        }
        clean
    }
}

impl Default for BigramStringEmission {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution<(String, String)> for BigramStringEmission {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &(String, String), weight: f64) {
        self.n += weight;
        let alignments = self.alignments_for(&x.0, &x.1);
        assert!(!alignments.is_empty());

        // Costs are negative log probabilities; spread the weight over the
        // alignments proportionally to their probability.
        let min_cost = alignments
            .iter()
            .map(|a| a.cost)
            .fold(f64::INFINITY, f64::min);
        let probs: Vec<f64> = alignments.iter().map(|a| (min_cost - a.cost).exp()).collect();
        let total: f64 = probs.iter().sum();

        for (alignment, prob) in alignments.iter().zip(&probs) {
            let w = weight * prob / total;
            let mut context: Option<char> = None;
            for piece in &alignment.pieces {
                let icontext = Self::context_index(context);
                match piece {
                    AlignPiece::Deletion { deleted } => {
                        self.insertions[icontext].incorporate_weighted(&0, w);
                        self.substitutions[Self::char_index(*deleted)]
                            .incorporate_weighted(&0, w);
                        context = Some(*deleted);
                    }
                    AlignPiece::Insertion { inserted } => {
                        self.insertions[icontext]
                            .incorporate_weighted(&(Self::char_index(*inserted) as i64), w);
                    }
                    AlignPiece::Substitution {
                        original,
                        replacement,
                    } => {
                        self.insertions[icontext].incorporate_weighted(&0, w);
                        self.substitutions[Self::char_index(*original)]
                            .incorporate_weighted(&(Self::char_index(*replacement) as i64), w);
                        context = Some(*original);
                    }
                    AlignPiece::Match { c } => {
                        self.insertions[icontext].incorporate_weighted(&0, w);
                        self.substitutions[Self::char_index(*c)]
                            .incorporate_weighted(&(Self::char_index(*c) as i64), w);
                        context = Some(*c);
                    }
                }
            }
        }
    }

    fn logp(&self, x: &(String, String)) -> f64 {
        // Incremental score on a scratch copy; `self` stays untouched.
        let mut scratch = self.clone();
        scratch.incorporate(x);
        scratch.logp_score() - self.logp_score()
    }

    fn logp_score(&self) -> f64 {
        let insertions: f64 = self.insertions.iter().map(Distribution::logp_score).sum();
        let substitutions: f64 = self
            .substitutions
            .iter()
            .map(Distribution::logp_score)
            .sum();
        insertions + substitutions
    }

    fn sample(&mut self, _prng: &mut Prng) -> (String, String) {
        unreachable!("sample() is never called on an emission")
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        for dist in &mut self.insertions {
            dist.transition_hyperparameters(prng)?;
        }
        for dist in &mut self.substitutions {
            dist.transition_hyperparameters(prng)?;
        }
        Ok(())
    }
}

impl Emission<String> for BigramStringEmission {
    fn sample_corrupted(&mut self, clean: &String, prng: &mut Prng) -> String {
        let mut dirty = String::new();
        let mut context: Option<char> = None;
        for c in clean.chars() {
            loop {
                let sampled = self.insertions[Self::context_index(context)].sample(prng);
                match Self::category_to_char(sampled) {
                    Some(inserted) => dirty.push(inserted),
                    None => break,
                }
            }
            context = Some(c);
            let sampled = self.substitutions[Self::char_index(c)].sample(prng);
            if let Some(replacement) = Self::category_to_char(sampled) {
                dirty.push(replacement);
            }
        }
        loop {
            let sampled = self.insertions[Self::context_index(context)].sample(prng);
            match Self::category_to_char(sampled) {
                Some(inserted) => dirty.push(inserted),
                None => break,
            }
        }
        dirty
    }

    fn propose_clean(&self, corrupted: &[String], prng: &mut Prng) -> String {
        // Aligning all of the corrupted strings at once is exponential in
        // their number, so run a tournament of pairwise alignments with
        // the learnt model voting on each pair.
        match corrupted {
            [] => String::new(),
            [only] => only.clone(),
            _ => {
                let mut winners = Vec::with_capacity(corrupted.len() / 2 + 1);
                for pair in corrupted.chunks(2) {
                    match pair {
                        [s1, s2] => winners.push(self.two_string_vote(s1, s2)),
                        [odd] => winners.push(odd.clone()),
                        _ => unreachable!(),
                    }
                }
                self.propose_clean(&winners, prng)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_round_trip() {
        let mut emission = BigramStringEmission::new();
        emission.incorporate(&("cat".to_string(), "cat".to_string()));
        let score = emission.logp_score();
        emission.incorporate(&("hi".to_string(), "ho".to_string()));
        emission.unincorporate(&("hi".to_string(), "ho".to_string()));
        assert!((emission.logp_score() - score).abs() < 1e-6);
    }

    #[test]
    fn test_logp_is_immutable() {
        let mut emission = BigramStringEmission::new();
        emission.incorporate(&("abc".to_string(), "abc".to_string()));
        let score = emission.logp_score();
        let lp = emission.logp(&("abc".to_string(), "abd".to_string()));
        assert!(lp < 0.0);
        assert!((emission.logp_score() - score).abs() < 1e-12);
    }

    #[test]
    fn test_clean_copy_preferred_after_clean_training() {
        let mut emission = BigramStringEmission::new();
        for _ in 0..10 {
            emission.incorporate(&("word".to_string(), "word".to_string()));
        }
        let clean = emission.logp(&("word".to_string(), "word".to_string()));
        let mangled = emission.logp(&("word".to_string(), "w0rd".to_string()));
        assert!(clean > mangled);
    }

    #[test]
    fn test_propose_clean_single() {
        let mut prng = Prng::seed_from_u64(0);
        let emission = BigramStringEmission::new();
        assert_eq!(
            emission.propose_clean(&["only".to_string()], &mut prng),
            "only"
        );
    }

    #[test]
    fn test_propose_clean_tournament_keeps_consensus() {
        let mut prng = Prng::seed_from_u64(0);
        let mut emission = BigramStringEmission::new();
        for _ in 0..5 {
            emission.incorporate(&("cats".to_string(), "cats".to_string()));
        }
        let corrupted = vec!["cats".to_string(), "cats".to_string(), "cats".to_string()];
        assert_eq!(emission.propose_clean(&corrupted, &mut prng), "cats");
    }

    #[test]
    fn test_sample_corrupted_mostly_identity_after_training() {
        let mut prng = Prng::seed_from_u64(7);
        let mut emission = BigramStringEmission::new();
        for _ in 0..40 {
            emission.incorporate(&("abc".to_string(), "abc".to_string()));
        }
        let identical = (0..10)
            .filter(|_| emission.sample_corrupted(&"abc".to_string(), &mut prng) == "abc")
            .count();
        assert!(identical >= 5);
    }
}
