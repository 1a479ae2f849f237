//! Context-free string corruption channel.
//!
//! Substitutions, insertions and deletions each carry their own
//! Beta-Bernoulli rate; none of them depend on the surrounding characters.
//! Scoring a pair walks the two strings from both ends and falls back to a
//! length heuristic in the ambiguous middle.

use rand::Rng;

use super::Emission;
use crate::distributions::{BetaBernoulli, Distribution};
use crate::error::Result;
use crate::Prng;

#[derive(Debug, Clone, Default)]
pub struct SimpleStringEmission {
    substitution: BetaBernoulli,
    insertion: BetaBernoulli,
    deletion: BetaBernoulli,
    n: f64,
}

impl SimpleStringEmission {
    pub fn new() -> Self {
        SimpleStringEmission {
            substitution: BetaBernoulli::new(),
            insertion: BetaBernoulli::new(),
            deletion: BetaBernoulli::new(),
            n: 0.0,
        }
    }

    /// Attribute the differences between `clean` and `dirty` to the three
    /// edit channels with the given weight (negative to unincorporate).
    fn corporate(&mut self, clean: &[char], dirty: &[char], weight: f64) {
        if clean.is_empty() {
            for _ in dirty {
                self.insertion.incorporate_weighted(&true, weight);
            }
            return;
        }
        if dirty.is_empty() {
            for _ in clean {
                self.deletion.incorporate_weighted(&true, weight);
            }
            return;
        }
        if clean[0] == dirty[0] {
            self.substitution.incorporate_weighted(&false, weight);
            self.insertion.incorporate_weighted(&false, weight);
            self.deletion.incorporate_weighted(&false, weight);
            self.corporate(&clean[1..], &dirty[1..], weight);
            return;
        }
        if clean[clean.len() - 1] == dirty[dirty.len() - 1] {
            self.substitution.incorporate_weighted(&false, weight);
            self.insertion.incorporate_weighted(&false, weight);
            self.deletion.incorporate_weighted(&false, weight);
            self.corporate(&clean[..clean.len() - 1], &dirty[..dirty.len() - 1], weight);
            return;
        }
        // The ends disagree. A proper treatment would run an alignment, but
        // that needs a cost model this channel does not have, so guess from
        // the lengths.
        if clean.len() < dirty.len() {
            self.insertion.incorporate_weighted(&true, weight);
            self.corporate(clean, &dirty[1..], weight);
        } else if clean.len() > dirty.len() {
            self.deletion.incorporate_weighted(&true, weight);
            self.corporate(&clean[1..], dirty, weight);
        } else {
            self.substitution.incorporate_weighted(&true, weight);
            self.corporate(&clean[1..], &dirty[1..], weight);
        }
    }

    fn random_character(prng: &mut Prng) -> char {
        (prng.gen_range(b' '..=b'~')) as char
    }
}

impl Distribution<(String, String)> for SimpleStringEmission {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &(String, String), weight: f64) {
        self.n += weight;
        let clean: Vec<char> = x.0.chars().collect();
        let dirty: Vec<char> = x.1.chars().collect();
        self.corporate(&clean, &dirty, weight);
    }

    fn logp(&self, x: &(String, String)) -> f64 {
        // Incremental probability of the pair, computed on a scratch copy
        // of the sufficient statistics.
        let mut scratch = self.clone();
        scratch.incorporate(x);
        scratch.logp_score() - self.logp_score()
    }

    fn logp_score(&self) -> f64 {
        self.substitution.logp_score() + self.insertion.logp_score() + self.deletion.logp_score()
    }

    fn sample(&mut self, _prng: &mut Prng) -> (String, String) {
        unreachable!("sample() is never called on an emission")
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        self.substitution.transition_hyperparameters(prng)?;
        self.insertion.transition_hyperparameters(prng)?;
        self.deletion.transition_hyperparameters(prng)
    }
}

impl Emission<String> for SimpleStringEmission {
    fn sample_corrupted(&mut self, clean: &String, prng: &mut Prng) -> String {
        let mut dirty = String::new();
        for c in clean.chars() {
            while self.insertion.sample(prng) {
                dirty.push(Self::random_character(prng));
            }
            if self.deletion.sample(prng) {
                continue;
            }
            if self.substitution.sample(prng) {
                dirty.push(Self::random_character(prng));
            } else {
                dirty.push(c);
            }
        }
        while self.insertion.sample(prng) {
            dirty.push(Self::random_character(prng));
        }
        dirty
    }

    fn propose_clean(&self, corrupted: &[String], _prng: &mut Prng) -> String {
        // Per-position majority vote, stopping where the mode is
        // end-of-string.
        let char_lists: Vec<Vec<char>> = corrupted.iter().map(|s| s.chars().collect()).collect();
        let mut clean = String::new();
        let mut i = 0;
        loop {
            let mut counts: Vec<(Option<char>, usize)> = Vec::new();
            for chars in &char_lists {
                let c = chars.get(i).copied();
                match counts.iter_mut().find(|(seen, _)| *seen == c) {
                    Some((_, count)) => *count += 1,
                    None => counts.push((c, 1)),
                }
            }
            let mode = counts
                .iter()
                .max_by_key(|(_, count)| *count)
                .map(|(c, _)| *c)
                .unwrap_or(None);
            match mode {
                Some(c) => clean.push(c),
                None => return clean,
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_round_trip() {
        let mut emission = SimpleStringEmission::new();
        emission.incorporate(&("cat".to_string(), "cot".to_string()));
        let score = emission.logp_score();
        emission.incorporate(&("dog".to_string(), "dg".to_string()));
        emission.unincorporate(&("dog".to_string(), "dg".to_string()));
        assert!((emission.logp_score() - score).abs() < 1e-9);
    }

    #[test]
    fn test_logp_is_immutable() {
        let mut emission = SimpleStringEmission::new();
        emission.incorporate(&("hello".to_string(), "hello".to_string()));
        let score = emission.logp_score();
        let lp = emission.logp(&("hello".to_string(), "hellp".to_string()));
        assert!(lp < 0.0);
        assert!((emission.logp_score() - score).abs() < 1e-12);
    }

    #[test]
    fn test_clean_copies_likelier_after_clean_data() {
        let mut emission = SimpleStringEmission::new();
        for _ in 0..20 {
            emission.incorporate(&("abc".to_string(), "abc".to_string()));
        }
        let identical = emission.logp(&("xyz".to_string(), "xyz".to_string()));
        let corrupted = emission.logp(&("xyz".to_string(), "qqq".to_string()));
        assert!(identical > corrupted);
    }

    #[test]
    fn test_propose_clean_majority_vote() {
        let mut prng = Prng::seed_from_u64(0);
        let emission = SimpleStringEmission::new();
        let corrupted = vec![
            "cat".to_string(),
            "cat".to_string(),
            "cot".to_string(),
        ];
        assert_eq!(emission.propose_clean(&corrupted, &mut prng), "cat");
    }

    #[test]
    fn test_sample_corrupted_with_clean_statistics() {
        let mut prng = Prng::seed_from_u64(5);
        let mut emission = SimpleStringEmission::new();
        for _ in 0..200 {
            emission.incorporate(&("abcdef".to_string(), "abcdef".to_string()));
        }
        // With strong evidence for clean copies, corruption is rare.
        let dirty = emission.sample_corrupted(&"hello".to_string(), &mut prng);
        assert!(
            crate::emissions::alignment::levenshtein(&dirty, "hello") <= 1,
            "heavily corrupted: {dirty:?}"
        );
    }
}
