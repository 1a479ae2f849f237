//! Bigram distribution over strings of printable ASCII.
//!
//! One Dirichlet-categorical transition distribution per previous symbol
//! (character or the start/stop marker). `logp` conditions each successive
//! character on the earlier ones by overlaying delta counts, so scoring a
//! string never mutates the model.

use super::{sample_from_grid, DirichletCategorical, Distribution, ALPHA_GRID};
use crate::error::Result;
use crate::Prng;

const MIN_CHAR: u8 = b' ';
const MAX_CHAR: u8 = b'~';

#[derive(Debug, Clone)]
pub struct Bigram {
    /// Shared concentration for all transition distributions.
    pub alpha: f64,
    /// Longest string accepted; 0 means unlimited.
    pub max_length: usize,
    /// Index `i` holds `p(next | previous == symbol_i)`; the final index is
    /// the start/stop marker.
    transitions: Vec<DirichletCategorical>,
    n: f64,
}

/// Printable ASCII without DEL.
fn num_chars() -> usize {
    (MAX_CHAR - MIN_CHAR + 1) as usize
}

impl Bigram {
    pub fn new() -> Self {
        let total = num_chars() + 1;
        Bigram {
            alpha: 1.0,
            max_length: 0,
            transitions: vec![DirichletCategorical::new(total); total],
            n: 0.0,
        }
    }

    fn char_to_index(c: char) -> usize {
        let byte = u32::from(c);
        assert!(
            (u32::from(MIN_CHAR)..=u32::from(MAX_CHAR)).contains(&byte),
            "character {c:?} outside printable ASCII"
        );
        (byte - u32::from(MIN_CHAR)) as usize
    }

    fn index_to_char(i: usize) -> char {
        assert!(i < num_chars());
        (MIN_CHAR + i as u8) as char
    }

    /// Symbol indices with the start/stop marker at both ends.
    fn string_to_indices(&self, s: &str) -> Vec<usize> {
        let stop = num_chars();
        let mut indices = Vec::with_capacity(s.len() + 2);
        indices.push(stop);
        for c in s.chars() {
            indices.push(Self::char_to_index(c));
        }
        indices.push(stop);
        indices
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
        for dist in &mut self.transitions {
            dist.alpha = alpha;
        }
    }
}

impl Default for Bigram {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution<String> for Bigram {
    fn count(&self) -> f64 {
        self.n
    }

    fn incorporate_weighted(&mut self, x: &String, weight: f64) {
        assert!(
            self.max_length == 0 || x.len() <= self.max_length,
            "string of length {} exceeds max length {}",
            x.len(),
            self.max_length
        );
        let indices = self.string_to_indices(x);
        for pair in indices.windows(2) {
            self.transitions[pair[0]].incorporate_weighted(&(pair[1] as i64), weight);
        }
        self.n += weight;
    }

    fn logp(&self, s: &String) -> f64 {
        let indices = self.string_to_indices(s);
        let k = (num_chars() + 1) as f64;
        // Delta counts overlaying the stored statistics, so each successive
        // character is conditioned on the ones scored before it.
        let mut delta = std::collections::BTreeMap::<(usize, usize), f64>::new();
        let mut delta_totals = std::collections::BTreeMap::<usize, f64>::new();
        let mut total_logp = 0.0;
        for pair in indices.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            let dist = &self.transitions[prev];
            let pair_delta = delta.get(&(prev, next)).copied().unwrap_or(0.0);
            let total_delta = delta_totals.get(&prev).copied().unwrap_or(0.0);
            let numer = dist.alpha + dist.counts[next] + pair_delta;
            let denom = dist.n + total_delta + dist.alpha * k;
            total_logp += numer.ln() - denom.ln();
            *delta.entry((prev, next)).or_insert(0.0) += 1.0;
            *delta_totals.entry(prev).or_insert(0.0) += 1.0;
        }
        total_logp
    }

    fn logp_score(&self) -> f64 {
        self.transitions.iter().map(Distribution::logp_score).sum()
    }

    fn sample(&mut self, prng: &mut Prng) -> String {
        let stop = num_chars();
        let mut sampled = String::new();
        // Incorporate each sampled transition so later draws condition on
        // it, then roll all of them back.
        let mut drawn: Vec<(usize, i64)> = Vec::new();
        let mut current = stop;
        loop {
            let next = self.transitions[current].sample(prng);
            self.transitions[current].incorporate(&next);
            drawn.push((current, next));
            if next as usize == stop {
                break;
            }
            sampled.push(Self::index_to_char(next as usize));
            if self.max_length > 0 && sampled.len() == self.max_length {
                break;
            }
            current = next as usize;
        }
        for (prev, next) in drawn {
            self.transitions[prev].unincorporate(&next);
        }
        sampled
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        let mut logps = Vec::new();
        let mut alphas = Vec::new();
        for alpha in ALPHA_GRID {
            self.set_alpha(alpha);
            logps.push(self.logp_score());
            alphas.push(alpha);
        }
        let i = sample_from_grid(
            "Bigram",
            &logps,
            format_args!("n={}", self.n),
            prng,
        )?;
        self.set_alpha(alphas[i]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_round_trip() {
        let mut bigram = Bigram::new();
        bigram.incorporate(&"cat".to_string());
        let score = bigram.logp_score();
        bigram.incorporate(&"dog".to_string());
        bigram.unincorporate(&"dog".to_string());
        assert!((bigram.logp_score() - score).abs() < 1e-9);
        assert!((bigram.count() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_logp_does_not_mutate() {
        let mut bigram = Bigram::new();
        bigram.incorporate(&"hello".to_string());
        let score = bigram.logp_score();
        let lp = bigram.logp(&"help".to_string());
        assert!(lp < 0.0);
        assert!((bigram.logp_score() - score).abs() < 1e-12);
    }

    #[test]
    fn test_logp_conditions_on_own_prefix() {
        // "aa" repeats a transition, so its second step is more likely than
        // the first under the overlay; the empty model still scores it.
        let bigram = Bigram::new();
        let lp = bigram.logp(&"aa".to_string());
        assert!(lp.is_finite());
        let k = (num_chars() + 1) as f64;
        // First 'a': 1/k. 'a'->'a': 1/k. 'a'->stop with overlay: 1/(k+1).
        let expected = (1.0 / k).ln() * 2.0 + (1.0 / (k + 1.0)).ln();
        assert!((lp - expected).abs() < 1e-9);
    }

    #[test]
    fn test_observed_string_becomes_likely() {
        let mut bigram = Bigram::new();
        for _ in 0..20 {
            bigram.incorporate(&"cat".to_string());
        }
        assert!(bigram.logp(&"cat".to_string()) > bigram.logp(&"dog".to_string()));
    }

    #[test]
    fn test_sample_restores_state() {
        let mut prng = Prng::seed_from_u64(10);
        let mut bigram = Bigram::new();
        bigram.incorporate(&"abc".to_string());
        let score = bigram.logp_score();
        let _ = bigram.sample(&mut prng);
        assert!((bigram.logp_score() - score).abs() < 1e-9);
    }

    #[test]
    fn test_max_length_truncates_samples() {
        let mut prng = Prng::seed_from_u64(3);
        let mut bigram = Bigram::new();
        bigram.max_length = 4;
        bigram.incorporate(&"abcd".to_string());
        for _ in 0..20 {
            assert!(bigram.sample(&mut prng).len() <= 4);
        }
    }

    #[test]
    fn test_transition_hyperparameters() {
        let mut prng = Prng::seed_from_u64(9);
        let mut bigram = Bigram::new();
        bigram.incorporate(&"inference".to_string());
        bigram.transition_hyperparameters(&mut prng).unwrap();
        assert!(ALPHA_GRID.contains(&bigram.alpha));
    }
}
