//! Categorical distribution over a closed set of strings.

use super::{DirichletCategorical, Distribution};
use crate::emissions::alignment::levenshtein;
use crate::error::Result;
use crate::Prng;

#[derive(Debug, Clone)]
pub struct StringCat {
    /// The support, in declaration order. Elements are distinct.
    pub strings: Vec<String>,
    dc: DirichletCategorical,
}

impl StringCat {
    pub fn new(strings: Vec<String>) -> Self {
        assert!(!strings.is_empty(), "stringcat needs a non-empty support");
        let k = strings.len();
        StringCat {
            strings,
            dc: DirichletCategorical::new(k),
        }
    }

    fn string_to_index(&self, s: &str) -> Option<i64> {
        self.strings.iter().position(|x| x == s).map(|i| i as i64)
    }
}

impl Distribution<String> for StringCat {
    fn count(&self) -> f64 {
        self.dc.count()
    }

    fn incorporate_weighted(&mut self, x: &String, weight: f64) {
        let index = self
            .string_to_index(x)
            .unwrap_or_else(|| panic!("string '{x}' not in stringcat support"));
        self.dc.incorporate_weighted(&index, weight);
    }

    fn logp(&self, x: &String) -> f64 {
        match self.string_to_index(x) {
            Some(index) => self.dc.logp(&index),
            None => f64::NEG_INFINITY,
        }
    }

    fn logp_score(&self) -> f64 {
        self.dc.logp_score()
    }

    fn sample(&mut self, prng: &mut Prng) -> String {
        let index = self.dc.sample(prng);
        self.strings[index as usize].clone()
    }

    fn transition_hyperparameters(&mut self, prng: &mut Prng) -> Result<()> {
        self.dc.transition_hyperparameters(prng)
    }

    fn nearest(&self, x: &String) -> String {
        if self.string_to_index(x).is_some() {
            return x.clone();
        }
        let mut best = &self.strings[0];
        let mut lowest = usize::MAX;
        for s in &self.strings {
            let d = levenshtein(s, x);
            if d < lowest {
                lowest = d;
                best = s;
            }
        }
        best.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn support() -> Vec<String> {
        vec!["PHD".to_string(), "MD".to_string(), "PT".to_string()]
    }

    #[test]
    fn test_logp_in_support() {
        let mut sc = StringCat::new(support());
        sc.incorporate(&"MD".to_string());
        sc.incorporate(&"MD".to_string());
        assert!(sc.logp(&"MD".to_string()) > sc.logp(&"PT".to_string()));
    }

    #[test]
    fn test_logp_outside_support() {
        let sc = StringCat::new(support());
        assert_eq!(sc.logp(&"LLB".to_string()), f64::NEG_INFINITY);
    }

    #[test]
    fn test_round_trip() {
        let mut sc = StringCat::new(support());
        sc.incorporate(&"PHD".to_string());
        let score = sc.logp_score();
        sc.incorporate(&"PT".to_string());
        sc.unincorporate(&"PT".to_string());
        assert!((sc.logp_score() - score).abs() < 1e-12);
    }

    #[test]
    fn test_nearest_snaps_to_support() {
        let sc = StringCat::new(support());
        assert_eq!(sc.nearest(&"MD".to_string()), "MD");
        assert_eq!(sc.nearest(&"PHDD".to_string()), "PHD");
        assert_eq!(sc.nearest(&"MB".to_string()), "MD");
    }

    #[test]
    fn test_sample_stays_in_support() {
        let mut prng = Prng::seed_from_u64(6);
        let mut sc = StringCat::new(support());
        sc.incorporate(&"PT".to_string());
        for _ in 0..20 {
            let s = sc.sample(&mut prng);
            assert!(support().contains(&s));
        }
    }

    #[test]
    #[should_panic(expected = "not in stringcat support")]
    fn test_incorporate_outside_support_panics() {
        let mut sc = StringCat::new(support());
        sc.incorporate(&"LLB".to_string());
    }
}
