//! Numeric helpers shared across the inference core
//!
//! Log-domain accumulation (`logsumexp`, `log_normalize`), hyperparameter
//! grids (`linspace`, `log_linspace`), weighted sampling (`choice`,
//! `log_choice`) and the Cartesian product used when marginalizing over
//! cluster combinations.

use rand::Rng;

use crate::Prng;

/// Numerically stable log of a sum of exponentials.
///
/// Non-finite entries other than the maximum are skipped, so a `-inf`
/// candidate weight simply contributes nothing to the sum.
pub fn logsumexp(weights: &[f64]) -> f64 {
    assert!(!weights.is_empty(), "logsumexp of an empty list");
    let (max_index, m) = weights
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |acc, (i, w)| {
            if w > acc.1 {
                (i, w)
            } else {
                acc
            }
        });
    if m == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let mut s = 0.0;
    for (i, w) in weights.iter().enumerate() {
        if i == max_index {
            continue;
        }
        if w.is_finite() {
            s += (w - m).exp();
        }
    }
    s.ln_1p() + m
}

/// Normalize a list of log-weights so they sum to one in probability space.
pub fn log_normalize(weights: &[f64]) -> Vec<f64> {
    let z = logsumexp(weights);
    weights.iter().map(|w| w - z).collect()
}

/// `num` evenly spaced points from `start` to `stop`.
pub fn linspace(start: f64, stop: f64, num: usize, endpoint: bool) -> Vec<f64> {
    assert!(num > 1);
    let div = if endpoint { num - 1 } else { num };
    let step = (stop - start) / div as f64;
    (0..num).map(|i| start + step * i as f64).collect()
}

/// `num` log-uniformly spaced points from `start` to `stop`.
pub fn log_linspace(start: f64, stop: f64, num: usize, endpoint: bool) -> Vec<f64> {
    linspace(start.ln(), stop.ln(), num, endpoint)
        .into_iter()
        .map(f64::exp)
        .collect()
}

/// Draw an index proportional to the given non-negative weights.
pub fn choice(weights: &[f64], prng: &mut Prng) -> usize {
    let total: f64 = weights.iter().sum();
    assert!(
        total > 0.0 && total.is_finite(),
        "choice requires positive finite total weight, got {total}"
    );
    let mut u = prng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if u < *w {
            return i;
        }
        u -= w;
    }
    weights.len() - 1
}

/// Draw an index proportional to the given log-weights.
pub fn log_choice(log_weights: &[f64], prng: &mut Prng) -> usize {
    let normalized = log_normalize(log_weights);
    let weights: Vec<f64> = normalized.into_iter().map(f64::exp).collect();
    choice(&weights, prng)
}

/// Cartesian product of index lists. An empty input list yields a single
/// empty combination; any empty inner list yields no combinations.
pub fn product(lists: &[Vec<usize>]) -> Vec<Vec<usize>> {
    if lists.iter().any(Vec::is_empty) {
        return vec![];
    }
    let mut result: Vec<Vec<usize>> = vec![vec![]];
    for list in lists {
        let mut next = Vec::with_capacity(result.len() * list.len());
        for combo in &result {
            for &x in list {
                let mut extended = combo.clone();
                extended.push(x);
                next.push(extended);
            }
        }
        result = next;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_logsumexp_basic() {
        let weights = vec![1.0_f64.ln(), 2.0_f64.ln(), 3.0_f64.ln()];
        let expected = 6.0_f64.ln();
        assert!((logsumexp(&weights) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_logsumexp_skips_neg_infinity() {
        let weights = vec![0.0, f64::NEG_INFINITY];
        assert!((logsumexp(&weights) - 0.0).abs() < 1e-12);
        let all_neg = vec![f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert_eq!(logsumexp(&all_neg), f64::NEG_INFINITY);
    }

    #[test]
    fn test_logsumexp_large_magnitudes() {
        let weights = vec![1000.0, 1000.0];
        assert!((logsumexp(&weights) - (1000.0 + 2.0_f64.ln())).abs() < 1e-9);
    }

    #[test]
    fn test_linspace_endpoint() {
        let v = linspace(0.0, 1.0, 5, true);
        assert_eq!(v.len(), 5);
        assert!((v[0] - 0.0).abs() < 1e-12);
        assert!((v[4] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_log_linspace_spans_range() {
        let v = log_linspace(0.01, 100.0, 20, true);
        assert_eq!(v.len(), 20);
        assert!((v[0] - 0.01).abs() < 1e-9);
        assert!((v[19] - 100.0).abs() < 1e-6);
        for w in v.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_log_normalize_sums_to_one() {
        let normalized = log_normalize(&[0.5, -1.0, 2.0]);
        let total: f64 = normalized.iter().map(|w| w.exp()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_choice_respects_weights() {
        let mut prng = Prng::seed_from_u64(42);
        let weights = vec![0.0, 1.0, 0.0];
        for _ in 0..20 {
            assert_eq!(choice(&weights, &mut prng), 1);
        }
    }

    #[test]
    fn test_log_choice_heavily_skewed() {
        let mut prng = Prng::seed_from_u64(7);
        let log_weights = vec![0.0, -50.0];
        let mut counts = [0usize; 2];
        for _ in 0..100 {
            counts[log_choice(&log_weights, &mut prng)] += 1;
        }
        assert_eq!(counts[1], 0);
    }

    #[test]
    fn test_product() {
        let lists = vec![vec![0, 1], vec![0, 1, 2]];
        let combos = product(&lists);
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0], vec![0, 0]);
        assert_eq!(combos[5], vec![1, 2]);
    }

    #[test]
    fn test_product_with_empty_list() {
        assert!(product(&[vec![0, 1], vec![]]).is_empty());
        assert_eq!(product(&[]).len(), 1);
    }
}
