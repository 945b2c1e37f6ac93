//! Numeric kernels for probability computations.
//!
//! Scalar kernels shared by every belief engine:
//! - `normalize_log_probabilities`: numerically stable softmax over log-weights
//! - `entropy_bits`: Shannon entropy in bits with `log2(0) := 0`
//! - `smooth_toward_map`: confidence-damping transform toward the MAP
//! - `incremental_mean`: running-mean accumulator used by Monte-Carlo planning
//!
//! All kernels operate on plain slices so they can be reused for joint
//! (one row per hypothesis space) and factorized (one row per link) posteriors.

use rand::Rng;

/// Tolerance used when checking that probability vectors sum to one.
pub const PROBABILITY_TOLERANCE: f64 = 1e-9;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Converts unnormalized log-weights into a probability vector.
///
/// Subtracts the row maximum before exponentiating. A row without any finite
/// weight (all `-inf`) carries no information and maps to the uniform vector.
pub fn normalize_log_probabilities(log_weights: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; log_weights.len()];
    normalize_log_probabilities_into(log_weights, &mut out);
    out
}

/// In-place variant of [`normalize_log_probabilities`].
pub fn normalize_log_probabilities_into(log_weights: &[f64], out: &mut [f64]) {
    debug_assert_eq!(log_weights.len(), out.len());
    if log_weights.is_empty() {
        return;
    }

    let max = log_weights
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, |acc, v| if v > acc { v } else { acc });

    if !max.is_finite() {
        let uniform = 1.0 / log_weights.len() as f64;
        out.iter_mut().for_each(|p| *p = uniform);
        return;
    }

    let mut total = 0.0;
    for (p, &lw) in out.iter_mut().zip(log_weights) {
        *p = (lw - max).exp();
        total += *p;
    }
    for p in out.iter_mut() {
        *p /= total;
    }
}

/// Shannon entropy in bits. Zero-probability entries contribute nothing.
pub fn entropy_bits(distribution: &[f64]) -> f64 {
    -distribution
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| p * p.log2())
        .sum::<f64>()
}

/// Sum of row entropies, used for factorized (per-link) posteriors.
pub fn total_entropy_bits(rows: &[Vec<f64>]) -> f64 {
    rows.iter().map(|row| entropy_bits(row)).sum()
}

/// Log-density of `Normal(mean, sd)` at `x`.
pub fn normal_log_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -LN_SQRT_2PI - sd.ln() - 0.5 * z * z
}

/// Index of the first maximal entry. NaN entries never win.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

/// Index of the entry closest to `target`; ties resolve to the smallest index.
pub fn nearest_index(values: &[f64], target: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        let distance = (v - target).abs();
        match best {
            Some((_, d)) if distance >= d => {}
            _ => best = Some((i, distance)),
        }
    }
    best.map(|(i, _)| i)
}

/// Confidence-damping transform biasing each row toward its MAP neighbourhood.
///
/// For a row of length `L` with maximum at `m`, the triangular kernel is
/// `(L - |i - m|) / L`. It is added with weight `exp(-H) * temperature`, where
/// `H` is the total entropy (bits) over all rows, and every row is renormalized.
/// A temperature of zero returns the input unchanged.
pub fn smooth_toward_map(rows: &[Vec<f64>], temperature: f64) -> Vec<Vec<f64>> {
    if temperature == 0.0 {
        return rows.to_vec();
    }

    let certainty = (-total_entropy_bits(rows)).exp() * temperature;

    rows.iter()
        .map(|row| {
            let width = row.len() as f64;
            let peak = argmax(row) as f64;
            let mut smoothed: Vec<f64> = row
                .iter()
                .enumerate()
                .map(|(i, &p)| p + certainty * (width - (i as f64 - peak).abs()) / width)
                .collect();
            let total: f64 = smoothed.iter().sum();
            smoothed.iter_mut().for_each(|p| *p /= total);
            smoothed
        })
        .collect()
}

/// Folds sample number `count` (zero-based) into a running mean.
///
/// `mean += (sample - mean) / (count + 1)`; with `count == 0` the mean becomes
/// the sample itself.
pub fn incremental_mean(mean: &mut [f64], sample: &[f64], count: usize) {
    debug_assert_eq!(mean.len(), sample.len());
    if count == 0 {
        mean.copy_from_slice(sample);
        return;
    }
    let weight = 1.0 / (count as f64 + 1.0);
    for (m, &s) in mean.iter_mut().zip(sample) {
        *m += weight * (s - *m);
    }
}

/// Draws an index from a (not necessarily normalized) non-negative weight vector.
pub fn sample_categorical<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    if total.is_nan() || total <= 0.0 || total.is_infinite() {
        return rng.random_range(0..weights.len().max(1));
    }
    let mut r = rng.random::<f64>() * total;
    for (i, &w) in weights.iter().enumerate() {
        if r < w {
            return i;
        }
        r -= w;
    }
    // Floating-point leftovers land on the last positive entry.
    weights.iter().rposition(|&w| w > 0.0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn normalization_is_shift_invariant() {
        let a = normalize_log_probabilities(&[0.0, 1.0, 2.0]);
        let b = normalize_log_probabilities(&[1000.0, 1001.0, 1002.0]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-12);
        }
        assert!((a.iter().sum::<f64>() - 1.0).abs() < PROBABILITY_TOLERANCE);
    }

    #[test]
    fn normalization_of_all_neg_infinity_is_uniform() {
        let p = normalize_log_probabilities(&[f64::NEG_INFINITY; 4]);
        assert_eq!(p, vec![0.25; 4]);
    }

    #[test]
    fn entropy_of_point_mass_is_zero_and_uniform_is_log2_n() {
        assert_eq!(entropy_bits(&[0.0, 1.0, 0.0]), 0.0);
        let h = entropy_bits(&[0.125; 8]);
        assert!((h - 3.0).abs() < 1e-12);
    }

    #[test]
    fn normal_log_pdf_matches_closed_form() {
        let lp = normal_log_pdf(1.0, 0.0, 2.0);
        let expected = -(2.0 * std::f64::consts::PI).sqrt().ln() - 2f64.ln() - 0.125;
        assert!((lp - expected).abs() < 1e-12);
    }

    #[test]
    fn nearest_index_breaks_ties_toward_smallest_index() {
        let values = [-10.0, 0.0, 10.0];
        assert_eq!(nearest_index(&values, 5.0), Some(1));
        assert_eq!(nearest_index(&values, -5.0), Some(0));
        assert_eq!(nearest_index(&values, 7.0), Some(2));
        assert_eq!(nearest_index(&[], 7.0), None);
    }

    #[test]
    fn smoothing_with_zero_temperature_is_identity() {
        let rows = vec![vec![0.1, 0.7, 0.2], vec![0.3, 0.3, 0.4]];
        assert_eq!(smooth_toward_map(&rows, 0.0), rows);
    }

    #[test]
    fn smoothing_returns_valid_distributions() {
        let rows = vec![vec![0.05, 0.9, 0.05], vec![1.0, 0.0, 0.0]];
        let smoothed = smooth_toward_map(&rows, 5.0);
        for row in &smoothed {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < PROBABILITY_TOLERANCE);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
        // Mass moves away from certainty.
        assert!(smoothed[1][0] < 1.0);
        assert_eq!(argmax(&smoothed[1]), 0);
    }

    #[test]
    fn incremental_mean_matches_batch_mean() {
        let samples = [[1.0, 4.0], [3.0, 8.0], [5.0, 0.0]];
        let mut mean = [0.0; 2];
        for (c, s) in samples.iter().enumerate() {
            incremental_mean(&mut mean, s, c);
        }
        assert!((mean[0] - 3.0).abs() < 1e-12);
        assert!((mean[1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn categorical_sampling_respects_zero_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let i = sample_categorical(&[0.0, 2.0, 0.0, 1.0], &mut rng);
            assert!(i == 1 || i == 3);
        }
    }
}
