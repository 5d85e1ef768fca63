//! Weighted ensemble statistics and resampling helpers.

use nalgebra::DVector;
use rand::{Rng, RngCore};

use crate::utils::constants::{NEFF_EPSILON, WEIGHT_SUM_FLOOR};

/// Weighted mean and (population) standard deviation.
///
/// With `weights == None` every sample counts equally. Zero-sum weights fall
/// back to equal weighting.
pub fn weighted_mean_sd(values: &[f64], weights: Option<&[f64]>) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let uniform;
    let w = match weights {
        Some(w) if w.iter().sum::<f64>() > WEIGHT_SUM_FLOOR => w,
        _ => {
            uniform = vec![1.0; values.len()];
            &uniform
        }
    };
    let total: f64 = w.iter().sum();
    let mean = values.iter().zip(w).map(|(x, wi)| x * wi).sum::<f64>() / total;
    let var = values
        .iter()
        .zip(w)
        .map(|(x, wi)| wi * (x - mean) * (x - mean))
        .sum::<f64>()
        / total;
    (mean, var.max(0.0).sqrt())
}

/// Uniform weights `1/n`.
pub fn uniform_weights(n: usize) -> DVector<f64> {
    DVector::from_element(n, 1.0 / n as f64)
}

/// Normalize log-weights with the log-sum-exp trick.
///
/// Degenerate inputs (all `-inf` or non-finite) yield uniform weights.
pub fn normalize_log_weights(log_weights: &[f64]) -> DVector<f64> {
    let n = log_weights.len();
    let max = log_weights
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return uniform_weights(n);
    }
    let unnorm: Vec<f64> = log_weights
        .iter()
        .map(|&lw| if lw.is_nan() { 0.0 } else { (lw - max).exp() })
        .collect();
    let sum: f64 = unnorm.iter().sum();
    if sum <= WEIGHT_SUM_FLOOR {
        return uniform_weights(n);
    }
    DVector::from_iterator(n, unnorm.into_iter().map(|w| w / sum))
}

/// Effective sample size `1 / sum(w^2)` of normalized weights.
pub fn effective_sample_size(weights: &DVector<f64>) -> f64 {
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    1.0 / (sum_sq + NEFF_EPSILON)
}

/// O(N) systematic resampling.
///
/// Returns `n` source indices drawn proportionally to `weights` using a single
/// uniform offset.
pub fn systematic_resample(weights: &DVector<f64>, rng: &mut dyn RngCore) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    let mut cumsum = vec![0.0f64; n];
    cumsum[0] = weights[0];
    for i in 1..n {
        cumsum[i] = cumsum[i - 1] + weights[i];
    }
    let total = cumsum[n - 1];
    for c in cumsum.iter_mut() {
        *c /= total;
    }
    cumsum[n - 1] = 1.0;

    let step = 1.0 / n as f64;
    let offset: f64 = rng.gen::<f64>() * step;

    let mut indices = Vec::with_capacity(n);
    let mut j = 0usize;
    for i in 0..n {
        let pos = offset + step * i as f64;
        while j < n - 1 && cumsum[j] < pos {
            j += 1;
        }
        indices.push(j);
    }
    indices
}

/// Root mean square of a slice.
pub fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Running sum.
pub fn cumulative_sum(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .scan(0.0, |acc, &v| {
            *acc += v;
            Some(*acc)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rng::StreamEngine;

    #[test]
    fn test_weighted_mean_sd_uniform() {
        let (m, s) = weighted_mean_sd(&[1.0, 2.0, 3.0, 4.0], None);
        assert!((m - 2.5).abs() < 1e-12);
        assert!((s - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_mean_sd_point_mass() {
        let (m, s) = weighted_mean_sd(&[1.0, 5.0, 9.0], Some(&[0.0, 1.0, 0.0]));
        assert_eq!(m, 5.0);
        assert_eq!(s, 0.0);
    }

    #[test]
    fn test_normalize_log_weights() {
        let w = normalize_log_weights(&[-1000.0, -1000.0 + 2f64.ln()]);
        assert!((w[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((w[1] - 2.0 / 3.0).abs() < 1e-12);

        let degenerate = normalize_log_weights(&[f64::NEG_INFINITY; 4]);
        assert!(degenerate.iter().all(|&x| (x - 0.25).abs() < 1e-15));
    }

    #[test]
    fn test_effective_sample_size() {
        let uniform = uniform_weights(10);
        assert!((effective_sample_size(&uniform) - 10.0).abs() < 1e-6);
        let mut point = DVector::zeros(10);
        point[3] = 1.0;
        assert!((effective_sample_size(&point) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_systematic_resample_point_mass() {
        let mut rng = StreamEngine::at(42);
        let mut w = DVector::zeros(5);
        w[2] = 1.0;
        let idx = systematic_resample(&w, &mut rng);
        assert_eq!(idx, vec![2; 5]);
    }

    #[test]
    fn test_systematic_resample_uniform_is_identity() {
        let mut rng = StreamEngine::at(7);
        let idx = systematic_resample(&uniform_weights(8), &mut rng);
        assert_eq!(idx, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_cumulative_sum_and_rms() {
        assert_eq!(cumulative_sum(&[1.0, 2.0, 3.0]), vec![1.0, 3.0, 6.0]);
        assert!((rms(&[3.0, 4.0]) - 12.5f64.sqrt()).abs() < 1e-12);
    }
}
