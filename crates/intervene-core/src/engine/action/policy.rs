//! Policies: map action values to a distribution over flat action indices.

use std::fmt;

use rand::rngs::StdRng;

use crate::engine::errors::CoreError;
use crate::engine::numeric_kernels::{argmax, sample_categorical};

/// Stochastic choice rule over action values.
pub trait Policy: fmt::Debug + Send + Sync {
    /// Choice probabilities for every action.
    fn params(&self, values: &[f64]) -> Vec<f64>;

    /// Probability of choosing `action`; zero outside the value vector.
    fn pmf(&self, action: usize, values: &[f64]) -> f64 {
        self.params(values).get(action).copied().unwrap_or(0.0)
    }

    fn sample(&self, values: &[f64], rng: &mut StdRng) -> usize {
        sample_categorical(&self.params(values), rng)
    }
}

/// `p ∝ exp(temperature · v)`, computed with the maximum subtracted first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Softmax {
    pub temperature: f64,
}

impl Softmax {
    pub fn new(temperature: f64) -> Result<Self, CoreError> {
        if !temperature.is_finite() {
            return Err(CoreError::Validation(format!(
                "softmax temperature must be finite, got {}",
                temperature
            )));
        }
        Ok(Self { temperature })
    }
}

impl Policy for Softmax {
    fn params(&self, values: &[f64]) -> Vec<f64> {
        let scaled: Vec<f64> = values.iter().map(|v| self.temperature * v).collect();
        let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return vec![1.0 / values.len().max(1) as f64; values.len()];
        }
        let exp: Vec<f64> = scaled.iter().map(|z| (z - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        exp.iter().map(|e| e / total).collect()
    }
}

/// Greedy with probability `1 − ε`, uniform with probability `ε`:
/// `p = ε/n + (1 − ε)·[a = argmax]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpsilonGreedy {
    pub epsilon: f64,
}

impl EpsilonGreedy {
    pub fn new(epsilon: f64) -> Result<Self, CoreError> {
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(CoreError::Validation(format!(
                "epsilon must be in [0, 1], got {}",
                epsilon
            )));
        }
        Ok(Self { epsilon })
    }
}

impl Policy for EpsilonGreedy {
    fn params(&self, values: &[f64]) -> Vec<f64> {
        if values.is_empty() {
            return Vec::new();
        }
        let mut p = vec![self.epsilon / values.len() as f64; values.len()];
        p[argmax(values)] += 1.0 - self.epsilon;
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn softmax_is_stable_for_large_values() {
        let p = Softmax::new(1.0).unwrap().params(&[1000.0, 1000.0, 0.0]);
        assert!((p[0] - 0.5).abs() < 1e-12);
        assert!(p[2] < 1e-300);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_temperature_softmax_is_uniform() {
        let p = Softmax::new(0.0).unwrap().params(&[3.0, -2.0]);
        assert_eq!(p, vec![0.5, 0.5]);
    }

    #[test]
    fn epsilon_greedy_pmf_matches_params() {
        let policy = EpsilonGreedy::new(0.2).unwrap();
        let values = [0.1, 0.9, 0.3, 0.0];
        assert!((policy.pmf(1, &values) - (0.05 + 0.8)).abs() < 1e-12);
        assert!((policy.pmf(0, &values) - 0.05).abs() < 1e-12);
        assert_eq!(policy.pmf(9, &values), 0.0);
        assert!(EpsilonGreedy::new(1.5).is_err());
    }

    #[test]
    fn greedy_sampling_picks_argmax() {
        let policy = EpsilonGreedy::new(0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            assert_eq!(policy.sample(&[0.0, 2.0, 1.0], &mut rng), 1);
        }
    }
}
