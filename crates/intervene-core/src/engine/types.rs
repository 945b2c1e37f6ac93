//! Shared value types passed between state components.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An externally forced value on one variable for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Intervention {
    /// Index of the clamped variable.
    pub variable: usize,
    /// Value the variable is clamped to.
    pub value: f64,
}

impl Intervention {
    pub fn new(variable: usize, value: f64) -> Self {
        Self { variable, value }
    }
}

/// What the agent perceives after one environment step.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Percept {
    /// Variable values at the current step.
    pub current: Vec<f64>,
    /// Variable values at the previous step.
    pub previous: Vec<f64>,
}

impl Percept {
    pub fn new(current: Vec<f64>, previous: Vec<f64>) -> Self {
        Self { current, previous }
    }

    pub fn num_variables(&self) -> usize {
        self.current.len()
    }
}

/// Drift and noise parameters of the attractor dynamics.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Dynamics {
    /// Time step.
    pub dt: f64,
    /// Drift rate.
    pub theta: f64,
    /// Diffusion noise.
    pub sigma: f64,
}

impl Dynamics {
    pub fn new(dt: f64, theta: f64, sigma: f64) -> Self {
        Self { dt, theta, sigma }
    }

    /// Standard deviation of one-step observation noise, `σ·sqrt(dt)`.
    pub fn step_sd(&self) -> f64 {
        self.sigma * self.dt.sqrt()
    }

    pub(crate) fn validate(&self) -> Result<(), crate::engine::errors::CoreError> {
        use crate::engine::errors::CoreError;
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(CoreError::Validation(format!("dt must be > 0, got {}", self.dt)));
        }
        if !(self.theta.is_finite() && self.theta >= 0.0) {
            return Err(CoreError::Validation(format!("theta must be >= 0, got {}", self.theta)));
        }
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(CoreError::Validation(format!("sigma must be > 0, got {}", self.sigma)));
        }
        Ok(())
    }
}

/// Self-regulation term `x·(1 - |x|/100)` keeping values inside the slider range.
pub fn self_decay(x: f64) -> f64 {
    x * (1.0 - x.abs() / 100.0)
}

/// Attractor mean of variable `effect` given the row-major causal `matrix`.
///
/// `μ = x[j] + (Σ_{i≠j} link[i,j]·x[i] + self_decay(x[j]) − x[j]) · dt · θ`
pub fn attractor_mean(matrix: &[f64], previous: &[f64], effect: usize, dynamics: &Dynamics) -> f64 {
    let k = previous.len();
    let drive: f64 = (0..k)
        .filter(|&i| i != effect)
        .map(|i| matrix[i * k + effect] * previous[i])
        .sum();
    let x = previous[effect];
    x + (drive + self_decay(x) - x) * dynamics.dt * dynamics.theta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attractor_mean_without_links_decays_toward_zero() {
        let dynamics = Dynamics::new(0.2, 0.5, 3.0);
        let matrix = vec![1.0, 0.0, 0.0, 1.0];
        let mu = attractor_mean(&matrix, &[50.0, 0.0], 0, &dynamics);
        // self_decay(50) - 50 = -25, scaled by dt·θ = 0.1
        assert!((mu - 47.5).abs() < 1e-12);
    }

    #[test]
    fn attractor_mean_sums_incoming_links() {
        let dynamics = Dynamics::new(1.0, 1.0, 1.0);
        // 0 -> 1 with strength 0.5
        let matrix = vec![1.0, 0.5, 0.0, 1.0];
        let mu = attractor_mean(&matrix, &[10.0, 0.0], 1, &dynamics);
        assert!((mu - 5.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_dynamics_are_rejected() {
        assert!(Dynamics::new(0.0, 0.5, 3.0).validate().is_err());
        assert!(Dynamics::new(0.2, 0.5, -1.0).validate().is_err());
        assert!(Dynamics::new(0.2, 0.5, 3.0).validate().is_ok());
    }
}
