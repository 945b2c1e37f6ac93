//! Experience-based action values: state-independent, learned from the
//! entropy drop that followed each chosen action.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::engine::numeric_kernels::incremental_mean;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExperienceValues {
    values: Vec<f64>,
    counts: Vec<usize>,
}

impl ExperienceValues {
    /// All actions start at `initial`.
    pub fn new(num_actions: usize, initial: f64) -> Self {
        Self {
            values: vec![initial; num_actions],
            counts: vec![0; num_actions],
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn count(&self, action: usize) -> usize {
        self.counts.get(action).copied().unwrap_or(0)
    }

    /// Folds one observed entropy drop into the running mean of `action`.
    pub fn record(&mut self, action: usize, gain: f64) {
        if action >= self.values.len() || !gain.is_finite() {
            return;
        }
        let count = self.counts[action];
        incremental_mean(
            std::slice::from_mut(&mut self.values[action]),
            &[gain],
            count,
        );
        self.counts[action] += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_per_action() {
        let mut exp = ExperienceValues::new(3, 0.5);
        exp.record(1, 2.0);
        exp.record(1, 4.0);
        exp.record(7, 1.0);
        exp.record(2, f64::NAN);
        assert_eq!(exp.values(), &[0.5, 3.0, 0.5]);
        assert_eq!(exp.count(1), 2);
        assert_eq!(exp.count(2), 0);
    }
}
