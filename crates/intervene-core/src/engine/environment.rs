//! Ground-truth environment: a noisy Ornstein–Uhlenbeck-style causal network.
//!
//! Each step, every variable drifts toward its attractor mean (see
//! [`attractor_mean`]) and receives Gaussian noise with standard deviation
//! `σ·sqrt(dt)`. An intervention clamps one variable for that step, severing
//! its causal inputs. Values are kept inside `[-VALUE_BOUND, VALUE_BOUND]`.
//!
//! In replay mode the trajectory comes from recorded trial data instead of
//! being simulated; the causal matrix is then only used by planners.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::engine::errors::CoreError;
use crate::engine::history::StepHistory;
use crate::engine::space::{causality_matrix, causality_vector, num_links};
use crate::engine::types::{attractor_mean, Dynamics, Intervention};

/// Absolute bound on variable values (slider range).
pub const VALUE_BOUND: f64 = 100.0;

/// Multivariate causal network producing one observation vector per step.
#[derive(Debug, Clone)]
pub struct OuNetwork {
    trial_len: usize,
    num_variables: usize,
    causal_matrix: Vec<f64>,
    ground_truth: Vec<f64>,
    dynamics: Dynamics,
    n: usize,
    values: StepHistory<Vec<f64>>,
    interventions: StepHistory<Option<Intervention>>,
    replay: Option<Vec<Vec<f64>>>,
    rng: StdRng,
}

impl OuNetwork {
    /// Builds a network over `num_variables` variables for `trial_len` steps.
    ///
    /// `ground_truth` is a link vector of length `K²-K`. Variables start at 0.
    pub fn new(
        trial_len: usize,
        num_variables: usize,
        ground_truth: &[f64],
        dynamics: Dynamics,
        seed: u64,
    ) -> Result<Self, CoreError> {
        dynamics.validate()?;
        let expected = num_links(num_variables);
        if ground_truth.len() != expected {
            return Err(CoreError::shape("ground truth links", expected, ground_truth.len()));
        }
        if ground_truth.iter().any(|v| !v.is_finite()) {
            return Err(CoreError::Numerical("ground truth links must be finite".into()));
        }

        let matrix = causality_matrix(ground_truth, num_variables, 1.0);
        let mut values = StepHistory::new(trial_len);
        values.record(0, vec![0.0; num_variables]);

        Ok(Self {
            trial_len,
            num_variables,
            causal_matrix: matrix.clone(),
            ground_truth: matrix,
            dynamics,
            n: 0,
            values,
            interventions: StepHistory::new(trial_len),
            replay: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Replaces the starting values (step 0) of a simulated trial.
    pub fn with_initial_values(mut self, initial: &[f64]) -> Result<Self, CoreError> {
        if initial.len() != self.num_variables {
            return Err(CoreError::shape("initial values", self.num_variables, initial.len()));
        }
        self.values.record(0, initial.iter().map(|v| clamp(*v)).collect());
        Ok(self)
    }

    /// Loads a recorded trajectory of `N + 1` rows by `K` columns; subsequent
    /// runs replay it instead of simulating.
    pub fn load_trial_data(&mut self, data: Vec<Vec<f64>>) -> Result<(), CoreError> {
        if data.len() != self.trial_len + 1 {
            return Err(CoreError::shape("trial data rows", self.trial_len + 1, data.len()));
        }
        if let Some(row) = data.iter().find(|row| row.len() != self.num_variables) {
            return Err(CoreError::shape("trial data columns", self.num_variables, row.len()));
        }
        if data.iter().flatten().any(|v| !v.is_finite()) {
            return Err(CoreError::Numerical("trial data must be finite".into()));
        }

        self.n = 0;
        self.values.clear();
        self.interventions.clear();
        self.values.record(0, data[0].clone());
        self.replay = Some(data);
        Ok(())
    }

    /// Advances one step, applying `intervention` (if any) for this step.
    pub fn run(&mut self, intervention: Option<&Intervention>) -> Result<&[f64], CoreError> {
        if self.n >= self.trial_len {
            return Err(CoreError::Validation(format!(
                "environment already ran all {} steps",
                self.trial_len
            )));
        }
        if let Some(iv) = intervention {
            if iv.variable >= self.num_variables {
                return Err(CoreError::InvalidAction(format!(
                    "intervention on variable {} but network has {} variables",
                    iv.variable, self.num_variables
                )));
            }
        }

        let replayed = self.replay.as_ref().map(|data| data[self.n + 1].clone());
        let next = match replayed {
            Some(row) => row,
            None => self.simulate_step(intervention)?,
        };

        self.interventions.record(self.n, intervention.copied());
        self.n += 1;
        self.values.record(self.n, next);
        Ok(self.current())
    }

    fn simulate_step(&mut self, intervention: Option<&Intervention>) -> Result<Vec<f64>, CoreError> {
        let noise = Normal::new(0.0, self.dynamics.step_sd())
            .map_err(|e| CoreError::Numerical(format!("noise distribution: {}", e)))?;
        let previous = self.current().to_vec();

        let next = (0..self.num_variables)
            .map(|j| match intervention {
                Some(iv) if iv.variable == j => clamp(iv.value),
                _ => {
                    let mu = attractor_mean(&self.causal_matrix, &previous, j, &self.dynamics);
                    clamp(mu + noise.sample(&mut self.rng))
                }
            })
            .collect();
        Ok(next)
    }

    /// Undoes `back` steps; going past the start resets to step 0.
    pub fn rollback(&mut self, back: usize) {
        self.n = self.n.saturating_sub(back);
        self.values.clear_after(self.n);
        self.interventions.clear_after(self.n);
        if self.n == 0 {
            self.interventions.clear();
        }
    }

    /// Scratch copy for simulated rollouts, optionally with another causal
    /// structure (link vector). The copy never replays recorded data and has
    /// its own random stream.
    pub fn fork(&self, structure: Option<&[f64]>, seed: u64) -> Result<Self, CoreError> {
        let mut scratch = self.clone();
        scratch.replay = None;
        scratch.rng = StdRng::seed_from_u64(seed);
        if let Some(links) = structure {
            scratch.set_causal_vector(links)?;
        }
        Ok(scratch)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn trial_len(&self) -> usize {
        self.trial_len
    }

    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    pub fn dynamics(&self) -> &Dynamics {
        &self.dynamics
    }

    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    /// Values at the current step.
    pub fn current(&self) -> &[f64] {
        self.values.get(self.n).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Values at the previous step (the current values at step 0).
    pub fn previous(&self) -> &[f64] {
        let prev = self.n.saturating_sub(1);
        self.values.get(prev).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Realized trajectory for steps `0..=n`.
    pub fn trajectory(&self) -> Vec<Vec<f64>> {
        self.values.prefix(self.n).cloned().collect()
    }

    /// Intervention applied at step `n` (transition `n -> n+1`).
    pub fn intervention_at(&self, n: usize) -> Option<Intervention> {
        self.interventions.get(n).copied().flatten()
    }

    /// Active causal structure as a row-major `K×K` matrix.
    pub fn causal_matrix(&self) -> &[f64] {
        &self.causal_matrix
    }

    pub fn set_causal_matrix(&mut self, matrix: &[f64]) -> Result<(), CoreError> {
        let expected = self.num_variables * self.num_variables;
        if matrix.len() != expected {
            return Err(CoreError::shape("causal matrix", expected, matrix.len()));
        }
        self.causal_matrix = matrix.to_vec();
        Ok(())
    }

    /// Active causal structure as a link vector.
    pub fn causal_vector(&self) -> Vec<f64> {
        causality_vector(&self.causal_matrix, self.num_variables)
    }

    pub fn set_causal_vector(&mut self, links: &[f64]) -> Result<(), CoreError> {
        let expected = num_links(self.num_variables);
        if links.len() != expected {
            return Err(CoreError::shape("causal vector", expected, links.len()));
        }
        self.causal_matrix = causality_matrix(links, self.num_variables, 1.0);
        Ok(())
    }

    /// The structure the network was built with, as a link vector.
    pub fn ground_truth(&self) -> Vec<f64> {
        causality_vector(&self.ground_truth, self.num_variables)
    }
}

fn clamp(v: f64) -> f64 {
    v.clamp(-VALUE_BOUND, VALUE_BOUND)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(trial_len: usize) -> OuNetwork {
        OuNetwork::new(
            trial_len,
            3,
            &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            Dynamics::new(0.2, 0.5, 3.0),
            11,
        )
        .unwrap()
    }

    #[test]
    fn simulation_respects_interventions_and_bounds() {
        let mut env = network(20);
        let iv = Intervention::new(0, 250.0);
        for _ in 0..10 {
            let x = env.run(Some(&iv)).unwrap().to_vec();
            assert_eq!(x[0], VALUE_BOUND);
            assert!(x.iter().all(|v| v.abs() <= VALUE_BOUND));
        }
        assert_eq!(env.n(), 10);
        assert_eq!(env.intervention_at(3), Some(iv));
        // 0 -> 1 is positive, so variable 1 is pulled upward.
        assert!(env.current()[1] > 0.0);
    }

    #[test]
    fn cannot_run_past_trial_end() {
        let mut env = network(2);
        env.run(None).unwrap();
        env.run(None).unwrap();
        assert!(env.run(None).is_err());
    }

    #[test]
    fn rejects_intervention_on_unknown_variable() {
        let mut env = network(2);
        let err = env.run(Some(&Intervention::new(3, 1.0))).unwrap_err();
        assert!(matches!(err, CoreError::InvalidAction(_)));
    }

    #[test]
    fn replays_loaded_data() {
        let mut env = network(2);
        let data = vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0], vec![6.0, 7.0, 8.0]];
        env.load_trial_data(data.clone()).unwrap();
        env.run(None).unwrap();
        assert_eq!(env.previous(), &data[0][..]);
        assert_eq!(env.current(), &data[1][..]);
        env.run(None).unwrap();
        assert_eq!(env.trajectory(), data);
    }

    #[test]
    fn load_trial_data_checks_shape() {
        let mut env = network(2);
        assert!(matches!(
            env.load_trial_data(vec![vec![0.0; 3]; 2]),
            Err(CoreError::Shape(_))
        ));
        assert!(matches!(
            env.load_trial_data(vec![vec![0.0; 2]; 3]),
            Err(CoreError::Shape(_))
        ));
    }

    #[test]
    fn fork_does_not_touch_canonical_structure() {
        let env = network(5);
        let mut scratch = env.fork(Some(&[0.0; 6]), 3).unwrap();
        scratch.run(None).unwrap();
        assert_eq!(env.causal_vector(), env.ground_truth());
        assert_eq!(scratch.causal_vector(), vec![0.0; 6]);
        assert_eq!(env.n(), 0);
    }

    #[test]
    fn rollback_restores_earlier_step() {
        let mut env = network(5);
        env.run(None).unwrap();
        let snapshot = env.current().to_vec();
        env.run(None).unwrap();
        env.run(None).unwrap();
        env.rollback(2);
        assert_eq!(env.n(), 1);
        assert_eq!(env.current(), &snapshot[..]);
        env.rollback(10);
        assert_eq!(env.n(), 0);
    }
}
