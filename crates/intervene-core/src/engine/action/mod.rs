//! Action state: decides when and how the agent intervenes.
//!
//! Actions live on a flat index grid: variable `v` set to `values[i]` is index
//! `v·|values| + i`, and the last index (`K·|values|`) means staying idle.
//!
//! Behaviours:
//! - observer: never intervenes
//! - random: replans uniformly over the grid
//! - actor: replans by sampling a [`Policy`] over action values from a
//!   [`ValueFunction`]
//!
//! A plan is held for `action_len` steps before replanning. Once the belief
//! entropy falls below the certainty threshold after a third of the trial, the
//! agent stops intervening.
//!
//! In fitting mode, [`ActionState::fit`] scores the recorded action under the
//! same machinery instead of sampling one.

pub mod experience;
pub mod policy;
pub mod tree_search;

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::trace;

use crate::engine::environment::OuNetwork;
use crate::engine::errors::CoreError;
use crate::engine::history::{LikelihoodLedger, StepHistory};
use crate::engine::internal::{InternalState, InternalStateKind};
use crate::engine::numeric_kernels::nearest_index;
use crate::engine::sensory::SensoryState;
use crate::engine::types::Intervention;

pub use experience::ExperienceValues;
pub use policy::{EpsilonGreedy, Policy, Softmax};
pub use tree_search::{
    ActionSequence, HardHorizon, Knowledge, PlanningOutcome, RolloutState, SoftHorizon,
    TreeSearch, TreeSearchValues,
};

/// Share of the trial after which a certain agent stops intervening.
pub const STOP_WHEN_CERTAIN_AFTER: f64 = 0.33;

/// Bijection between flat action indices and interventions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActionGrid {
    num_variables: usize,
    values: Vec<f64>,
}

impl ActionGrid {
    pub fn new(num_variables: usize, values: Vec<f64>) -> Result<Self, CoreError> {
        if num_variables == 0 {
            return Err(CoreError::Validation("action grid needs at least one variable".into()));
        }
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return Err(CoreError::Validation(
                "action values must be a non-empty set of finite numbers".into(),
            ));
        }
        Ok(Self {
            num_variables,
            values,
        })
    }

    /// `K·|values| + 1`.
    pub fn num_actions(&self) -> usize {
        self.num_variables * self.values.len() + 1
    }

    pub fn idle(&self) -> usize {
        self.num_actions() - 1
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// Intervention for a flat index; the idle index maps to `None`.
    pub fn remap(&self, action: usize) -> Result<Option<Intervention>, CoreError> {
        if action >= self.num_actions() {
            return Err(CoreError::InvalidAction(format!(
                "action index {} outside 0..{}",
                action,
                self.num_actions()
            )));
        }
        if action == self.idle() {
            return Ok(None);
        }
        let width = self.values.len();
        Ok(Some(Intervention::new(action / width, self.values[action % width])))
    }

    /// Snaps the value of an intervention to the nearest grid value.
    pub fn constrain(&self, action: Option<&Intervention>) -> Option<Intervention> {
        let iv = action?;
        let i = nearest_index(&self.values, iv.value)?;
        Some(Intervention::new(iv.variable, self.values[i]))
    }

    /// Flat index of an intervention, after snapping its value to the grid.
    pub fn flatten(&self, action: Option<&Intervention>) -> Result<usize, CoreError> {
        let Some(iv) = self.constrain(action) else {
            return Ok(self.idle());
        };
        if iv.variable >= self.num_variables {
            return Err(CoreError::InvalidAction(format!(
                "intervention on variable {} but grid has {} variables",
                iv.variable, self.num_variables
            )));
        }
        let i = self
            .values
            .iter()
            .position(|&v| v == iv.value)
            .ok_or_else(|| CoreError::Internal("constrained value missing from grid".into()))?;
        Ok(iv.variable * self.values.len() + i)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Behaviour {
    Observer,
    Random,
    Actor,
}

/// Where action values come from.
#[derive(Debug, Clone)]
pub enum ValueFunction {
    TreeSearch(TreeSearchValues),
    Experience(ExperienceValues),
}

/// Recorded actions of one trial.
///
/// Each vector has one entry per recorded frame (`N + 1`). `actions[n]` is the
/// variable the participant manipulated at frame `n`, `actions_fit[n]` the
/// subset of those that should be scored; the intervened value is read from
/// `values[n][variable]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActionData {
    pub actions: Vec<Option<usize>>,
    pub actions_fit: Vec<Option<usize>>,
    pub values: Vec<Vec<f64>>,
}

impl ActionData {
    fn validate(&self, trial_len: usize, num_variables: usize) -> Result<(), CoreError> {
        let rows = trial_len + 1;
        if self.actions.len() != rows {
            return Err(CoreError::shape("actions", rows, self.actions.len()));
        }
        if self.actions_fit.len() != rows {
            return Err(CoreError::shape("actions to fit", rows, self.actions_fit.len()));
        }
        if self.values.len() != rows {
            return Err(CoreError::shape("action values rows", rows, self.values.len()));
        }
        if let Some(row) = self.values.iter().find(|r| r.len() != num_variables) {
            return Err(CoreError::shape("action values columns", num_variables, row.len()));
        }
        let out_of_range = self
            .actions
            .iter()
            .chain(&self.actions_fit)
            .flatten()
            .find(|&&v| v >= num_variables);
        if let Some(v) = out_of_range {
            return Err(CoreError::InvalidAction(format!(
                "recorded action on variable {} but trial has {} variables",
                v, num_variables
            )));
        }
        Ok(())
    }

    fn intervention(&self, recorded: &[Option<usize>], n: usize) -> Option<Intervention> {
        let variable = recorded.get(n).copied().flatten()?;
        let value = self.values.get(n)?.get(variable)?;
        Some(Intervention::new(variable, *value))
    }
}

/// Scored action at one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOutcome {
    pub log_probability: f64,
    /// The recorded action, applied to the environment and beliefs.
    pub action: Option<Intervention>,
}

/// Configuration of an [`ActionState`] apart from its strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSettings {
    pub behaviour: Behaviour,
    /// Steps a planned action is held.
    pub action_len: usize,
    /// Posterior entropy (bits) under which a late-trial agent stops acting.
    pub certainty_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct ActionState {
    trial_len: usize,
    n: usize,
    grid: ActionGrid,
    settings: ActionSettings,
    policy: Arc<dyn Policy>,
    value_function: ValueFunction,
    action_idx: usize,
    current_action: usize,
    action_values: StepHistory<Vec<f64>>,
    sequence_values: StepHistory<Vec<(ActionSequence, f64)>>,
    planned: StepHistory<usize>,
    experience: StepHistory<ExperienceValues>,
    data: Option<ActionData>,
    ledger: Option<LikelihoodLedger>,
    rng: StdRng,
}

impl ActionState {
    pub fn new(
        trial_len: usize,
        grid: ActionGrid,
        settings: ActionSettings,
        policy: Arc<dyn Policy>,
        value_function: ValueFunction,
        seed: u64,
    ) -> Result<Self, CoreError> {
        if settings.action_len == 0 {
            return Err(CoreError::Validation("action_len must be >= 1".into()));
        }
        if !(settings.certainty_threshold.is_finite() && settings.certainty_threshold >= 0.0) {
            return Err(CoreError::Validation("certainty threshold must be >= 0".into()));
        }
        if let ValueFunction::Experience(exp) = &value_function {
            if exp.values().len() != grid.num_actions() {
                return Err(CoreError::shape("experience values", grid.num_actions(), exp.values().len()));
            }
        }
        let mut experience = StepHistory::new(trial_len);
        if let ValueFunction::Experience(exp) = &value_function {
            experience.record(0, exp.clone());
        }
        Ok(Self {
            trial_len,
            n: 0,
            current_action: grid.idle(),
            grid,
            settings,
            policy,
            value_function,
            action_idx: 0,
            action_values: StepHistory::new(trial_len),
            sequence_values: StepHistory::new(trial_len),
            planned: StepHistory::new(trial_len),
            experience,
            data: None,
            ledger: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn grid(&self) -> &ActionGrid {
        &self.grid
    }

    pub fn behaviour(&self) -> Behaviour {
        self.settings.behaviour
    }

    pub fn num_actions(&self) -> usize {
        self.grid.num_actions()
    }

    /// Action values computed at step `n`, if the agent planned then.
    pub fn action_values_at(&self, n: usize) -> Option<&[f64]> {
        self.action_values.get(n).map(Vec::as_slice)
    }

    /// Sample-averaged sequence values from the tree search at step `n`.
    pub fn sequence_values_at(&self, n: usize) -> Option<&[(ActionSequence, f64)]> {
        self.sequence_values.get(n).map(Vec::as_slice)
    }

    /// Flat action held at step `n`.
    pub fn planned_at(&self, n: usize) -> Option<usize> {
        self.planned.get(n).copied()
    }

    pub fn log_likelihood(&self) -> Option<f64> {
        self.ledger.as_ref().map(LikelihoodLedger::total)
    }

    pub fn ledger(&self) -> Option<&LikelihoodLedger> {
        self.ledger.as_ref()
    }

    pub fn experience(&self) -> Option<&ExperienceValues> {
        match &self.value_function {
            ValueFunction::Experience(exp) => Some(exp),
            ValueFunction::TreeSearch(_) => None,
        }
    }

    /// Chooses the intervention for the transition out of the current step.
    pub fn sample(
        &mut self,
        env: &OuNetwork,
        sensory: &SensoryState,
        internal: &InternalStateKind,
    ) -> Result<Option<Intervention>, CoreError> {
        if self.settings.behaviour == Behaviour::Observer {
            self.advance();
            return Ok(None);
        }
        if self.is_certain(internal) {
            self.advance();
            return Ok(None);
        }

        self.action_idx += 1;
        if self.action_idx >= self.settings.action_len || self.n == 0 {
            self.current_action = match self.settings.behaviour {
                Behaviour::Random => self.rng.random_range(0..self.grid.num_actions()),
                _ => {
                    let values = self.compute_action_values(env, sensory, internal)?;
                    self.policy.sample(&values, &mut self.rng)
                }
            };
            self.action_idx = 0;
            #[cfg(feature = "tracing")]
            trace!(n = self.n, action = self.current_action, "replanned");
        }

        self.planned.record(self.n, self.current_action);
        self.advance();
        self.grid.remap(self.current_action)
    }

    /// Scores the recorded action at the current step. Requires action data.
    pub fn fit(
        &mut self,
        env: &OuNetwork,
        sensory: &SensoryState,
        internal: &InternalStateKind,
    ) -> Result<FitOutcome, CoreError> {
        if self.ledger.is_none() {
            return Err(CoreError::Validation("fit requires loaded action data".into()));
        }
        let a = self.a();
        if self.settings.behaviour == Behaviour::Observer {
            return Ok(self.score(0.0, a));
        }
        if a.is_some() && self.a_fit().is_none() {
            return Ok(self.score(0.0, a));
        }

        let flat = self.grid.flatten(a.as_ref())?;
        let log_probability = match self.settings.behaviour {
            Behaviour::Random => -(self.grid.num_actions() as f64).ln(),
            _ => {
                let values = self.compute_action_values(env, sensory, internal)?;
                self.policy.pmf(flat, &values).ln()
            }
        };
        self.action_idx = 0;
        self.current_action = flat;
        self.planned.record(self.n, flat);
        Ok(self.score(log_probability, a))
    }

    fn score(&mut self, log_probability: f64, action: Option<Intervention>) -> FitOutcome {
        self.advance();
        if let Some(ledger) = self.ledger.as_mut() {
            ledger.accumulate(self.n, log_probability);
        }
        FitOutcome {
            log_probability,
            action,
        }
    }

    fn advance(&mut self) {
        self.n = (self.n + 1).min(self.trial_len);
        if let ValueFunction::Experience(exp) = &self.value_function {
            self.experience.record(self.n, exp.clone());
        }
    }

    fn is_certain(&self, internal: &InternalStateKind) -> bool {
        internal.posterior_entropy() < self.settings.certainty_threshold
            && self.n as f64 > STOP_WHEN_CERTAIN_AFTER * self.trial_len as f64
    }

    fn compute_action_values(
        &mut self,
        env: &OuNetwork,
        sensory: &SensoryState,
        internal: &InternalStateKind,
    ) -> Result<Vec<f64>, CoreError> {
        let values = match &self.value_function {
            ValueFunction::Experience(exp) => exp.values().to_vec(),
            ValueFunction::TreeSearch(search) => {
                let seed = self.rng.random();
                let outcome = search.action_values(
                    env,
                    sensory,
                    internal,
                    &self.grid,
                    self.settings.action_len,
                    seed,
                )?;
                self.sequence_values.record(self.n, outcome.sequences);
                outcome.values
            }
        };
        self.action_values.record(self.n, values.clone());
        Ok(values)
    }

    /// Feeds the entropy drop that followed the last step back into
    /// experience-based values. No-op for other value functions.
    pub fn record_outcome(&mut self, gain: f64) {
        let Some(action) = self.n.checked_sub(1).and_then(|n| self.planned.get(n).copied()) else {
            return;
        };
        if let ValueFunction::Experience(exp) = &mut self.value_function {
            exp.record(action, gain);
            self.experience.record(self.n, exp.clone());
        }
    }

    pub fn load_action_data(&mut self, data: ActionData) -> Result<(), CoreError> {
        data.validate(self.trial_len, self.grid.num_variables())?;
        self.data = Some(data);
        self.ledger = Some(LikelihoodLedger::new(self.trial_len));
        Ok(())
    }

    pub fn is_realised(&self) -> bool {
        self.data.is_some()
    }

    /// Recorded action at the current step.
    pub fn a(&self) -> Option<Intervention> {
        let data = self.data.as_ref()?;
        data.intervention(&data.actions, self.n)
    }

    /// Recorded action to score at the current step.
    pub fn a_fit(&self) -> Option<Intervention> {
        let data = self.data.as_ref()?;
        data.intervention(&data.actions_fit, self.n)
    }

    /// Recorded actions for steps `0..=n`.
    pub fn actions(&self) -> &[Option<usize>] {
        self.data
            .as_ref()
            .map_or(&[], |d| &d.actions[..=self.n.min(d.actions.len() - 1)])
    }

    pub fn actions_fit(&self) -> &[Option<usize>] {
        self.data
            .as_ref()
            .map_or(&[], |d| &d.actions_fit[..=self.n.min(d.actions_fit.len() - 1)])
    }

    pub fn rollback(&mut self, back: usize) {
        if back > self.trial_len || back > self.n {
            self.n = 0;
            self.action_values.clear();
            self.sequence_values.clear();
            self.planned.clear();
        } else {
            self.n -= back;
            self.action_values.clear_after(self.n);
            self.sequence_values.clear_after(self.n);
            self.planned.clear_after(self.n);
        }
        if let Some(ledger) = self.ledger.as_mut() {
            ledger.rewind(self.n);
        }
        if let ValueFunction::Experience(exp) = &mut self.value_function {
            if let Some(snapshot) = self.experience.get(self.n) {
                *exp = snapshot.clone();
            }
            self.experience.clear_after(self.n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::internal::{DiscreteInternalState, LocalComputations};
    use crate::engine::space::HypothesisSpace;
    use crate::engine::types::Dynamics;

    fn grid() -> ActionGrid {
        ActionGrid::new(3, vec![-100.0, 0.0, 100.0]).unwrap()
    }

    fn world(trial_len: usize) -> (OuNetwork, SensoryState, InternalStateKind) {
        let dynamics = Dynamics::new(0.2, 0.5, 3.0);
        let env = OuNetwork::new(trial_len, 3, &[0.0; 6], dynamics, 1).unwrap();
        let space = Arc::new(HypothesisSpace::new(3, &[-1.0, 0.0, 1.0]).unwrap());
        let internal = DiscreteInternalState::new(
            trial_len,
            space,
            &vec![vec![1.0; 3]; 6],
            dynamics,
            Arc::new(LocalComputations),
            0.0,
        )
        .unwrap();
        (env, SensoryState::new(trial_len, 3), internal.into())
    }

    fn state(behaviour: Behaviour, value_function: ValueFunction, trial_len: usize) -> ActionState {
        ActionState::new(
            trial_len,
            grid(),
            ActionSettings {
                behaviour,
                action_len: 2,
                certainty_threshold: 1e-2,
            },
            Arc::new(Softmax::new(1.0).unwrap()),
            value_function,
            3,
        )
        .unwrap()
    }

    #[test]
    fn grid_remap_and_flatten() {
        let g = grid();
        assert_eq!(g.num_actions(), 10);
        assert_eq!(g.remap(9).unwrap(), None);
        assert_eq!(g.remap(4).unwrap(), Some(Intervention::new(1, 0.0)));
        assert!(matches!(g.remap(10), Err(CoreError::InvalidAction(_))));
        assert_eq!(g.flatten(Some(&Intervention::new(2, 70.0))).unwrap(), 8);
        assert_eq!(g.flatten(None).unwrap(), 9);
        assert!(g.flatten(Some(&Intervention::new(3, 0.0))).is_err());
        // Equidistant values snap to the first grid entry.
        assert_eq!(g.constrain(Some(&Intervention::new(0, 50.0))), Some(Intervention::new(0, 0.0)));
    }

    #[test]
    fn observer_never_acts() {
        let (env, sensory, internal) = world(5);
        let mut a = state(Behaviour::Observer, ValueFunction::Experience(ExperienceValues::new(10, 0.0)), 5);
        for _ in 0..5 {
            assert_eq!(a.sample(&env, &sensory, &internal).unwrap(), None);
        }
        assert_eq!(a.n(), 5);
    }

    #[test]
    fn random_agent_holds_plan_for_action_len() {
        let (env, sensory, internal) = world(6);
        let mut a = state(Behaviour::Random, ValueFunction::Experience(ExperienceValues::new(10, 0.0)), 6);
        for _ in 0..6 {
            a.sample(&env, &sensory, &internal).unwrap();
        }
        // Plans at n = 0, 2, 4 each last two steps.
        assert_eq!(a.planned_at(0), a.planned_at(1));
        assert_eq!(a.planned_at(2), a.planned_at(3));
        assert_eq!(a.planned_at(4), a.planned_at(5));
    }

    #[test]
    fn actor_records_action_values() {
        let (env, sensory, internal) = world(4);
        let tree = TreeSearchValues::new(1, Knowledge::Posterior, Arc::new(HardHorizon::new(1).unwrap())).unwrap();
        let mut a = state(Behaviour::Actor, ValueFunction::TreeSearch(tree), 4);
        a.sample(&env, &sensory, &internal).unwrap();
        assert_eq!(a.action_values_at(0).map(<[f64]>::len), Some(10));
        assert_eq!(a.sequence_values_at(0).map(<[_]>::len), Some(10));
        a.rollback(5);
        assert_eq!(a.n(), 0);
        assert!(a.action_values_at(0).is_none());
    }

    #[test]
    fn fit_scores_recorded_actions() {
        let (env, sensory, internal) = world(3);
        let mut a = state(Behaviour::Random, ValueFunction::Experience(ExperienceValues::new(10, 0.0)), 3);
        assert!(a.fit(&env, &sensory, &internal).is_err());

        let values = vec![vec![0.0, 40.0, 0.0]; 4];
        a.load_action_data(ActionData {
            actions: vec![Some(1), Some(1), None, None],
            actions_fit: vec![Some(1), None, None, None],
            values,
        })
        .unwrap();

        let first = a.fit(&env, &sensory, &internal).unwrap();
        assert!((first.log_probability + 10f64.ln()).abs() < 1e-12);
        assert_eq!(first.action, Some(Intervention::new(1, 40.0)));
        assert_eq!(a.planned_at(0), Some(4));

        // Recorded but excluded from fitting.
        let second = a.fit(&env, &sensory, &internal).unwrap();
        assert_eq!(second.log_probability, 0.0);

        let third = a.fit(&env, &sensory, &internal).unwrap();
        assert_eq!(third.action, None);
        assert!((a.log_likelihood().unwrap() + 2.0 * 10f64.ln()).abs() < 1e-12);

        a.rollback(2);
        assert!((a.log_likelihood().unwrap() + 10f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn action_data_shapes_are_checked() {
        let mut a = state(Behaviour::Random, ValueFunction::Experience(ExperienceValues::new(10, 0.0)), 3);
        let bad_variable = ActionData {
            actions: vec![Some(5), None, None, None],
            actions_fit: vec![None; 4],
            values: vec![vec![0.0; 3]; 4],
        };
        assert!(matches!(a.load_action_data(bad_variable), Err(CoreError::InvalidAction(_))));
        let bad_rows = ActionData {
            actions: vec![None; 3],
            actions_fit: vec![None; 4],
            values: vec![vec![0.0; 3]; 4],
        };
        assert!(matches!(a.load_action_data(bad_rows), Err(CoreError::Shape(_))));
    }

    #[test]
    fn experience_values_follow_outcomes() {
        let (env, sensory, internal) = world(4);
        let mut a = state(Behaviour::Actor, ValueFunction::Experience(ExperienceValues::new(10, 0.0)), 4);
        a.sample(&env, &sensory, &internal).unwrap();
        let chosen = a.planned_at(0).unwrap();
        a.record_outcome(1.5);
        assert_eq!(a.experience().unwrap().values()[chosen], 1.5);
        a.rollback(1);
        assert_eq!(a.experience().unwrap().values()[chosen], 0.0);
    }
}
