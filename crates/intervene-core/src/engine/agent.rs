//! Agent: sensory, internal and action states advanced in lockstep.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::engine::action::ActionState;
use crate::engine::environment::OuNetwork;
use crate::engine::errors::CoreError;
use crate::engine::internal::{InternalState, InternalStateKind};
use crate::engine::sensory::SensoryState;
use crate::engine::types::Intervention;

/// What happened during one generative step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepRecord {
    /// Step reached after the transition.
    pub n: usize,
    pub action: Option<Intervention>,
    /// Posterior entropy after the update.
    pub entropy: f64,
}

/// Scores produced by one replayed step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitRecord {
    pub n: usize,
    pub action: Option<Intervention>,
    pub action_log_probability: f64,
    /// `None` when no judgement data is loaded.
    pub judgement_log_probability: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Agent {
    sensory: SensoryState,
    internal: InternalStateKind,
    action: ActionState,
}

impl Agent {
    pub fn new(
        sensory: SensoryState,
        internal: InternalStateKind,
        action: ActionState,
    ) -> Result<Self, CoreError> {
        if action.grid().num_variables() != internal.num_variables() {
            return Err(CoreError::shape(
                "action grid variables",
                internal.num_variables(),
                action.grid().num_variables(),
            ));
        }
        let agent = Self {
            sensory,
            internal,
            action,
        };
        agent.check_clocks()?;
        Ok(agent)
    }

    pub fn sensory(&self) -> &SensoryState {
        &self.sensory
    }

    pub fn internal(&self) -> &InternalStateKind {
        &self.internal
    }

    pub fn internal_mut(&mut self) -> &mut InternalStateKind {
        &mut self.internal
    }

    pub fn action(&self) -> &ActionState {
        &self.action
    }

    pub fn action_mut(&mut self) -> &mut ActionState {
        &mut self.action
    }

    pub fn n(&self) -> usize {
        self.internal.n()
    }

    pub fn trial_len(&self) -> usize {
        self.internal.trial_len()
    }

    /// Chooses an action, runs the environment, observes and updates beliefs.
    pub fn step(&mut self, env: &mut OuNetwork) -> Result<StepRecord, CoreError> {
        let action = self.action.sample(env, &self.sensory, &self.internal)?;
        env.run(action.as_ref())?;

        let before = self.internal.posterior_entropy();
        let percept = self.sensory.observe(env);
        self.internal.update(percept, action.as_ref())?;
        let entropy = self.internal.posterior_entropy();
        self.action.record_outcome(before - entropy);

        self.check_clocks()?;
        Ok(StepRecord {
            n: self.n(),
            action,
            entropy,
        })
    }

    /// Scores the recorded action, replays the transition and scores the
    /// recorded judgement.
    pub fn fit_step(&mut self, env: &mut OuNetwork) -> Result<FitRecord, CoreError> {
        let outcome = self.action.fit(env, &self.sensory, &self.internal)?;
        env.run(outcome.action.as_ref())?;

        let percept = self.sensory.observe(env);
        let judgement = self.internal.update(percept, outcome.action.as_ref())?;

        self.check_clocks()?;
        Ok(FitRecord {
            n: self.n(),
            action: outcome.action,
            action_log_probability: outcome.log_probability,
            judgement_log_probability: judgement,
        })
    }

    /// Rewinds every component by `back` steps.
    pub fn rollback(&mut self, back: usize) {
        self.sensory.rollback(back);
        self.internal.rollback(back);
        self.action.rollback(back);
    }

    /// Running action log-likelihood, when action data is loaded.
    pub fn action_log_likelihood(&self) -> Option<f64> {
        self.action.log_likelihood()
    }

    /// Running judgement log-likelihood, when judgement data is loaded.
    pub fn judgement_log_likelihood(&self) -> Option<f64> {
        self.internal.log_likelihood()
    }

    fn check_clocks(&self) -> Result<(), CoreError> {
        let n = self.internal.n();
        if self.sensory.n() != n || self.action.n() != n {
            return Err(CoreError::Internal(format!(
                "component clocks disagree: sensory {}, internal {}, action {}",
                self.sensory.n(),
                n,
                self.action.n()
            )));
        }
        Ok(())
    }
}
