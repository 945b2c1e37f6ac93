//! Experiment: drives one agent through one trial of an environment.
//!
//! - [`Experiment::run`]: generative mode; the agent chooses actions and the
//!   environment simulates the consequences
//! - [`Experiment::fit`]: replay mode; the environment replays recorded data
//!   and the agent scores the participant's recorded actions and judgements

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::engine::agent::{Agent, FitRecord, StepRecord};
use crate::engine::environment::OuNetwork;
use crate::engine::errors::CoreError;
use crate::engine::internal::InternalState;
use crate::engine::types::Intervention;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunSummary {
    /// Variable values for steps `0..=N`.
    pub trajectory: Vec<Vec<f64>>,
    /// Intervention applied at each transition.
    pub interventions: Vec<Option<Intervention>>,
    /// Posterior entropy for steps `0..=N`.
    pub entropy_history: Vec<f64>,
    pub posterior_over_links: Vec<Vec<f64>>,
    pub map: Vec<f64>,
    pub ground_truth: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitSummary {
    pub action_log_likelihood: f64,
    pub judgement_log_likelihood: Option<f64>,
    pub steps: Vec<FitRecord>,
    pub map: Vec<f64>,
}

impl FitSummary {
    /// Action plus judgement log-likelihood.
    pub fn total(&self) -> f64 {
        self.action_log_likelihood + self.judgement_log_likelihood.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    agent: Agent,
    env: OuNetwork,
}

impl Experiment {
    pub fn new(agent: Agent, env: OuNetwork) -> Result<Self, CoreError> {
        if agent.trial_len() != env.trial_len() {
            return Err(CoreError::shape("trial length", env.trial_len(), agent.trial_len()));
        }
        if agent.internal().num_variables() != env.num_variables() {
            return Err(CoreError::shape(
                "variables",
                env.num_variables(),
                agent.internal().num_variables(),
            ));
        }
        if agent.n() != env.n() {
            return Err(CoreError::Internal(format!(
                "agent at step {} but environment at step {}",
                agent.n(),
                env.n()
            )));
        }
        Ok(Self { agent, env })
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn environment(&self) -> &OuNetwork {
        &self.env
    }

    pub fn into_parts(self) -> (Agent, OuNetwork) {
        (self.agent, self.env)
    }

    /// Advances one generative step.
    pub fn step(&mut self) -> Result<StepRecord, CoreError> {
        let record = self.agent.step(&mut self.env)?;
        self.check_clock()?;
        Ok(record)
    }

    /// Runs the remaining steps of the trial in generative mode.
    pub fn run(&mut self) -> Result<RunSummary, CoreError> {
        while self.env.n() < self.env.trial_len() {
            self.step()?;
        }
        let internal = self.agent.internal();

        #[cfg(feature = "tracing")]
        debug!(entropy = internal.posterior_entropy(), map = ?internal.map(), "run finished");

        Ok(RunSummary {
            trajectory: self.env.trajectory(),
            interventions: (0..self.env.trial_len()).map(|n| self.env.intervention_at(n)).collect(),
            entropy_history: internal.entropy_history(),
            posterior_over_links: internal.posterior_over_links(),
            map: internal.map(),
            ground_truth: self.env.ground_truth(),
        })
    }

    /// Replays the remaining steps of a recorded trial, scoring actions and
    /// judgements. Requires trial data on the environment and action data on
    /// the agent.
    pub fn fit(&mut self) -> Result<FitSummary, CoreError> {
        if !self.env.is_replaying() {
            return Err(CoreError::Validation("fit requires recorded trial data".into()));
        }
        if !self.agent.action().is_realised() {
            return Err(CoreError::Validation("fit requires recorded action data".into()));
        }
        let mut steps = Vec::with_capacity(self.env.trial_len() - self.env.n());
        while self.env.n() < self.env.trial_len() {
            steps.push(self.agent.fit_step(&mut self.env)?);
            self.check_clock()?;
        }

        #[cfg(feature = "tracing")]
        debug!(
            action = ?self.agent.action_log_likelihood(),
            judgement = ?self.agent.judgement_log_likelihood(),
            "fit finished"
        );

        Ok(FitSummary {
            action_log_likelihood: self.agent.action_log_likelihood().unwrap_or(0.0),
            judgement_log_likelihood: self.agent.judgement_log_likelihood(),
            steps,
            map: self.agent.internal().map(),
        })
    }

    fn check_clock(&self) -> Result<(), CoreError> {
        if self.agent.n() != self.env.n() {
            return Err(CoreError::Internal(format!(
                "agent at step {} but environment at step {}",
                self.agent.n(),
                self.env.n()
            )));
        }
        Ok(())
    }
}
