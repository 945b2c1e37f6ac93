//! Agent configuration.
//!
//! [`AgentConfig`] gathers every choice needed to assemble an [`Agent`] and
//! the environment it acts in:
//! - **internal**: which belief engine, and its prior
//! - **action**: behaviour, action grid, policy and value function
//! - **perception**: optional noisy perception of the model parameters
//!
//! `Default` reproduces the reference parameterization used in the
//! experiments. With the `serde` feature the configuration deserializes from
//! JSON; missing fields fall back to their defaults.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::engine::action::{
    ActionGrid, ActionSettings, ActionState, Behaviour, EpsilonGreedy, ExperienceValues,
    HardHorizon, Knowledge, Policy, SoftHorizon, Softmax, TreeSearch, TreeSearchValues,
    ValueFunction,
};
use crate::engine::agent::Agent;
use crate::engine::environment::OuNetwork;
use crate::engine::errors::CoreError;
use crate::engine::internal::{
    sample_perceived_parameters, ContinuousInternalState, DiscreteInternalState,
    DiscreteUpdateRule, InternalStateKind, LocalComputations, MeanFieldConfig,
    MeanFieldInternalState, Normative,
};
use crate::engine::sensory::SensoryState;
use crate::engine::space::{num_links, validate_link_values, HypothesisSpace};
use crate::engine::types::Dynamics;

/// Seed streams derived from [`AgentConfig::seed`].
const ENVIRONMENT_STREAM: u64 = 0;
const ACTION_STREAM: u64 = 1;
const BELIEF_STREAM: u64 = 2;

/// Belief engine selection.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum InternalConfig {
    /// Factorized per-link update, each link scored against its effect alone.
    LocalComputations,
    /// Joint update over every graph in the hypothesis space.
    Normative,
    /// Conjugate Normal per link.
    Continuous {
        /// Prior standard deviation under a flat prior.
        prior_sd: f64,
    },
    /// Mean-field variational posterior over links, drift and noise.
    MeanField(MeanFieldConfig),
}

/// Prior over link values.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum PriorConfig {
    Flat,
    /// Peaked at the participant's prior judgement:
    /// `p(v) ∝ exp(-temperature · |v - judged|)`.
    Empirical { temperature: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum PolicyConfig {
    Softmax { temperature: f64 },
    EpsilonGreedy { epsilon: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum SearchConfig {
    HardHorizon { depth: usize },
    SoftHorizon {
        discount: f64,
        horizon: f64,
        max_depth: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum ValueFunctionConfig {
    TreeSearch {
        /// Graph samples `C` per planning step.
        samples: usize,
        knowledge: Knowledge,
        search: SearchConfig,
    },
    Experience {
        /// Starting value of every action.
        initial: f64,
    },
}

/// Action-state part of the configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ActionConfig {
    pub behaviour: Behaviour,
    /// Values a variable can be set to.
    pub values: Vec<f64>,
    /// Steps a planned action is held.
    pub action_len: usize,
    /// Entropy (bits) under which a late-trial actor stops intervening.
    pub certainty_threshold: f64,
    pub policy: PolicyConfig,
    pub value_function: ValueFunctionConfig,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            behaviour: Behaviour::Actor,
            values: (-10..=10).map(|i| f64::from(i) * 10.0).collect(),
            action_len: 5,
            certainty_threshold: 1e-2,
            policy: PolicyConfig::Softmax { temperature: 1.0 },
            value_function: ValueFunctionConfig::TreeSearch {
                samples: 3,
                knowledge: Knowledge::Posterior,
                search: SearchConfig::HardHorizon { depth: 1 },
            },
        }
    }
}

impl ActionConfig {
    fn validate(&self) -> Result<(), CoreError> {
        if self.values.is_empty() || self.values.iter().any(|v| !v.is_finite()) {
            return Err(CoreError::Validation(
                "AgentConfig: action values must be a non-empty set of finite numbers".into(),
            ));
        }
        if self.action_len == 0 {
            return Err(CoreError::Validation("AgentConfig: action_len must be >= 1".into()));
        }
        if !(self.certainty_threshold.is_finite() && self.certainty_threshold >= 0.0) {
            return Err(CoreError::Validation(
                "AgentConfig: certainty_threshold must be finite and >= 0".into(),
            ));
        }
        self.policy()?;
        if let ValueFunctionConfig::TreeSearch {
            samples, search, ..
        } = &self.value_function
        {
            if *samples == 0 {
                return Err(CoreError::Validation("AgentConfig: samples must be >= 1".into()));
            }
            search.build()?;
        }
        Ok(())
    }

    fn policy(&self) -> Result<Arc<dyn Policy>, CoreError> {
        Ok(match self.policy {
            PolicyConfig::Softmax { temperature } => Arc::new(Softmax::new(temperature)?),
            PolicyConfig::EpsilonGreedy { epsilon } => Arc::new(EpsilonGreedy::new(epsilon)?),
        })
    }

    fn value_function(&self, num_actions: usize) -> Result<ValueFunction, CoreError> {
        Ok(match &self.value_function {
            ValueFunctionConfig::TreeSearch {
                samples,
                knowledge,
                search,
            } => ValueFunction::TreeSearch(TreeSearchValues::new(
                *samples,
                knowledge.clone(),
                search.build()?,
            )?),
            ValueFunctionConfig::Experience { initial } => {
                ValueFunction::Experience(ExperienceValues::new(num_actions, *initial))
            }
        })
    }
}

impl SearchConfig {
    fn build(&self) -> Result<Arc<dyn TreeSearch>, CoreError> {
        Ok(match *self {
            SearchConfig::HardHorizon { depth } => Arc::new(HardHorizon::new(depth)?),
            SearchConfig::SoftHorizon {
                discount,
                horizon,
                max_depth,
            } => Arc::new(SoftHorizon::new(discount, horizon, max_depth)?),
        })
    }
}

/// Everything needed to build an agent and its environment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AgentConfig {
    /// Candidate link strengths.
    pub link_values: Vec<f64>,
    /// True dynamics of the environment, and the agent's belief about them
    /// unless `sample_params` is set.
    pub dynamics: Dynamics,
    pub internal: InternalConfig,
    pub prior: PriorConfig,
    /// Temperature pulling reported discrete posteriors toward their MAP.
    pub smoothing: f64,
    pub action: ActionConfig,
    /// Draw perceived drift, noise and link magnitudes around the true ones.
    pub sample_params: bool,
    pub seed: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            link_values: vec![-1.0, -0.5, 0.0, 0.5, 1.0],
            dynamics: Dynamics::new(0.2, 0.5, 3.0),
            internal: InternalConfig::LocalComputations,
            prior: PriorConfig::Flat,
            smoothing: 0.0,
            action: ActionConfig::default(),
            sample_params: false,
            seed: 0,
        }
    }
}

impl AgentConfig {
    /// Rejects settings that no agent could be built from.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_link_values(&self.link_values)?;
        self.dynamics.validate()?;
        if !(self.smoothing.is_finite() && self.smoothing >= 0.0) {
            return Err(CoreError::Validation(
                "AgentConfig: smoothing must be finite and >= 0".into(),
            ));
        }
        match &self.internal {
            InternalConfig::Continuous { prior_sd } if !(prior_sd.is_finite() && *prior_sd > 0.0) => {
                return Err(CoreError::Validation(
                    "AgentConfig: continuous prior_sd must be finite and > 0".into(),
                ));
            }
            InternalConfig::MeanField(mean_field) => mean_field.validate()?,
            _ => {}
        }
        if let PriorConfig::Empirical { temperature } = self.prior {
            if !(temperature.is_finite() && temperature >= 0.0) {
                return Err(CoreError::Validation(
                    "AgentConfig: empirical prior temperature must be finite and >= 0".into(),
                ));
            }
        }
        self.action.validate()
    }

    /// Seed of one independent random stream.
    pub fn stream_seed(&self, stream: u64) -> u64 {
        self.seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    /// Per-link prior rows over `link_values`.
    ///
    /// An empirical prior needs the participant's prior judgement (one value
    /// per link).
    pub fn link_prior(
        &self,
        num_variables: usize,
        prior_judgement: Option<&[f64]>,
    ) -> Result<Vec<Vec<f64>>, CoreError> {
        let s = num_links(num_variables);
        match self.prior {
            PriorConfig::Flat => Ok(vec![vec![1.0; self.link_values.len()]; s]),
            PriorConfig::Empirical { temperature } => {
                let judged = required_judgement(prior_judgement, s)?;
                Ok(judged
                    .iter()
                    .map(|&j| empirical_prior(&self.link_values, j, temperature))
                    .collect())
            }
        }
    }

    /// Builds an agent for a trial of `trial_len` steps over `num_variables`
    /// variables.
    pub fn build_agent(
        &self,
        trial_len: usize,
        num_variables: usize,
        prior_judgement: Option<&[f64]>,
    ) -> Result<Agent, CoreError> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.stream_seed(BELIEF_STREAM));

        let perceived = if self.sample_params {
            let (dynamics, links) =
                sample_perceived_parameters(&self.dynamics, &self.link_values, &mut rng)?;

            #[cfg(feature = "tracing")]
            debug!(theta = dynamics.theta, sigma = dynamics.sigma, links = ?links, "perceived parameters");

            Some((dynamics, links))
        } else {
            None
        };

        let internal = self.build_internal(trial_len, num_variables, prior_judgement, perceived, &mut rng)?;

        let grid = ActionGrid::new(num_variables, self.action.values.clone())?;
        let value_function = self.action.value_function(grid.num_actions())?;
        let action = ActionState::new(
            trial_len,
            grid,
            ActionSettings {
                behaviour: self.action.behaviour,
                action_len: self.action.action_len,
                certainty_threshold: self.action.certainty_threshold,
            },
            self.action.policy()?,
            value_function,
            self.stream_seed(ACTION_STREAM),
        )?;

        Agent::new(SensoryState::new(trial_len, num_variables), internal, action)
    }

    fn build_internal(
        &self,
        trial_len: usize,
        num_variables: usize,
        prior_judgement: Option<&[f64]>,
        perceived: Option<(Dynamics, Vec<f64>)>,
        rng: &mut StdRng,
    ) -> Result<InternalStateKind, CoreError> {
        let discrete = |rule: Arc<dyn DiscreteUpdateRule>| -> Result<InternalStateKind, CoreError> {
            let space = Arc::new(HypothesisSpace::new(num_variables, &self.link_values)?);
            let prior = self.link_prior(num_variables, prior_judgement)?;
            let mut state =
                DiscreteInternalState::new(trial_len, space, &prior, self.dynamics, rule, self.smoothing)?;
            if let Some((dynamics, links)) = perceived.clone() {
                state = state.with_perception(dynamics, links)?;
            }
            Ok(state.into())
        };

        match &self.internal {
            InternalConfig::LocalComputations => discrete(Arc::new(LocalComputations)),
            InternalConfig::Normative => discrete(Arc::new(Normative)),
            InternalConfig::Continuous { prior_sd } => {
                let s = num_links(num_variables);
                let (means, sd) = match self.prior {
                    PriorConfig::Flat => (vec![0.0; s], *prior_sd),
                    PriorConfig::Empirical { temperature } if temperature > 0.0 => {
                        (required_judgement(prior_judgement, s)?.to_vec(), temperature.recip())
                    }
                    PriorConfig::Empirical { .. } => {
                        (required_judgement(prior_judgement, s)?.to_vec(), *prior_sd)
                    }
                };
                let mut state = ContinuousInternalState::new(
                    trial_len,
                    num_variables,
                    &means,
                    sd,
                    self.dynamics,
                    &self.link_values,
                )?;
                if let Some((dynamics, _)) = &perceived {
                    state = state.with_perception(*dynamics)?;
                }
                Ok(state.into())
            }
            InternalConfig::MeanField(mean_field) => {
                let prior = self.link_prior(num_variables, prior_judgement)?;
                let state = MeanFieldInternalState::new(
                    trial_len,
                    num_variables,
                    &self.link_values,
                    &prior,
                    self.dynamics.dt,
                    mean_field,
                    rng,
                )?;
                Ok(state.into())
            }
        }
    }

    /// Builds the environment under the true structure `ground_truth`.
    pub fn build_environment(
        &self,
        trial_len: usize,
        num_variables: usize,
        ground_truth: &[f64],
    ) -> Result<OuNetwork, CoreError> {
        self.dynamics.validate()?;
        OuNetwork::new(
            trial_len,
            num_variables,
            ground_truth,
            self.dynamics,
            self.stream_seed(ENVIRONMENT_STREAM),
        )
    }
}

fn required_judgement(judgement: Option<&[f64]>, num_links: usize) -> Result<&[f64], CoreError> {
    let judged = judgement.ok_or_else(|| {
        CoreError::Validation("AgentConfig: empirical prior requires a prior judgement".into())
    })?;
    if judged.len() != num_links {
        return Err(CoreError::shape("prior judgement", num_links, judged.len()));
    }
    if judged.iter().any(|v| !v.is_finite()) {
        return Err(CoreError::Numerical("prior judgement must be finite".into()));
    }
    Ok(judged)
}

/// Normalized `exp(-temperature · |v - judged|)` over `values`.
pub fn empirical_prior(values: &[f64], judged: f64, temperature: f64) -> Vec<f64> {
    let weights: Vec<f64> = values
        .iter()
        .map(|v| (-temperature * (v - judged).abs()).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.iter().map(|w| w / total).collect()
}
