//! Tree-search action values.
//!
//! Planning repeats `C` times: draw a hypothetical causal graph, fork the
//! environment under that graph together with scratch copies of the sensory
//! and internal states, and let a [`TreeSearch`] strategy explore action
//! sequences on the fork. Each leaf is scored by running local experiments
//! (simulate, observe, update) and measuring the entropy drop.
//!
//! Leaf values are averaged across the `C` samples with a running mean and
//! then summed per first action. With the `parallel` feature the samples run
//! on rayon workers; each draws from its own seeded generator and the running
//! mean is folded in sample order, so results do not depend on scheduling.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use smallvec::SmallVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::debug;

use super::ActionGrid;
use crate::engine::environment::OuNetwork;
use crate::engine::errors::CoreError;
use crate::engine::internal::{GraphSource, InternalState, InternalStateKind};
use crate::engine::numeric_kernels::incremental_mean;
use crate::engine::sensory::SensoryState;
use crate::engine::types::Intervention;

/// Flat action indices, first action first.
pub type ActionSequence = SmallVec<[usize; 4]>;

/// Source of the hypothetical graph used for each rollout sample.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Knowledge {
    /// Sample from the agent's current posterior.
    Posterior,
    /// Sample uniformly over graphs.
    Uniform,
    /// Use the environment's true structure.
    GroundTruth,
    /// Use a fixed link vector.
    Fixed(Vec<f64>),
}

/// Environment, senses and beliefs of one simulated rollout.
#[derive(Debug, Clone)]
pub struct RolloutState {
    pub env: OuNetwork,
    pub sensory: SensoryState,
    pub internal: InternalStateKind,
}

impl RolloutState {
    /// Holds `action` for up to `action_len` steps (fewer near the end of the
    /// trial) and returns `entropy_before − entropy_after`.
    pub fn run_local_experiment(
        &mut self,
        action: Option<&Intervention>,
        action_len: usize,
    ) -> Result<f64, CoreError> {
        let before = self.internal.posterior_entropy();
        let n = self.internal.n();
        let trial_len = self.internal.trial_len();
        let steps = if n + action_len >= trial_len {
            trial_len.saturating_sub(n)
        } else {
            action_len
        };
        for _ in 0..steps {
            self.env.run(action)?;
            let percept = self.sensory.observe(&self.env);
            self.internal.update(percept, action)?;
        }
        Ok(before - self.internal.posterior_entropy())
    }
}

/// Strategy exploring action sequences from a rollout root.
///
/// Implementations must return the same sequences, in the same order, for
/// every root with the same clock, so values can be averaged across samples.
pub trait TreeSearch: fmt::Debug + Send + Sync {
    fn search(
        &self,
        root: &RolloutState,
        grid: &ActionGrid,
        action_len: usize,
    ) -> Result<Vec<(ActionSequence, f64)>, CoreError>;
}

/// Every sequence of exactly `depth` actions, valued by its total entropy drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardHorizon {
    pub depth: usize,
}

impl HardHorizon {
    pub fn new(depth: usize) -> Result<Self, CoreError> {
        if depth == 0 {
            return Err(CoreError::Validation("tree search depth must be >= 1".into()));
        }
        Ok(Self { depth })
    }
}

impl TreeSearch for HardHorizon {
    fn search(
        &self,
        root: &RolloutState,
        grid: &ActionGrid,
        action_len: usize,
    ) -> Result<Vec<(ActionSequence, f64)>, CoreError> {
        let mut leaves = Vec::new();
        let mut prefix = ActionSequence::new();
        let level = Level {
            grid,
            action_len,
            discount: 1.0,
        };
        level.explore(root, self.depth, 1.0, 0.0, &mut prefix, &mut leaves)?;
        Ok(leaves)
    }
}

/// Discounted search: level `d` is weighted by `discount^d` and explored only
/// while `discount^d >= horizon`, up to `max_depth` levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftHorizon {
    pub discount: f64,
    pub horizon: f64,
    pub max_depth: usize,
}

impl SoftHorizon {
    pub fn new(discount: f64, horizon: f64, max_depth: usize) -> Result<Self, CoreError> {
        if !(discount > 0.0 && discount <= 1.0) {
            return Err(CoreError::Validation(format!("discount must be in (0, 1], got {}", discount)));
        }
        if !(horizon > 0.0 && horizon <= 1.0) {
            return Err(CoreError::Validation(format!("horizon must be in (0, 1], got {}", horizon)));
        }
        if max_depth == 0 {
            return Err(CoreError::Validation("tree search depth must be >= 1".into()));
        }
        Ok(Self {
            discount,
            horizon,
            max_depth,
        })
    }

    /// Number of levels explored.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        while depth < self.max_depth && self.discount.powi(depth as i32) >= self.horizon {
            depth += 1;
        }
        depth
    }
}

impl TreeSearch for SoftHorizon {
    fn search(
        &self,
        root: &RolloutState,
        grid: &ActionGrid,
        action_len: usize,
    ) -> Result<Vec<(ActionSequence, f64)>, CoreError> {
        let mut leaves = Vec::new();
        let mut prefix = ActionSequence::new();
        let level = Level {
            grid,
            action_len,
            discount: self.discount,
        };
        level.explore(root, self.depth(), 1.0, 0.0, &mut prefix, &mut leaves)?;
        Ok(leaves)
    }
}

struct Level<'a> {
    grid: &'a ActionGrid,
    action_len: usize,
    discount: f64,
}

impl Level<'_> {
    fn explore(
        &self,
        node: &RolloutState,
        depth: usize,
        weight: f64,
        acc: f64,
        prefix: &mut ActionSequence,
        leaves: &mut Vec<(ActionSequence, f64)>,
    ) -> Result<(), CoreError> {
        for action in 0..self.grid.num_actions() {
            let intervention = self.grid.remap(action)?;
            let mut child = node.clone();
            let gain = child.run_local_experiment(intervention.as_ref(), self.action_len)?;
            let value = acc + weight * gain;
            prefix.push(action);
            if depth <= 1 {
                leaves.push((prefix.clone(), value));
            } else {
                self.explore(&child, depth - 1, weight * self.discount, value, prefix, leaves)?;
            }
            prefix.pop();
        }
        Ok(())
    }
}

/// Result of one planning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningOutcome {
    /// Value per first action (flat index).
    pub values: Vec<f64>,
    /// Sample-averaged value per explored sequence.
    pub sequences: Vec<(ActionSequence, f64)>,
}

/// Monte-Carlo tree-search value function.
#[derive(Debug, Clone)]
pub struct TreeSearchValues {
    pub samples: usize,
    pub knowledge: Knowledge,
    pub search: Arc<dyn TreeSearch>,
}

impl TreeSearchValues {
    pub fn new(samples: usize, knowledge: Knowledge, search: Arc<dyn TreeSearch>) -> Result<Self, CoreError> {
        if samples == 0 {
            return Err(CoreError::Validation("tree search needs at least one graph sample".into()));
        }
        Ok(Self {
            samples,
            knowledge,
            search,
        })
    }

    pub fn action_values(
        &self,
        env: &OuNetwork,
        sensory: &SensoryState,
        internal: &InternalStateKind,
        grid: &ActionGrid,
        action_len: usize,
        seed: u64,
    ) -> Result<PlanningOutcome, CoreError> {
        let run = |c: usize| self.rollout(env, sensory, internal, grid, action_len, seed.wrapping_add(c as u64));

        #[cfg(feature = "parallel")]
        let per_sample: Vec<_> = (0..self.samples).into_par_iter().map(run).collect();
        #[cfg(not(feature = "parallel"))]
        let per_sample: Vec<_> = (0..self.samples).map(run).collect();

        let mut sequences: Vec<ActionSequence> = Vec::new();
        let mut mean: Vec<f64> = Vec::new();
        for (c, leaves) in per_sample.into_iter().enumerate() {
            let leaves = leaves?;
            let values: Vec<f64> = leaves.iter().map(|(_, v)| *v).collect();
            if c == 0 {
                sequences = leaves.into_iter().map(|(seq, _)| seq).collect();
                mean = values;
            } else if values.len() != mean.len() {
                return Err(CoreError::Internal(format!(
                    "rollout {} explored {} sequences, expected {}",
                    c,
                    values.len(),
                    mean.len()
                )));
            } else {
                incremental_mean(&mut mean, &values, c);
            }
        }

        let mut first_action = vec![0.0; grid.num_actions()];
        for (seq, v) in sequences.iter().zip(&mean) {
            if let Some(&a) = seq.first() {
                first_action[a] += v;
            }
        }

        Ok(PlanningOutcome {
            values: first_action,
            sequences: sequences.into_iter().zip(mean).collect(),
        })
    }

    fn rollout(
        &self,
        env: &OuNetwork,
        sensory: &SensoryState,
        internal: &InternalStateKind,
        grid: &ActionGrid,
        action_len: usize,
        seed: u64,
    ) -> Result<Vec<(ActionSequence, f64)>, CoreError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let graph = match &self.knowledge {
            Knowledge::Posterior => internal.sample_graph(GraphSource::Posterior, &mut rng),
            Knowledge::Uniform => internal.sample_graph(GraphSource::Uniform, &mut rng),
            Knowledge::GroundTruth => env.causal_vector(),
            Knowledge::Fixed(links) => links.clone(),
        };

        #[cfg(feature = "tracing")]
        debug!(n = internal.n(), ?graph, "rollout graph sampled");

        let root = RolloutState {
            env: env.fork(Some(&graph), rng.random())?,
            sensory: sensory.clone(),
            internal: internal.fork(),
        };
        self.search.search(&root, grid, action_len)
    }
}
