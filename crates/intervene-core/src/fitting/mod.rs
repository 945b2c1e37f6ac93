//! Fitting harness: scores recorded trials under an agent configuration.
//!
//! - [`fit_trial`]: replays one trial and returns its [`FitSummary`]
//! - [`fit_trials`]: fits a batch (in parallel with the `parallel` feature);
//!   trials that fail to load are logged and skipped
//! - [`aggregate_log_likelihood`]: sums trial log-likelihoods, excluding and
//!   counting non-finite ones
//! - [`sweep`]: repeats a batch fit across a grid of one scalar parameter

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use rustc_hash::FxHashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, InternalConfig, PolicyConfig};
use crate::engine::action::ActionData;
use crate::engine::errors::CoreError;
use crate::engine::experiment::{Experiment, FitSummary, RunSummary};
use crate::engine::internal::InternalState;
use crate::engine::space::num_links;

/// One recorded trial.
///
/// `data` holds the observed values for steps `0..=N`. Actions are indexed by
/// frame like `data`; the intervened value of `actions[n]` is read from
/// `action_values[n]`, or from `data[n]` when no separate values are recorded.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrialData {
    pub participant: String,
    pub data: Vec<Vec<f64>>,
    pub ground_truth: Vec<f64>,
    pub actions: Vec<Option<usize>>,
    /// Actions to score; defaults to `actions`.
    pub actions_fit: Option<Vec<Option<usize>>>,
    pub action_values: Option<Vec<Vec<f64>>>,
    /// Per-step slider moves, one row per transition.
    pub partial_judgements: Option<Vec<Vec<Option<f64>>>>,
    pub final_judgement: Option<Vec<f64>>,
    pub prior_judgement: Option<Vec<f64>>,
}

impl TrialData {
    /// Trial length `N`.
    pub fn trial_len(&self) -> usize {
        self.data.len().saturating_sub(1)
    }

    pub fn num_variables(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    /// Converts a generative run into a recorded trial. The agent's final MAP
    /// graph stands in for the final judgement.
    pub fn from_run(run: &RunSummary, participant: impl Into<String>) -> Self {
        let mut actions: Vec<Option<usize>> =
            run.interventions.iter().map(|iv| iv.map(|iv| iv.variable)).collect();
        actions.push(None);
        let mut values = run.trajectory.clone();
        for (row, iv) in values.iter_mut().zip(&run.interventions) {
            if let Some(iv) = iv {
                row[iv.variable] = iv.value;
            }
        }
        Self {
            participant: participant.into(),
            data: run.trajectory.clone(),
            ground_truth: run.ground_truth.clone(),
            actions,
            actions_fit: None,
            action_values: Some(values),
            partial_judgements: None,
            final_judgement: Some(run.map.clone()),
            prior_judgement: None,
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.data.len() < 2 {
            return Err(CoreError::Validation("trial needs at least two frames".into()));
        }
        let k = self.num_variables();
        if k < 2 {
            return Err(CoreError::Validation("trial needs at least two variables".into()));
        }
        if self.ground_truth.len() != num_links(k) {
            return Err(CoreError::shape("ground truth", num_links(k), self.ground_truth.len()));
        }
        Ok(())
    }
}

/// Result of one fitted trial within a batch.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialFit {
    /// Position of the trial in the batch.
    pub index: usize,
    pub participant: String,
    pub summary: FitSummary,
}

/// Fitted trials plus the ones that could not be fitted.
#[derive(Debug, Clone, Default)]
pub struct FitBatch {
    pub fits: Vec<TrialFit>,
    pub failed: Vec<(usize, CoreError)>,
}

/// Replays `trial` under `config`, scoring the recorded actions and, when
/// present, the judgements.
pub fn fit_trial(config: &AgentConfig, trial: &TrialData) -> Result<FitSummary, CoreError> {
    trial.validate()?;
    let n = trial.trial_len();
    let k = trial.num_variables();

    let mut agent = config.build_agent(n, k, trial.prior_judgement.as_deref())?;
    agent.action_mut().load_action_data(ActionData {
        actions: trial.actions.clone(),
        actions_fit: trial
            .actions_fit
            .clone()
            .unwrap_or_else(|| trial.actions.clone()),
        values: trial
            .action_values
            .clone()
            .unwrap_or_else(|| trial.data.clone()),
    })?;
    if let Some(final_judgement) = &trial.final_judgement {
        let partial = trial
            .partial_judgements
            .clone()
            .unwrap_or_else(|| vec![vec![None; num_links(k)]; n]);
        agent
            .internal_mut()
            .load_judgement_data(partial, final_judgement.clone())?;
    }

    let mut env = config.build_environment(n, k, &trial.ground_truth)?;
    env.load_trial_data(trial.data.clone())?;

    let summary = Experiment::new(agent, env)?.fit()?;

    #[cfg(feature = "tracing")]
    debug!(
        participant = %trial.participant,
        action = summary.action_log_likelihood,
        judgement = ?summary.judgement_log_likelihood,
        "trial fitted"
    );

    Ok(summary)
}

/// Fits every trial. Trials that fail are reported in [`FitBatch::failed`]
/// and do not stop the others.
pub fn fit_trials(config: &AgentConfig, trials: &[TrialData]) -> FitBatch {
    let fit_one = |(index, trial): (usize, &TrialData)| {
        fit_trial(config, trial).map(|summary| TrialFit {
            index,
            participant: trial.participant.clone(),
            summary,
        })
        .map_err(|err| (index, err))
    };

    #[cfg(feature = "parallel")]
    let results: Vec<_> = trials.par_iter().enumerate().map(fit_one).collect();
    #[cfg(not(feature = "parallel"))]
    let results: Vec<_> = trials.iter().enumerate().map(fit_one).collect();

    let mut batch = FitBatch::default();
    for result in results {
        match result {
            Ok(fit) => batch.fits.push(fit),
            Err((index, err)) => {
                #[cfg(feature = "tracing")]
                warn!(trial = index, error = %err, "skipping trial");
                batch.failed.push((index, err));
            }
        }
    }
    batch
}

/// Per-participant share of an [`Aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParticipantTotal {
    pub log_likelihood: f64,
    pub trials: usize,
    pub excluded: usize,
}

/// Summed log-likelihood over a batch.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Aggregate {
    pub log_likelihood: f64,
    pub included: usize,
    /// Trials whose log-likelihood was `-inf` or NaN.
    pub excluded: usize,
    pub participants: FxHashMap<String, ParticipantTotal>,
}

/// Sums [`FitSummary::total`] across fits. Non-finite totals are left out of
/// the sums and counted in `excluded`.
pub fn aggregate_log_likelihood(fits: &[TrialFit]) -> Aggregate {
    let mut aggregate = Aggregate::default();
    for fit in fits {
        let total = fit.summary.total();
        let participant = aggregate
            .participants
            .entry(fit.participant.clone())
            .or_default();
        if total.is_finite() {
            aggregate.log_likelihood += total;
            aggregate.included += 1;
            participant.log_likelihood += total;
            participant.trials += 1;
        } else {
            #[cfg(feature = "tracing")]
            debug!(trial = fit.index, participant = %fit.participant, total, "excluding non-finite trial");
            aggregate.excluded += 1;
            participant.excluded += 1;
        }
    }
    aggregate
}

/// Scalar parameter varied by [`sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SweepParameter {
    /// Posterior smoothing temperature.
    Smoothing,
    /// Softmax policy temperature.
    Temperature,
    /// Drift rate.
    Theta,
    /// Diffusion noise.
    Sigma,
}

impl SweepParameter {
    /// Copy of `config` with this parameter set to `value`.
    pub fn apply(self, config: &AgentConfig, value: f64) -> Result<AgentConfig, CoreError> {
        let mut config = config.clone();
        match self {
            SweepParameter::Smoothing => {
                if !matches!(
                    config.internal,
                    InternalConfig::LocalComputations | InternalConfig::Normative
                ) {
                    return Err(CoreError::Validation(
                        "smoothing only applies to discrete internal states".into(),
                    ));
                }
                config.smoothing = value;
            }
            SweepParameter::Temperature => match &mut config.action.policy {
                PolicyConfig::Softmax { temperature } => *temperature = value,
                PolicyConfig::EpsilonGreedy { .. } => {
                    return Err(CoreError::Validation(
                        "temperature sweep requires a softmax policy".into(),
                    ))
                }
            },
            SweepParameter::Theta => config.dynamics.theta = value,
            SweepParameter::Sigma => config.dynamics.sigma = value,
        }
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Display for SweepParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepParameter::Smoothing => "smoothing",
            SweepParameter::Temperature => "temperature",
            SweepParameter::Theta => "theta",
            SweepParameter::Sigma => "sigma",
        };
        f.write_str(name)
    }
}

impl FromStr for SweepParameter {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smoothing" => Ok(SweepParameter::Smoothing),
            "temperature" => Ok(SweepParameter::Temperature),
            "theta" => Ok(SweepParameter::Theta),
            "sigma" => Ok(SweepParameter::Sigma),
            other => Err(CoreError::Validation(format!("unknown sweep parameter '{}'", other))),
        }
    }
}

/// Aggregate at one grid point.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SweepPoint {
    pub value: f64,
    pub aggregate: Aggregate,
    /// Trials that could not be fitted at this value.
    pub failed: usize,
}

/// Fits all trials once per value of `parameter` in `grid`.
pub fn sweep(
    config: &AgentConfig,
    trials: &[TrialData],
    parameter: SweepParameter,
    grid: &[f64],
) -> Result<Vec<SweepPoint>, CoreError> {
    grid.iter()
        .map(|&value| {
            let point_config = parameter.apply(config, value)?;
            let batch = fit_trials(&point_config, trials);
            let aggregate = aggregate_log_likelihood(&batch.fits);

            #[cfg(feature = "tracing")]
            info!(%parameter, value, log_likelihood = aggregate.log_likelihood, "sweep point");

            Ok(SweepPoint {
                value,
                aggregate,
                failed: batch.failed.len(),
            })
        })
        .collect()
}
