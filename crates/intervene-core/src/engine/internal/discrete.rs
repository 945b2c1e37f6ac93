//! Discrete internal state: explicit log-weights over a finite hypothesis set.
//!
//! The posterior is stored as unnormalized log-weights, one row per factor:
//! - [`PosteriorLayout::Joint`]: a single row over every hypothesis graph
//! - [`PosteriorLayout::PerLink`]: one row per link over the link-value grid
//!
//! The update rule is a strategy object ([`DiscreteUpdateRule`]) so new rules
//! plug in without touching the bookkeeping. Read-outs normalize rows with a
//! max-shifted softmax and optionally apply MAP-ward smoothing
//! ([`smooth_toward_map`]) before reporting.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

#[cfg(feature = "tracing")]
use tracing::trace;

use super::{normalize_link_prior, parsimonious_argmax, BeliefCore, GraphSource, InternalState};
use crate::engine::errors::CoreError;
use crate::engine::numeric_kernels::{
    entropy_bits, normal_log_pdf, normalize_log_probabilities, sample_categorical,
    smooth_toward_map, total_entropy_bits,
};
use crate::engine::space::{link_endpoints, link_position, HypothesisSpace};
use crate::engine::types::{self_decay, Dynamics, Intervention, Percept};

/// Unnormalized log-weights, one row per posterior factor.
pub type LogWeights = Vec<Vec<f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosteriorLayout {
    /// One row over all hypotheses.
    Joint,
    /// One row per link over link values.
    PerLink,
}

/// Inputs an update rule may read besides the percept.
#[derive(Debug, Clone, Copy)]
pub struct UpdateContext<'a> {
    pub space: &'a HypothesisSpace,
    /// Perceived dynamics.
    pub dynamics: &'a Dynamics,
    /// Perceived strength of each entry of the link-value grid.
    pub link_strengths: &'a [f64],
}

/// Maps `(posterior, percept, intervention)` to the next posterior.
pub trait DiscreteUpdateRule: fmt::Debug + Send + Sync {
    fn layout(&self) -> PosteriorLayout;

    fn update(
        &self,
        ctx: &UpdateContext<'_>,
        posterior: &LogWeights,
        percept: &Percept,
        intervention: Option<&Intervention>,
    ) -> LogWeights;
}

/// Per-link approximation: each link is scored as if it were the only cause of
/// its effect.
///
/// For link `i -> j` and candidate strength `l`, the transition is scored by
/// `logN(x[j]; μ_l, σ·sqrt(dt))` with
/// `μ_l = x'[j] + (l·x'[i] + self_decay(x'[j]) − x'[j])·dt·θ`, where `x'` is
/// the previous step. The row is normalized before its log is added, so each
/// link receives a bounded update. Links into an intervened variable are left
/// untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComputations;

impl DiscreteUpdateRule for LocalComputations {
    fn layout(&self) -> PosteriorLayout {
        PosteriorLayout::PerLink
    }

    fn update(
        &self,
        ctx: &UpdateContext<'_>,
        posterior: &LogWeights,
        percept: &Percept,
        intervention: Option<&Intervention>,
    ) -> LogWeights {
        let k = percept.num_variables();
        let prev = &percept.previous;
        let cur = &percept.current;
        let sd = ctx.dynamics.step_sd();
        let rate = ctx.dynamics.dt * ctx.dynamics.theta;

        let mut next = posterior.clone();
        for (link, row) in next.iter_mut().enumerate() {
            let (i, j) = link_endpoints(k, link);
            if intervention.is_some_and(|iv| iv.variable == j) {
                continue;
            }
            let decay = self_decay(prev[j]) - prev[j];
            let log_lik: Vec<f64> = ctx
                .link_strengths
                .iter()
                .map(|&l| {
                    let mu = prev[j] + (l * prev[i] + decay) * rate;
                    normal_log_pdf(cur[j], mu, sd)
                })
                .collect();
            for (w, p) in row.iter_mut().zip(normalize_log_probabilities(&log_lik)) {
                *w += p.ln();
            }
        }
        next
    }
}

/// Exact Bayesian update over the joint hypothesis space.
///
/// Every hypothesis is scored by the product over non-intervened variables of
/// the Gaussian transition density under its full causal matrix. The row is
/// shifted so its maximum is zero after each update.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normative;

impl DiscreteUpdateRule for Normative {
    fn layout(&self) -> PosteriorLayout {
        PosteriorLayout::Joint
    }

    fn update(
        &self,
        ctx: &UpdateContext<'_>,
        posterior: &LogWeights,
        percept: &Percept,
        intervention: Option<&Intervention>,
    ) -> LogWeights {
        let k = percept.num_variables();
        let prev = &percept.previous;
        let cur = &percept.current;
        let sd = ctx.dynamics.step_sd();
        let rate = ctx.dynamics.dt * ctx.dynamics.theta;
        let effects: Vec<usize> = (0..k)
            .filter(|&j| !intervention.is_some_and(|iv| iv.variable == j))
            .collect();

        let mut row = posterior.first().cloned().unwrap_or_default();
        for (h, w) in row.iter_mut().enumerate() {
            let indices = ctx.space.indices(h);
            let log_lik: f64 = effects
                .iter()
                .map(|&j| {
                    let drive: f64 = (0..k)
                        .filter(|&i| i != j)
                        .map(|i| ctx.link_strengths[indices[link_position(k, i, j)] as usize] * prev[i])
                        .sum();
                    let mu = prev[j] + (drive + self_decay(prev[j]) - prev[j]) * rate;
                    normal_log_pdf(cur[j], mu, sd)
                })
                .sum();
            *w += log_lik;
        }

        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max.is_finite() {
            row.iter_mut().for_each(|w| *w -= max);
        }
        vec![row]
    }
}

/// Belief engine over an explicit, finite hypothesis space.
#[derive(Debug, Clone)]
pub struct DiscreteInternalState {
    core: BeliefCore<LogWeights>,
    space: Arc<HypothesisSpace>,
    rule: Arc<dyn DiscreteUpdateRule>,
    dynamics: Dynamics,
    link_strengths: Vec<f64>,
    smoothing: f64,
}

impl DiscreteInternalState {
    /// Builds the engine from a per-link prior (`S` rows over the link grid).
    ///
    /// Joint layouts take the product of the per-link priors. Prior rows are
    /// renormalized; zero entries become `-inf` log-weights.
    pub fn new(
        trial_len: usize,
        space: Arc<HypothesisSpace>,
        link_prior: &[Vec<f64>],
        dynamics: Dynamics,
        rule: Arc<dyn DiscreteUpdateRule>,
        smoothing: f64,
    ) -> Result<Self, CoreError> {
        dynamics.validate()?;
        if !(smoothing.is_finite() && smoothing >= 0.0) {
            return Err(CoreError::Validation(format!(
                "smoothing temperature must be >= 0, got {}",
                smoothing
            )));
        }
        let prior = Self::log_prior(&space, rule.layout(), link_prior)?;
        Ok(Self {
            core: BeliefCore::new(trial_len, space.num_variables(), prior),
            link_strengths: space.link_values().to_vec(),
            space,
            rule,
            dynamics,
            smoothing,
        })
    }

    fn log_prior(
        space: &HypothesisSpace,
        layout: PosteriorLayout,
        link_prior: &[Vec<f64>],
    ) -> Result<LogWeights, CoreError> {
        let rows = normalize_link_prior(link_prior, space.num_links(), space.link_values().len())?;
        let log_rows = match layout {
            PosteriorLayout::PerLink => rows
                .iter()
                .map(|row| row.iter().map(|p| p.ln()).collect())
                .collect(),
            PosteriorLayout::Joint => {
                vec![space.links_to_models(&rows).iter().map(|p| p.ln()).collect()]
            }
        };
        Ok(log_rows)
    }

    /// Replaces the perceived dynamics and link strengths used by updates.
    pub fn with_perception(mut self, dynamics: Dynamics, link_strengths: Vec<f64>) -> Result<Self, CoreError> {
        dynamics.validate()?;
        if link_strengths.len() != self.space.link_values().len() {
            return Err(CoreError::shape(
                "perceived link strengths",
                self.space.link_values().len(),
                link_strengths.len(),
            ));
        }
        self.dynamics = dynamics;
        self.link_strengths = link_strengths;
        Ok(self)
    }

    /// Replaces the prior (per-link rows) and restarts from step 0.
    pub fn set_link_prior(&mut self, link_prior: &[Vec<f64>]) -> Result<(), CoreError> {
        let prior = Self::log_prior(&self.space, self.rule.layout(), link_prior)?;
        self.core.set_prior(prior);
        Ok(())
    }

    pub fn layout(&self) -> PosteriorLayout {
        self.rule.layout()
    }

    pub fn space(&self) -> &HypothesisSpace {
        &self.space
    }

    pub fn dynamics(&self) -> &Dynamics {
        &self.dynamics
    }

    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    pub fn core(&self) -> &BeliefCore<LogWeights> {
        &self.core
    }

    /// Raw log-weights at the current step.
    pub fn log_weights(&self) -> &LogWeights {
        self.core.current()
    }

    /// Normalized rows without smoothing.
    pub fn posterior_unsmoothed(&self) -> Vec<Vec<f64>> {
        normalize_rows(self.core.current())
    }

    /// Normalized rows as reported to planners (smoothed when enabled).
    ///
    /// Joint posteriors are smoothed in link space and recombined.
    pub fn posterior(&self) -> Vec<Vec<f64>> {
        let rows = self.posterior_unsmoothed();
        if self.smoothing == 0.0 {
            return rows;
        }
        match self.layout() {
            PosteriorLayout::PerLink => smooth_toward_map(&rows, self.smoothing),
            PosteriorLayout::Joint => {
                let links = self.space.models_to_links(&rows[0]);
                let smoothed = smooth_toward_map(&links, self.smoothing);
                vec![self.space.links_to_models(&smoothed)]
            }
        }
    }

    /// Probability of every hypothesis.
    pub fn posterior_over_models(&self) -> Vec<f64> {
        let rows = self.posterior();
        match self.layout() {
            PosteriorLayout::Joint => rows.into_iter().next().unwrap_or_default(),
            PosteriorLayout::PerLink => self.space.links_to_models(&rows),
        }
    }

    /// Posterior probability of one whole graph, `None` if not representable.
    pub fn posterior_pmf(&self, graph: &[f64]) -> Option<f64> {
        let h = self.space.index_of(graph)?;
        match self.layout() {
            PosteriorLayout::Joint => self.posterior().first().map(|row| row[h]),
            PosteriorLayout::PerLink => {
                let rows = self.posterior();
                Some(
                    self.space
                        .indices(h)
                        .iter()
                        .enumerate()
                        .map(|(s, &k)| rows[s][k as usize])
                        .product(),
                )
            }
        }
    }

    /// Posterior probability that `link` has exactly `value`; zero off-grid.
    pub fn posterior_pmf_link(&self, link: usize, value: f64) -> f64 {
        match self.space.value_index(value) {
            Some(v) => self
                .posterior_over_links()
                .get(link)
                .map_or(0.0, |row| row[v]),
            None => 0.0,
        }
    }

    /// Index of a hypothesis drawn from `source`.
    pub fn sample_hypothesis(&self, source: GraphSource, rng: &mut StdRng) -> usize {
        match source {
            GraphSource::Uniform => rng.random_range(0..self.space.len()),
            GraphSource::Posterior => match self.layout() {
                PosteriorLayout::Joint => {
                    let rows = self.posterior();
                    rows.first().map_or(0, |row| sample_categorical(row, rng))
                }
                PosteriorLayout::PerLink => {
                    let base = self.space.link_values().len();
                    self.posterior()
                        .iter()
                        .fold(0, |h, row| h * base + sample_categorical(row, rng))
                }
            },
        }
    }

    fn row_entropy(&self, rows: &[Vec<f64>]) -> f64 {
        match self.layout() {
            PosteriorLayout::Joint => rows.first().map_or(0.0, |row| entropy_bits(row)),
            PosteriorLayout::PerLink => total_entropy_bits(rows),
        }
    }
}

impl InternalState for DiscreteInternalState {
    fn n(&self) -> usize {
        self.core.n()
    }

    fn trial_len(&self) -> usize {
        self.core.trial_len()
    }

    fn num_variables(&self) -> usize {
        self.core.num_variables()
    }

    fn update(
        &mut self,
        percept: &Percept,
        intervention: Option<&Intervention>,
    ) -> Result<Option<f64>, CoreError> {
        if percept.num_variables() != self.num_variables() {
            return Err(CoreError::shape("percept", self.num_variables(), percept.num_variables()));
        }
        let ctx = UpdateContext {
            space: &self.space,
            dynamics: &self.dynamics,
            link_strengths: &self.link_strengths,
        };
        let next = self.rule.update(&ctx, self.core.current(), percept, intervention);
        self.core.advance(next)?;

        #[cfg(feature = "tracing")]
        trace!(n = self.core.n(), entropy = self.posterior_entropy(), "discrete update");

        let ledger = self.core.take_judgements();
        let scored = ledger.map(|mut ledger| {
            let lp = ledger.score(self.core.n(), self.core.trial_len(), |link, value| {
                self.link_log_probability(link, value)
            });
            (ledger, lp)
        });
        Ok(match scored {
            Some((ledger, lp)) => {
                self.core.restore_judgements(Some(ledger));
                Some(lp)
            }
            None => None,
        })
    }

    fn load_judgement_data(
        &mut self,
        partial: Vec<Vec<Option<f64>>>,
        final_judgement: Vec<f64>,
    ) -> Result<(), CoreError> {
        self.core
            .load_judgements(self.space.num_links(), partial, final_judgement)
    }

    fn rollback(&mut self, back: usize) {
        self.core.rollback(back);
    }

    fn posterior_entropy(&self) -> f64 {
        self.row_entropy(&self.posterior())
    }

    fn posterior_entropy_unsmoothed(&self) -> f64 {
        self.row_entropy(&self.posterior_unsmoothed())
    }

    fn prior_entropy(&self) -> f64 {
        self.row_entropy(&normalize_rows(self.core.prior()))
    }

    fn entropy_history(&self) -> Vec<f64> {
        self.core
            .snapshots()
            .map(|weights| self.row_entropy(&normalize_rows(weights)))
            .collect()
    }

    fn posterior_over_links(&self) -> Vec<Vec<f64>> {
        let rows = self.posterior();
        match self.layout() {
            PosteriorLayout::PerLink => rows,
            PosteriorLayout::Joint => rows
                .first()
                .map(|row| self.space.models_to_links(row))
                .unwrap_or_default(),
        }
    }

    fn map(&self) -> Vec<f64> {
        let rows = self.posterior();
        let values = self.space.link_values();
        match self.layout() {
            PosteriorLayout::Joint => {
                let row = rows.first().map(Vec::as_slice).unwrap_or(&[]);
                let h = parsimonious_argmax(row, |h| self.space.total_strength(h));
                self.space.vector(h).to_vec()
            }
            PosteriorLayout::PerLink => rows
                .iter()
                .map(|row| values[parsimonious_argmax(row, |v| values[v].abs())])
                .collect(),
        }
    }

    fn link_log_probability(&self, link: usize, value: f64) -> f64 {
        self.posterior_pmf_link(link, value).ln()
    }

    fn sample_graph(&self, source: GraphSource, rng: &mut StdRng) -> Vec<f64> {
        let h = self.sample_hypothesis(source, rng);
        self.space.vector(h).to_vec()
    }

    fn log_likelihood(&self) -> Option<f64> {
        self.core.log_likelihood()
    }

    fn fork(&self) -> Self {
        Self {
            core: self.core.fork(),
            space: Arc::clone(&self.space),
            rule: Arc::clone(&self.rule),
            dynamics: self.dynamics,
            link_strengths: self.link_strengths.clone(),
            smoothing: self.smoothing,
        }
    }
}

fn normalize_rows(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    rows.iter().map(|row| normalize_log_probabilities(row)).collect()
}
