//! Internal states: the agent's beliefs about the causal structure.
//!
//! Three engines share one contract ([`InternalState`]):
//! - [`DiscreteInternalState`]: explicit table over the hypothesis space,
//!   either joint (one weight per graph) or factorized per link
//! - [`ContinuousInternalState`]: independent conjugate Normal per link
//! - [`MeanFieldInternalState`]: mean-field variational posterior over link
//!   strengths, drift and noise
//!
//! Shared bookkeeping (time counter, per-step snapshots, rollback, judgement
//! scoring) lives in [`BeliefCore`], embedded by each engine.

pub mod continuous;
pub mod discrete;
pub mod mean_field;

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Gamma};

use crate::engine::errors::CoreError;
use crate::engine::history::{LikelihoodLedger, StepHistory};
use crate::engine::types::{Dynamics, Intervention, Percept};

pub use continuous::{ContinuousInternalState, GaussianPosterior};
pub use discrete::{
    DiscreteInternalState, DiscreteUpdateRule, LocalComputations, Normative, PosteriorLayout,
};
pub use mean_field::{FactorKind, MeanFieldConfig, MeanFieldInternalState};

/// Where a hypothetical causal graph is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphSource {
    /// The current posterior.
    Posterior,
    /// Uniformly over the representable graphs.
    Uniform,
}

/// Contract every belief engine satisfies.
pub trait InternalState {
    /// Current step.
    fn n(&self) -> usize;

    /// Trial length `N`.
    fn trial_len(&self) -> usize;

    fn num_variables(&self) -> usize;

    /// Incorporates one transition. Returns the judgement log-probability
    /// scored at this step when judgement data is loaded, `None` otherwise.
    fn update(
        &mut self,
        percept: &Percept,
        intervention: Option<&Intervention>,
    ) -> Result<Option<f64>, CoreError>;

    /// Enables fitting mode: subsequent updates score the recorded judgements.
    ///
    /// `partial` has one row per step (`N` rows) and one column per link;
    /// `final_judgement` has one entry per link.
    fn load_judgement_data(
        &mut self,
        partial: Vec<Vec<Option<f64>>>,
        final_judgement: Vec<f64>,
    ) -> Result<(), CoreError>;

    /// Restores the belief state `back` steps earlier; resets to the prior when
    /// not enough history is available.
    fn rollback(&mut self, back: usize);

    /// Entropy (bits) of the posterior as reported to planners.
    fn posterior_entropy(&self) -> f64;

    /// Entropy (bits) of the posterior before any smoothing.
    fn posterior_entropy_unsmoothed(&self) -> f64;

    fn prior_entropy(&self) -> f64;

    /// Posterior entropy for every step `0..=n`.
    fn entropy_history(&self) -> Vec<f64>;

    /// One probability row per link over the link-value grid.
    fn posterior_over_links(&self) -> Vec<Vec<f64>>;

    /// Most probable graph as a link vector.
    fn map(&self) -> Vec<f64>;

    /// Log-probability (or log-density) that `link` has `value`.
    fn link_log_probability(&self, link: usize, value: f64) -> f64;

    /// Draws a hypothetical graph (link vector).
    fn sample_graph(&self, source: GraphSource, rng: &mut StdRng) -> Vec<f64>;

    /// Accumulated judgement log-likelihood, when fitting.
    fn log_likelihood(&self) -> Option<f64>;

    /// Scratch copy for simulated rollouts: same current beliefs, no judgement
    /// data, history reduced to the current step.
    fn fork(&self) -> Self
    where
        Self: Sized;
}

/// Closed set of belief engines an agent can carry.
#[derive(Debug, Clone)]
pub enum InternalStateKind {
    Discrete(DiscreteInternalState),
    Continuous(ContinuousInternalState),
    MeanField(MeanFieldInternalState),
}

impl From<DiscreteInternalState> for InternalStateKind {
    fn from(state: DiscreteInternalState) -> Self {
        InternalStateKind::Discrete(state)
    }
}

impl From<ContinuousInternalState> for InternalStateKind {
    fn from(state: ContinuousInternalState) -> Self {
        InternalStateKind::Continuous(state)
    }
}

impl From<MeanFieldInternalState> for InternalStateKind {
    fn from(state: MeanFieldInternalState) -> Self {
        InternalStateKind::MeanField(state)
    }
}

impl InternalStateKind {
    pub fn as_discrete(&self) -> Option<&DiscreteInternalState> {
        match self {
            InternalStateKind::Discrete(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_mean_field(&self) -> Option<&MeanFieldInternalState> {
        match self {
            InternalStateKind::MeanField(s) => Some(s),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InternalStateKind::Discrete(s) => match s.layout() {
                PosteriorLayout::PerLink => "local_computations",
                PosteriorLayout::Joint => "normative",
            },
            InternalStateKind::Continuous(_) => "continuous",
            InternalStateKind::MeanField(_) => "mean_field",
        }
    }
}

impl InternalState for InternalStateKind {
    fn n(&self) -> usize {
        match self {
            InternalStateKind::Discrete(s) => s.n(),
            InternalStateKind::Continuous(s) => s.n(),
            InternalStateKind::MeanField(s) => s.n(),
        }
    }

    fn trial_len(&self) -> usize {
        match self {
            InternalStateKind::Discrete(s) => s.trial_len(),
            InternalStateKind::Continuous(s) => s.trial_len(),
            InternalStateKind::MeanField(s) => s.trial_len(),
        }
    }

    fn num_variables(&self) -> usize {
        match self {
            InternalStateKind::Discrete(s) => s.num_variables(),
            InternalStateKind::Continuous(s) => s.num_variables(),
            InternalStateKind::MeanField(s) => s.num_variables(),
        }
    }

    fn update(
        &mut self,
        percept: &Percept,
        intervention: Option<&Intervention>,
    ) -> Result<Option<f64>, CoreError> {
        match self {
            InternalStateKind::Discrete(s) => s.update(percept, intervention),
            InternalStateKind::Continuous(s) => s.update(percept, intervention),
            InternalStateKind::MeanField(s) => s.update(percept, intervention),
        }
    }

    fn load_judgement_data(
        &mut self,
        partial: Vec<Vec<Option<f64>>>,
        final_judgement: Vec<f64>,
    ) -> Result<(), CoreError> {
        match self {
            InternalStateKind::Discrete(s) => s.load_judgement_data(partial, final_judgement),
            InternalStateKind::Continuous(s) => s.load_judgement_data(partial, final_judgement),
            InternalStateKind::MeanField(s) => s.load_judgement_data(partial, final_judgement),
        }
    }

    fn rollback(&mut self, back: usize) {
        match self {
            InternalStateKind::Discrete(s) => s.rollback(back),
            InternalStateKind::Continuous(s) => s.rollback(back),
            InternalStateKind::MeanField(s) => s.rollback(back),
        }
    }

    fn posterior_entropy(&self) -> f64 {
        match self {
            InternalStateKind::Discrete(s) => s.posterior_entropy(),
            InternalStateKind::Continuous(s) => s.posterior_entropy(),
            InternalStateKind::MeanField(s) => s.posterior_entropy(),
        }
    }

    fn posterior_entropy_unsmoothed(&self) -> f64 {
        match self {
            InternalStateKind::Discrete(s) => s.posterior_entropy_unsmoothed(),
            InternalStateKind::Continuous(s) => s.posterior_entropy_unsmoothed(),
            InternalStateKind::MeanField(s) => s.posterior_entropy_unsmoothed(),
        }
    }

    fn prior_entropy(&self) -> f64 {
        match self {
            InternalStateKind::Discrete(s) => s.prior_entropy(),
            InternalStateKind::Continuous(s) => s.prior_entropy(),
            InternalStateKind::MeanField(s) => s.prior_entropy(),
        }
    }

    fn entropy_history(&self) -> Vec<f64> {
        match self {
            InternalStateKind::Discrete(s) => s.entropy_history(),
            InternalStateKind::Continuous(s) => s.entropy_history(),
            InternalStateKind::MeanField(s) => s.entropy_history(),
        }
    }

    fn posterior_over_links(&self) -> Vec<Vec<f64>> {
        match self {
            InternalStateKind::Discrete(s) => s.posterior_over_links(),
            InternalStateKind::Continuous(s) => s.posterior_over_links(),
            InternalStateKind::MeanField(s) => s.posterior_over_links(),
        }
    }

    fn map(&self) -> Vec<f64> {
        match self {
            InternalStateKind::Discrete(s) => s.map(),
            InternalStateKind::Continuous(s) => s.map(),
            InternalStateKind::MeanField(s) => s.map(),
        }
    }

    fn link_log_probability(&self, link: usize, value: f64) -> f64 {
        match self {
            InternalStateKind::Discrete(s) => s.link_log_probability(link, value),
            InternalStateKind::Continuous(s) => s.link_log_probability(link, value),
            InternalStateKind::MeanField(s) => s.link_log_probability(link, value),
        }
    }

    fn sample_graph(&self, source: GraphSource, rng: &mut StdRng) -> Vec<f64> {
        match self {
            InternalStateKind::Discrete(s) => s.sample_graph(source, rng),
            InternalStateKind::Continuous(s) => s.sample_graph(source, rng),
            InternalStateKind::MeanField(s) => s.sample_graph(source, rng),
        }
    }

    fn log_likelihood(&self) -> Option<f64> {
        match self {
            InternalStateKind::Discrete(s) => s.log_likelihood(),
            InternalStateKind::Continuous(s) => s.log_likelihood(),
            InternalStateKind::MeanField(s) => s.log_likelihood(),
        }
    }

    fn fork(&self) -> Self {
        match self {
            InternalStateKind::Discrete(s) => InternalStateKind::Discrete(s.fork()),
            InternalStateKind::Continuous(s) => InternalStateKind::Continuous(s.fork()),
            InternalStateKind::MeanField(s) => InternalStateKind::MeanField(s.fork()),
        }
    }
}

/// Time counter, posterior snapshots and judgement scoring shared by engines.
///
/// Snapshot `history[t]` holds the posterior parameters at step `t` for every
/// `t <= n`, so rolling back is a lookup rather than a recomputation.
#[derive(Debug, Clone)]
pub struct BeliefCore<P> {
    trial_len: usize,
    num_variables: usize,
    n: usize,
    prior: P,
    current: P,
    history: StepHistory<P>,
    judgements: Option<JudgementLedger>,
}

impl<P: Clone> BeliefCore<P> {
    pub fn new(trial_len: usize, num_variables: usize, prior: P) -> Self {
        let mut history = StepHistory::new(trial_len);
        history.record(0, prior.clone());
        Self {
            trial_len,
            num_variables,
            n: 0,
            current: prior.clone(),
            prior,
            history,
            judgements: None,
        }
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

    pub fn current(&self) -> &P {
        &self.current
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    pub fn history(&self) -> &StepHistory<P> {
        &self.history
    }

    /// Snapshots for steps `0..=n` that are still defined.
    pub fn snapshots(&self) -> impl Iterator<Item = &P> {
        self.history.prefix(self.n)
    }

    /// Moves to step `n + 1` with new posterior parameters.
    pub fn advance(&mut self, next: P) -> Result<(), CoreError> {
        if self.n >= self.trial_len {
            return Err(CoreError::Validation(format!(
                "belief state already holds all {} steps",
                self.trial_len
            )));
        }
        self.n += 1;
        self.history.record(self.n, next.clone());
        self.current = next;
        Ok(())
    }

    pub fn rollback(&mut self, back: usize) {
        if back > self.trial_len || back > self.n {
            self.reset();
            return;
        }
        let target = self.n - back;
        match self.history.get(target).cloned() {
            Some(snapshot) => {
                self.n = target;
                self.current = snapshot;
                self.history.clear_after(target);
                if let Some(ledger) = self.judgements.as_mut() {
                    ledger.rewind(target, self.trial_len);
                }
            }
            None => self.reset(),
        }
    }

    /// Back to the prior at step 0; every later snapshot is undefined.
    pub fn reset(&mut self) {
        self.n = 0;
        self.current = self.prior.clone();
        self.history.clear();
        self.history.record(0, self.prior.clone());
        if let Some(ledger) = self.judgements.as_mut() {
            ledger.rewind(0, self.trial_len);
        }
    }

    /// Replaces the prior and restarts from it.
    pub fn set_prior(&mut self, prior: P) {
        self.prior = prior;
        self.reset();
    }

    pub fn fork(&self) -> Self {
        Self {
            trial_len: self.trial_len,
            num_variables: self.num_variables,
            n: self.n,
            prior: self.prior.clone(),
            current: self.current.clone(),
            history: self.history.fork_at(self.n),
            judgements: None,
        }
    }

    pub fn load_judgements(
        &mut self,
        num_links: usize,
        partial: Vec<Vec<Option<f64>>>,
        final_judgement: Vec<f64>,
    ) -> Result<(), CoreError> {
        self.judgements = Some(JudgementLedger::new(
            self.trial_len,
            num_links,
            partial,
            final_judgement,
        )?);
        Ok(())
    }

    pub fn is_realised(&self) -> bool {
        self.judgements.is_some()
    }

    pub fn log_likelihood(&self) -> Option<f64> {
        self.judgements.as_ref().map(|j| j.total())
    }

    pub fn judgements(&self) -> Option<&JudgementLedger> {
        self.judgements.as_ref()
    }

    pub(crate) fn take_judgements(&mut self) -> Option<JudgementLedger> {
        self.judgements.take()
    }

    pub(crate) fn restore_judgements(&mut self, ledger: Option<JudgementLedger>) {
        self.judgements = ledger;
    }
}

/// Recorded judgements of a participant and the running score against them.
#[derive(Debug, Clone)]
pub struct JudgementLedger {
    partial: Vec<Vec<Option<f64>>>,
    final_judgement: Vec<f64>,
    current: Vec<Option<f64>>,
    ledger: LikelihoodLedger,
}

impl JudgementLedger {
    pub fn new(
        trial_len: usize,
        num_links: usize,
        partial: Vec<Vec<Option<f64>>>,
        final_judgement: Vec<f64>,
    ) -> Result<Self, CoreError> {
        if partial.len() != trial_len {
            return Err(CoreError::shape("judgement rows", trial_len, partial.len()));
        }
        if let Some(row) = partial.iter().find(|r| r.len() != num_links) {
            return Err(CoreError::shape("judgement columns", num_links, row.len()));
        }
        if final_judgement.len() != num_links {
            return Err(CoreError::shape("final judgement", num_links, final_judgement.len()));
        }
        Ok(Self {
            partial,
            final_judgement,
            current: vec![None; num_links],
            ledger: LikelihoodLedger::new(trial_len),
        })
    }

    pub fn total(&self) -> f64 {
        self.ledger.total()
    }

    pub fn ledger(&self) -> &LikelihoodLedger {
        &self.ledger
    }

    /// Slider positions after the judgements scored so far.
    pub fn current(&self) -> &[Option<f64>] {
        &self.current
    }

    /// Scores the judgement made during the transition into step `n` (`n >= 1`).
    ///
    /// A partial judgement is the first recorded link of row `n - 1`. At the
    /// last step, every link whose slider differs from the final judgement is
    /// scored against it.
    pub fn score<F>(&mut self, n: usize, trial_len: usize, log_prob: F) -> f64
    where
        F: Fn(usize, f64) -> f64,
    {
        let mut total = 0.0;
        let judged = self
            .partial
            .get(n.wrapping_sub(1))
            .and_then(|row| row.iter().enumerate().find_map(|(s, v)| v.map(|v| (s, v))));

        if let Some((link, value)) = judged {
            total = log_prob(link, value);
            self.current[link] = Some(value);
        } else if n == trial_len {
            for link in 0..self.final_judgement.len() {
                let value = self.final_judgement[link];
                if self.current[link] != Some(value) {
                    total += log_prob(link, value);
                    self.current[link] = Some(value);
                }
            }
        }

        self.ledger.accumulate(n, total);
        total
    }

    fn rewind(&mut self, n: usize, trial_len: usize) {
        self.ledger.rewind(n);
        self.current.iter_mut().for_each(|c| *c = None);
        for row in self.partial.iter().take(n) {
            if let Some((link, value)) = row.iter().enumerate().find_map(|(s, v)| v.map(|v| (s, v))) {
                self.current[link] = Some(value);
            }
        }
        if n >= trial_len {
            for (c, &v) in self.current.iter_mut().zip(&self.final_judgement) {
                *c = Some(v);
            }
        }
    }
}

/// Perceived model parameters drawn around the true ones.
///
/// Each positive quantity `x` is replaced by a draw from `Gamma(100·x, 1/100)`
/// (mean `x`, small spread); negative link strengths are mirrored and zero
/// stays zero.
pub fn sample_perceived_parameters(
    dynamics: &Dynamics,
    link_values: &[f64],
    rng: &mut StdRng,
) -> Result<(Dynamics, Vec<f64>), CoreError> {
    let theta = perceive(dynamics.theta, rng)?;
    let sigma = perceive(dynamics.sigma, rng)?;
    let links = link_values
        .iter()
        .map(|&l| perceive(l.abs(), rng).map(|m| m.copysign(l)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((Dynamics::new(dynamics.dt, theta, sigma), links))
}

fn perceive<R: Rng>(value: f64, rng: &mut R) -> Result<f64, CoreError> {
    if value == 0.0 {
        return Ok(0.0);
    }
    let gamma = Gamma::new(100.0 * value, 1.0 / 100.0)
        .map_err(|e| CoreError::Numerical(format!("perception gamma for {}: {}", value, e)))?;
    Ok(gamma.sample(rng))
}

/// Normalizes a prior over link values; rows must be finite, non-negative and
/// carry some mass.
pub(crate) fn normalize_link_prior(
    prior: &[Vec<f64>],
    num_links: usize,
    num_values: usize,
) -> Result<Vec<Vec<f64>>, CoreError> {
    if prior.len() != num_links {
        return Err(CoreError::shape("prior rows", num_links, prior.len()));
    }
    prior
        .iter()
        .map(|row| {
            if row.len() != num_values {
                return Err(CoreError::shape("prior columns", num_values, row.len()));
            }
            if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(CoreError::Validation(
                    "prior probabilities must be finite and non-negative".into(),
                ));
            }
            let total: f64 = row.iter().sum();
            if total <= 0.0 {
                return Err(CoreError::Validation("prior row has no mass".into()));
            }
            Ok(row.iter().map(|p| p / total).collect())
        })
        .collect()
}

/// Index of the most probable value; ties go to the smaller strength, then the
/// smaller index.
pub(crate) fn parsimonious_argmax<F>(probs: &[f64], strength: F) -> usize
where
    F: Fn(usize) -> f64,
{
    let mut best = 0;
    for i in 1..probs.len() {
        let better = probs[i] > probs[best]
            || (probs[i] == probs[best] && strength(i) < strength(best));
        if better {
            best = i;
        }
    }
    best
}
