//! Continuous internal state: one conjugate Normal posterior per link.
//!
//! Each link `i -> j` is treated as the only cause of `j`, which makes the
//! transition linear in the link strength:
//!
//! ```text
//! y = x[j] − x'[j] − (self_decay(x'[j]) − x'[j])·dt·θ
//! a = x'[i]·dt·θ
//! y ~ N(a·l, σ²·dt)
//! ```
//!
//! so `x = y / a` is an observation of `l` with precision `a² / (σ²·dt)`.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{BeliefCore, GraphSource, InternalState};
use crate::engine::errors::CoreError;
use crate::engine::numeric_kernels::{normal_log_pdf, normalize_log_probabilities};
use crate::engine::space::{link_endpoints, num_links, validate_link_values};
use crate::engine::types::{self_decay, Dynamics, Intervention, Percept};

/// Smallest regressor magnitude that still carries information about a link.
const MIN_REGRESSOR: f64 = 1e-9;

/// Floor on posterior precision.
const MIN_PRECISION: f64 = 1e-12;

/// Normal posterior in precision parameterization (`τ = 1/σ²`).
///
/// Conjugate update: `τ' = τ + τ_obs`, `μ' = (τ·μ + τ_obs·x) / τ'`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GaussianPosterior {
    pub mean: f64,
    pub precision: f64,
}

impl GaussianPosterior {
    pub fn from_sd(mean: f64, sd: f64) -> Self {
        Self {
            mean,
            precision: (1.0 / (sd * sd)).max(MIN_PRECISION),
        }
    }

    pub fn update(&mut self, x: f64, tau_obs: f64) {
        let tau_new = (self.precision + tau_obs).max(MIN_PRECISION);
        self.mean = (self.precision * self.mean + tau_obs * x) / tau_new;
        self.precision = tau_new;
    }

    pub fn variance(&self) -> f64 {
        1.0 / self.precision
    }

    pub fn sd(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Differential entropy in bits.
    pub fn entropy_bits(&self) -> f64 {
        0.5 * (2.0 * std::f64::consts::PI * std::f64::consts::E * self.variance()).log2()
    }

    pub fn log_pdf(&self, value: f64) -> f64 {
        normal_log_pdf(value, self.mean, self.sd())
    }
}

#[derive(Debug, Clone)]
pub struct ContinuousInternalState {
    core: BeliefCore<Vec<GaussianPosterior>>,
    dynamics: Dynamics,
    link_values: Vec<f64>,
}

impl ContinuousInternalState {
    /// `prior_means` has one entry per link; every link starts with `prior_sd`.
    ///
    /// `link_values` is the grid used for discretized read-outs.
    pub fn new(
        trial_len: usize,
        num_variables: usize,
        prior_means: &[f64],
        prior_sd: f64,
        dynamics: Dynamics,
        link_values: &[f64],
    ) -> Result<Self, CoreError> {
        dynamics.validate()?;
        validate_link_values(link_values)?;
        let expected = num_links(num_variables);
        if num_variables < 2 {
            return Err(CoreError::Validation("need at least two variables".into()));
        }
        if prior_means.len() != expected {
            return Err(CoreError::shape("prior means", expected, prior_means.len()));
        }
        if !(prior_sd.is_finite() && prior_sd > 0.0) {
            return Err(CoreError::Validation(format!("prior sd must be > 0, got {}", prior_sd)));
        }
        let prior = prior_means
            .iter()
            .map(|&m| GaussianPosterior::from_sd(m, prior_sd))
            .collect();
        Ok(Self {
            core: BeliefCore::new(trial_len, num_variables, prior),
            dynamics,
            link_values: link_values.to_vec(),
        })
    }

    pub fn with_perception(mut self, dynamics: Dynamics) -> Result<Self, CoreError> {
        dynamics.validate()?;
        self.dynamics = dynamics;
        Ok(self)
    }

    pub fn links(&self) -> &[GaussianPosterior] {
        self.core.current()
    }

    pub fn dynamics(&self) -> &Dynamics {
        &self.dynamics
    }
}

fn entropy(links: &[GaussianPosterior]) -> f64 {
    links.iter().map(GaussianPosterior::entropy_bits).sum()
}

impl InternalState for ContinuousInternalState {
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
        let k = self.num_variables();
        if percept.num_variables() != k {
            return Err(CoreError::shape("percept", k, percept.num_variables()));
        }
        let prev = &percept.previous;
        let cur = &percept.current;
        let rate = self.dynamics.dt * self.dynamics.theta;
        let noise_precision = 1.0 / (self.dynamics.sigma.powi(2) * self.dynamics.dt);

        let mut next = self.core.current().clone();
        for (link, posterior) in next.iter_mut().enumerate() {
            let (i, j) = link_endpoints(k, link);
            if intervention.is_some_and(|iv| iv.variable == j) {
                continue;
            }
            let a = prev[i] * rate;
            if a.abs() < MIN_REGRESSOR {
                continue;
            }
            let y = cur[j] - prev[j] - (self_decay(prev[j]) - prev[j]) * rate;
            posterior.update(y / a, a * a * noise_precision);
        }
        self.core.advance(next)?;

        let Some(mut ledger) = self.core.take_judgements() else {
            return Ok(None);
        };
        let lp = ledger.score(self.core.n(), self.core.trial_len(), |link, value| {
            self.link_log_probability(link, value)
        });
        self.core.restore_judgements(Some(ledger));
        Ok(Some(lp))
    }

    fn load_judgement_data(
        &mut self,
        partial: Vec<Vec<Option<f64>>>,
        final_judgement: Vec<f64>,
    ) -> Result<(), CoreError> {
        let s = num_links(self.num_variables());
        self.core.load_judgements(s, partial, final_judgement)
    }

    fn rollback(&mut self, back: usize) {
        self.core.rollback(back);
    }

    fn posterior_entropy(&self) -> f64 {
        entropy(self.core.current())
    }

    fn posterior_entropy_unsmoothed(&self) -> f64 {
        self.posterior_entropy()
    }

    fn prior_entropy(&self) -> f64 {
        entropy(self.core.prior())
    }

    fn entropy_history(&self) -> Vec<f64> {
        self.core.snapshots().map(|links| entropy(links)).collect()
    }

    fn posterior_over_links(&self) -> Vec<Vec<f64>> {
        self.core
            .current()
            .iter()
            .map(|p| {
                let log_density: Vec<f64> = self.link_values.iter().map(|&v| p.log_pdf(v)).collect();
                normalize_log_probabilities(&log_density)
            })
            .collect()
    }

    fn map(&self) -> Vec<f64> {
        self.core.current().iter().map(|p| p.mean).collect()
    }

    fn link_log_probability(&self, link: usize, value: f64) -> f64 {
        self.core
            .current()
            .get(link)
            .map_or(f64::NEG_INFINITY, |p| p.log_pdf(value))
    }

    fn sample_graph(&self, source: GraphSource, rng: &mut StdRng) -> Vec<f64> {
        let lo = self.link_values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = self.link_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        self.core
            .current()
            .iter()
            .map(|p| match source {
                GraphSource::Posterior => Normal::new(p.mean, p.sd())
                    .map(|d| d.sample(rng))
                    .unwrap_or(p.mean),
                GraphSource::Uniform if hi > lo => rng.random_range(lo..=hi),
                GraphSource::Uniform => lo,
            })
            .collect()
    }

    fn log_likelihood(&self) -> Option<f64> {
        self.core.log_likelihood()
    }

    fn fork(&self) -> Self {
        Self {
            core: self.core.fork(),
            dynamics: self.dynamics,
            link_values: self.link_values.clone(),
        }
    }
}
