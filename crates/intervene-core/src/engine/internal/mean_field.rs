//! Mean-field variational internal state.
//!
//! The joint posterior over drift `θ`, noise `σ` and every link strength is
//! approximated by a product of independent categorical factors:
//!
//! ```text
//! q(θ, σ, l_1..l_S) = q(θ) · q(σ) · Π_s q(l_s)
//! ```
//!
//! Factors are ordered `θ`, `σ`, then links in link-vector order. Each update
//! visits the scheduled factors in that order and, holding the others fixed,
//! adds to every candidate value the expected transition log-likelihood under
//! the current marginals of the factors it depends on (coordinate ascent, in
//! place). `θ` and `σ` are always visited; link factors follow a
//! certainty-gated schedule that swaps a factor out once its entropy drops
//! below the threshold and brings in the most uncertain one.

use rand::rngs::StdRng;
use rand::Rng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::debug;

use super::{normalize_link_prior, parsimonious_argmax, BeliefCore, GraphSource, InternalState};
use crate::engine::errors::CoreError;
use crate::engine::numeric_kernels::{
    argmax, entropy_bits, normal_log_pdf, normalize_log_probabilities, sample_categorical,
};
use crate::engine::space::{link_endpoints, link_position, num_links, validate_link_values};
use crate::engine::types::{Intervention, Percept};

const THETA: usize = 0;
const SIGMA: usize = 1;
const FIRST_LINK: usize = 2;

/// Grids and priors for the global factors.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeanFieldConfig {
    pub theta_values: Vec<f64>,
    pub theta_prior: Vec<f64>,
    pub sigma_values: Vec<f64>,
    pub sigma_prior: Vec<f64>,
    /// Entropy (bits) under which a factor counts as learned.
    pub certainty_threshold: f64,
}

impl Default for MeanFieldConfig {
    fn default() -> Self {
        Self {
            theta_values: vec![0.25, 0.5, 1.0],
            theta_prior: vec![1.0; 3],
            sigma_values: vec![1.0, 3.0, 6.0],
            sigma_prior: vec![1.0; 3],
            certainty_threshold: 1e-1,
        }
    }
}

impl MeanFieldConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_link_values(&self.theta_values)?;
        validate_link_values(&self.sigma_values)?;
        if self.theta_values.iter().any(|t| *t < 0.0) {
            return Err(CoreError::Validation("mean_field: theta values must be >= 0".into()));
        }
        if self.sigma_values.iter().any(|s| *s <= 0.0) {
            return Err(CoreError::Validation("mean_field: sigma values must be > 0".into()));
        }
        if self.theta_prior.len() != self.theta_values.len() {
            return Err(CoreError::shape("theta prior", self.theta_values.len(), self.theta_prior.len()));
        }
        if self.sigma_prior.len() != self.sigma_values.len() {
            return Err(CoreError::shape("sigma prior", self.sigma_values.len(), self.sigma_prior.len()));
        }
        if !(self.certainty_threshold.is_finite() && self.certainty_threshold >= 0.0) {
            return Err(CoreError::Validation(
                "mean_field: certainty threshold must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// What a factor stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FactorKind {
    Theta,
    Sigma,
    Link { cause: usize, effect: usize },
}

/// Posterior parameters at one step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeanFieldParams {
    /// Unnormalized log-weights per factor.
    pub factors: Vec<Vec<f64>>,
    /// Factors active in the current inference phase.
    pub schedule: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct MeanFieldInternalState {
    core: BeliefCore<MeanFieldParams>,
    /// Candidate values per factor, aligned with `MeanFieldParams::factors`.
    values: Vec<Vec<f64>>,
    dt: f64,
    certainty_threshold: f64,
    simulating: bool,
}

impl MeanFieldInternalState {
    /// `link_prior` has one row per link over `link_values`. The initial
    /// schedule holds one factor chosen uniformly with `rng`.
    pub fn new(
        trial_len: usize,
        num_variables: usize,
        link_values: &[f64],
        link_prior: &[Vec<f64>],
        dt: f64,
        config: &MeanFieldConfig,
        rng: &mut StdRng,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        validate_link_values(link_values)?;
        if num_variables < 2 {
            return Err(CoreError::Validation("need at least two variables".into()));
        }
        if !(dt.is_finite() && dt > 0.0) {
            return Err(CoreError::Validation(format!("dt must be > 0, got {}", dt)));
        }
        let s = num_links(num_variables);
        let links = normalize_link_prior(link_prior, s, link_values.len())?;
        let theta = normalize_link_prior(
            std::slice::from_ref(&config.theta_prior),
            1,
            config.theta_values.len(),
        )?;
        let sigma = normalize_link_prior(
            std::slice::from_ref(&config.sigma_prior),
            1,
            config.sigma_values.len(),
        )?;

        let factors: Vec<Vec<f64>> = theta
            .into_iter()
            .chain(sigma)
            .chain(links)
            .map(|row| row.iter().map(|p| p.ln()).collect())
            .collect();

        let mut values = vec![config.theta_values.clone(), config.sigma_values.clone()];
        values.extend(std::iter::repeat(link_values.to_vec()).take(s));

        let mut schedule = vec![false; factors.len()];
        schedule[rng.random_range(0..factors.len())] = true;

        Ok(Self {
            core: BeliefCore::new(trial_len, num_variables, MeanFieldParams { factors, schedule }),
            values,
            dt,
            certainty_threshold: config.certainty_threshold,
            simulating: false,
        })
    }

    pub fn num_factors(&self) -> usize {
        self.values.len()
    }

    pub fn factor_kind(&self, factor: usize) -> FactorKind {
        match factor {
            THETA => FactorKind::Theta,
            SIGMA => FactorKind::Sigma,
            f => {
                let (cause, effect) = link_endpoints(self.num_variables(), f - FIRST_LINK);
                FactorKind::Link { cause, effect }
            }
        }
    }

    pub fn params(&self) -> &MeanFieldParams {
        self.core.current()
    }

    pub fn schedule(&self) -> &[bool] {
        &self.core.current().schedule
    }

    /// Schedules recorded at steps `0..=n`.
    pub fn schedule_history(&self) -> Vec<Vec<bool>> {
        self.core.snapshots().map(|p| p.schedule.clone()).collect()
    }

    /// Normalized marginal of every factor.
    pub fn marginals(&self) -> Vec<Vec<f64>> {
        marginals(&self.core.current().factors)
    }

    pub fn factor_entropies(&self) -> Vec<f64> {
        self.marginals().iter().map(|q| entropy_bits(q)).collect()
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating
    }

    /// While simulating, the schedule is frozen.
    pub fn set_simulating(&mut self, simulating: bool) {
        self.simulating = simulating;
    }

    /// Expected log-density of the transition of `variable`, with factor
    /// `fixed.0` pinned to `fixed.1` and every other relevant factor
    /// marginalized under `q`.
    fn expected_log_likelihood(
        &self,
        q: &[Vec<f64>],
        fixed: (usize, f64),
        variable: usize,
        percept: &Percept,
    ) -> f64 {
        let k = self.num_variables();
        let mut relevant = vec![THETA, SIGMA];
        relevant.extend(
            (0..k)
                .filter(|&i| i != variable)
                .map(|i| FIRST_LINK + link_position(k, i, variable)),
        );

        let prev = &percept.previous;
        let delta = percept.current[variable] - prev[variable];
        let decay = -prev[variable] * prev[variable].abs() / 100.0;

        // Odometer over the joint support of the relevant factors.
        let supports: Vec<Vec<(f64, f64)>> = relevant
            .iter()
            .map(|&f| {
                if f == fixed.0 {
                    vec![(fixed.1, 1.0)]
                } else {
                    self.values[f]
                        .iter()
                        .copied()
                        .zip(q[f].iter().copied())
                        .filter(|(_, p)| *p > 0.0)
                        .collect()
                }
            })
            .collect();
        if supports.iter().any(Vec::is_empty) {
            return 0.0;
        }

        let mut cursor = vec![0usize; supports.len()];
        let mut expectation = 0.0;
        loop {
            let mut prob = 1.0;
            let mut drive = decay;
            for (slot, (&f, support)) in relevant.iter().zip(&supports).enumerate() {
                let (value, p) = support[cursor[slot]];
                prob *= p;
                if f >= FIRST_LINK {
                    let (cause, _) = link_endpoints(k, f - FIRST_LINK);
                    drive += value * prev[cause];
                }
            }
            let theta = supports[0][cursor[0]].0;
            let sigma = supports[1][cursor[1]].0;
            let mu = theta * drive * self.dt;
            expectation += prob * normal_log_pdf(delta, mu, sigma * self.dt.sqrt());

            let mut slot = supports.len();
            loop {
                if slot == 0 {
                    return expectation;
                }
                slot -= 1;
                cursor[slot] += 1;
                if cursor[slot] < supports[slot].len() {
                    break;
                }
                cursor[slot] = 0;
            }
        }
    }

    fn reset_schedule(&self, params: &mut MeanFieldParams) {
        let entropies: Vec<f64> = marginals(&params.factors).iter().map(|q| entropy_bits(q)).collect();
        let most_uncertain = argmax(&entropies);
        let active: Vec<usize> = (0..params.schedule.len()).filter(|&f| params.schedule[f]).collect();
        let certain: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&f| entropies[f] < self.certainty_threshold)
            .collect();

        let restart = match active.len() {
            0 => true,
            1 => !certain.is_empty(),
            n => certain.len() == n,
        };
        if restart {
            params.schedule.iter_mut().for_each(|s| *s = false);
            params.schedule[most_uncertain] = true;
            #[cfg(feature = "tracing")]
            debug!(factor = most_uncertain, "mean-field schedule restarted");
        } else {
            for f in certain {
                params.schedule[f] = false;
            }
        }
    }
}

fn marginals(factors: &[Vec<f64>]) -> Vec<Vec<f64>> {
    factors.iter().map(|row| normalize_log_probabilities(row)).collect()
}

fn link_entropy(params: &MeanFieldParams) -> f64 {
    params.factors[FIRST_LINK..]
        .iter()
        .map(|row| entropy_bits(&normalize_log_probabilities(row)))
        .sum()
}

impl InternalState for MeanFieldInternalState {
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
        let intervened = intervention.map(|iv| iv.variable);
        let mut params = self.core.current().clone();
        params.schedule[THETA] = true;
        params.schedule[SIGMA] = true;

        for f in 0..self.num_factors() {
            if !params.schedule[f] {
                continue;
            }
            let targets: Vec<usize> = match self.factor_kind(f) {
                FactorKind::Link { effect, .. } if Some(effect) == intervened => continue,
                FactorKind::Link { effect, .. } => vec![effect],
                FactorKind::Theta | FactorKind::Sigma => {
                    (0..k).filter(|&v| Some(v) != intervened).collect()
                }
            };
            let q = marginals(&params.factors);
            let gains: Vec<f64> = self.values[f]
                .iter()
                .map(|&candidate| {
                    targets
                        .iter()
                        .map(|&v| self.expected_log_likelihood(&q, (f, candidate), v, percept))
                        .sum()
                })
                .collect();
            for (w, g) in params.factors[f].iter_mut().zip(gains) {
                *w += g;
            }
        }

        if !self.simulating {
            self.reset_schedule(&mut params);
        }
        self.core.advance(params)?;

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
        link_entropy(self.core.current())
    }

    fn posterior_entropy_unsmoothed(&self) -> f64 {
        self.posterior_entropy()
    }

    fn prior_entropy(&self) -> f64 {
        link_entropy(self.core.prior())
    }

    fn entropy_history(&self) -> Vec<f64> {
        self.core.snapshots().map(link_entropy).collect()
    }

    fn posterior_over_links(&self) -> Vec<Vec<f64>> {
        marginals(&self.core.current().factors[FIRST_LINK..])
    }

    fn map(&self) -> Vec<f64> {
        self.posterior_over_links()
            .iter()
            .enumerate()
            .map(|(s, q)| {
                let values = &self.values[FIRST_LINK + s];
                values[parsimonious_argmax(q, |v| values[v].abs())]
            })
            .collect()
    }

    fn link_log_probability(&self, link: usize, value: f64) -> f64 {
        let Some(values) = self.values.get(FIRST_LINK + link) else {
            return f64::NEG_INFINITY;
        };
        match values.iter().position(|&v| v == value) {
            Some(i) => normalize_log_probabilities(&self.core.current().factors[FIRST_LINK + link])[i].ln(),
            None => f64::NEG_INFINITY,
        }
    }

    fn sample_graph(&self, source: GraphSource, rng: &mut StdRng) -> Vec<f64> {
        self.posterior_over_links()
            .iter()
            .enumerate()
            .map(|(s, q)| {
                let values = &self.values[FIRST_LINK + s];
                let i = match source {
                    GraphSource::Posterior => sample_categorical(q, rng),
                    GraphSource::Uniform => rng.random_range(0..values.len()),
                };
                values[i]
            })
            .collect()
    }

    fn log_likelihood(&self) -> Option<f64> {
        self.core.log_likelihood()
    }

    fn fork(&self) -> Self {
        Self {
            core: self.core.fork(),
            values: self.values.clone(),
            dt: self.dt,
            certainty_threshold: self.certainty_threshold,
            simulating: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::self_decay;
    use rand::SeedableRng;

    const LINKS: [f64; 5] = [-1.0, -0.5, 0.0, 0.5, 1.0];

    fn state(config: &MeanFieldConfig) -> MeanFieldInternalState {
        let mut rng = StdRng::seed_from_u64(4);
        MeanFieldInternalState::new(20, 2, &LINKS, &vec![vec![1.0; 5]; 2], 0.2, config, &mut rng).unwrap()
    }

    fn driven_percepts(steps: usize) -> Vec<Percept> {
        let (dt, theta) = (0.2, 0.5);
        let mut x = vec![80.0, 0.0];
        (0..steps)
            .map(|_| {
                let prev = x.clone();
                let next1 = prev[1] + (prev[0] + self_decay(prev[1]) - prev[1]) * dt * theta;
                x = vec![80.0, next1];
                Percept::new(x.clone(), prev)
            })
            .collect()
    }

    #[test]
    fn factor_layout() {
        let s = state(&MeanFieldConfig::default());
        assert_eq!(s.num_factors(), 4);
        assert_eq!(s.factor_kind(0), FactorKind::Theta);
        assert_eq!(s.factor_kind(1), FactorKind::Sigma);
        assert_eq!(s.factor_kind(2), FactorKind::Link { cause: 0, effect: 1 });
        assert_eq!(s.factor_kind(3), FactorKind::Link { cause: 1, effect: 0 });
        assert_eq!(s.schedule().iter().filter(|a| **a).count(), 1);
    }

    #[test]
    fn learns_scheduled_link() {
        let known_dynamics = MeanFieldConfig {
            theta_values: vec![0.5],
            theta_prior: vec![1.0],
            sigma_values: vec![3.0],
            sigma_prior: vec![1.0],
            ..MeanFieldConfig::default()
        };
        let mut s = state(&known_dynamics);
        s.core.current.schedule = vec![false, false, true, false];
        let iv = Intervention::new(0, 80.0);
        for p in driven_percepts(6) {
            s.update(&p, Some(&iv)).unwrap();
        }
        assert_eq!(s.map()[0], 1.0);
        assert!(s.posterior_entropy() < s.prior_entropy());
        // 1 -> 0 points into the intervened variable.
        let q = &s.posterior_over_links()[1];
        assert!(q.iter().all(|p| (p - 0.2).abs() < 1e-12));
    }

    #[test]
    fn schedule_swaps_certain_factors() {
        let config = MeanFieldConfig {
            certainty_threshold: 10.0,
            ..MeanFieldConfig::default()
        };
        let mut s = state(&config);
        s.update(&driven_percepts(1)[0], None).unwrap();
        // Every factor is below a threshold of 10 bits, so the schedule restarts
        // on the most uncertain factor alone.
        assert_eq!(s.schedule().iter().filter(|a| **a).count(), 1);
        assert_eq!(s.schedule_history().len(), 2);
    }

    #[test]
    fn simulating_freezes_schedule() {
        let s = state(&MeanFieldConfig::default());
        let mut scratch = s.fork();
        assert!(scratch.is_simulating());
        scratch.update(&driven_percepts(1)[0], None).unwrap();
        assert!(scratch.schedule()[THETA] && scratch.schedule()[SIGMA]);
    }

    #[test]
    fn rollback_restores_factors_and_schedule() {
        let mut s = state(&MeanFieldConfig::default());
        let percepts = driven_percepts(3);
        s.update(&percepts[0], None).unwrap();
        let snapshot = s.params().clone();
        s.update(&percepts[1], None).unwrap();
        s.update(&percepts[2], None).unwrap();
        s.rollback(2);
        assert_eq!(s.params(), &snapshot);
    }
}
