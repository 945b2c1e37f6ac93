//! Shared fixtures for the integration tests.

use intervene_core::config::{ActionConfig, AgentConfig, InternalConfig, ValueFunctionConfig};
use intervene_core::engine::action::Behaviour;
use intervene_core::engine::environment::OuNetwork;
use intervene_core::engine::internal::{InternalState, InternalStateKind, MeanFieldConfig};
use intervene_core::engine::sensory::SensoryState;
use intervene_core::engine::space::{link_position, num_links};
use intervene_core::{Experiment, Intervention, RunSummary, TrialData};

/// Action values small enough to keep tree search cheap in tests.
pub const TEST_ACTION_VALUES: [f64; 2] = [-80.0, 80.0];

pub fn assert_close(actual: f64, expected: f64, tol: f64, label: &str) {
    assert!(
        (actual - expected).abs() <= tol,
        "{} mismatch: expected {:.15}, got {:.15}, diff={:.3e}",
        label,
        expected,
        actual,
        (actual - expected).abs()
    );
}

/// Link vector with `cause -> effect` set to `strength` and every other link 0.
pub fn single_link(num_variables: usize, cause: usize, effect: usize, strength: f64) -> Vec<f64> {
    let mut links = vec![0.0; num_links(num_variables)];
    links[link_position(num_variables, cause, effect)] = strength;
    links
}

/// Mean-field configuration with the drift and noise pinned to their true values.
pub fn pinned_mean_field() -> MeanFieldConfig {
    MeanFieldConfig {
        theta_values: vec![0.5],
        theta_prior: vec![1.0],
        sigma_values: vec![3.0],
        sigma_prior: vec![1.0],
        certainty_threshold: 0.1,
    }
}

/// Every internal-state variant, labelled.
pub fn internal_variants() -> Vec<(&'static str, InternalConfig)> {
    vec![
        ("local_computations", InternalConfig::LocalComputations),
        ("normative", InternalConfig::Normative),
        ("continuous", InternalConfig::Continuous { prior_sd: 1e5 }),
        ("mean_field", InternalConfig::MeanField(pinned_mean_field())),
    ]
}

/// Configuration with a cheap value function and the reduced action grid.
pub fn test_config(internal: InternalConfig, behaviour: Behaviour, seed: u64) -> AgentConfig {
    AgentConfig {
        internal,
        seed,
        action: ActionConfig {
            behaviour,
            values: TEST_ACTION_VALUES.to_vec(),
            value_function: ValueFunctionConfig::Experience { initial: 0.0 },
            ..ActionConfig::default()
        },
        ..AgentConfig::default()
    }
}

/// Runs one generative trial and returns its summary.
pub fn simulate(
    config: &AgentConfig,
    trial_len: usize,
    num_variables: usize,
    ground_truth: &[f64],
) -> RunSummary {
    let agent = config.build_agent(trial_len, num_variables, None).unwrap();
    let env = config
        .build_environment(trial_len, num_variables, ground_truth)
        .unwrap();
    Experiment::new(agent, env).unwrap().run().unwrap()
}

/// Simulates a trial and records it for fitting.
pub fn simulated_trial(
    config: &AgentConfig,
    trial_len: usize,
    num_variables: usize,
    ground_truth: &[f64],
) -> TrialData {
    TrialData::from_run(&simulate(config, trial_len, num_variables, ground_truth), "simulated")
}

/// Environment, senses and beliefs driven by hand, outside an agent.
pub struct Harness {
    pub env: OuNetwork,
    pub sensory: SensoryState,
    pub internal: InternalStateKind,
}

impl Harness {
    pub fn new(config: &AgentConfig, trial_len: usize, num_variables: usize, ground_truth: &[f64]) -> Self {
        let agent = config.build_agent(trial_len, num_variables, None).unwrap();
        Self {
            env: config
                .build_environment(trial_len, num_variables, ground_truth)
                .unwrap(),
            sensory: SensoryState::new(trial_len, num_variables),
            internal: agent.internal().clone(),
        }
    }

    /// Runs the environment one step, observes and updates beliefs.
    pub fn step(&mut self, intervention: Option<Intervention>) {
        self.env.run(intervention.as_ref()).unwrap();
        let percept = self.sensory.observe(&self.env);
        self.internal.update(percept, intervention.as_ref()).unwrap();
    }

    pub fn rollback(&mut self, back: usize) {
        self.env.rollback(back);
        self.sensory.rollback(back);
        self.internal.rollback(back);
    }
}
