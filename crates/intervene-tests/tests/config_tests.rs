//! JSON configuration and trial files.

use intervene_core::config::{
    AgentConfig, InternalConfig, PolicyConfig, PriorConfig, SearchConfig, ValueFunctionConfig,
};
use intervene_core::engine::action::{Behaviour, Knowledge};
use intervene_core::{fit_trial, TrialData};
use intervene_tests::{simulated_trial, single_link, test_config};

#[test]
fn missing_fields_fall_back_to_defaults() {
    let config: AgentConfig = serde_json::from_str(r#"{ "seed": 7 }"#).unwrap();
    assert_eq!(config, AgentConfig { seed: 7, ..AgentConfig::default() });
}

#[test]
fn tagged_variants_deserialize() {
    let json = r#"{
        "internal": { "kind": "mean_field", "theta_values": [0.5], "theta_prior": [1.0],
                      "sigma_values": [3.0], "sigma_prior": [1.0], "certainty_threshold": 0.1 },
        "prior": { "kind": "empirical", "temperature": 2.5 },
        "smoothing": 1.5,
        "action": {
            "behaviour": "actor",
            "values": [-50, 50],
            "policy": { "kind": "epsilon_greedy", "epsilon": 0.2 },
            "value_function": {
                "kind": "tree_search",
                "samples": 4,
                "knowledge": { "fixed": [1.0, 0.0] },
                "search": { "kind": "soft_horizon", "discount": 0.5, "horizon": 0.2, "max_depth": 3 }
            }
        }
    }"#;
    let config: AgentConfig = serde_json::from_str(json).unwrap();
    assert!(matches!(config.internal, InternalConfig::MeanField(_)));
    assert_eq!(config.prior, PriorConfig::Empirical { temperature: 2.5 });
    assert_eq!(config.action.behaviour, Behaviour::Actor);
    assert_eq!(config.action.values, vec![-50.0, 50.0]);
    assert_eq!(config.action.action_len, 5);
    assert_eq!(config.action.policy, PolicyConfig::EpsilonGreedy { epsilon: 0.2 });
    assert_eq!(
        config.action.value_function,
        ValueFunctionConfig::TreeSearch {
            samples: 4,
            knowledge: Knowledge::Fixed(vec![1.0, 0.0]),
            search: SearchConfig::SoftHorizon {
                discount: 0.5,
                horizon: 0.2,
                max_depth: 3,
            },
        }
    );
    config.validate().unwrap();
}

#[test]
fn config_round_trips_through_json() {
    let config = AgentConfig {
        internal: InternalConfig::Continuous { prior_sd: 4.0 },
        ..AgentConfig::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    let back: AgentConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn trial_files_round_trip_and_fit() {
    let config = test_config(InternalConfig::LocalComputations, Behaviour::Random, 4);
    let trial = simulated_trial(&config, 10, 2, &single_link(2, 0, 1, 1.0));

    let json = serde_json::to_string(&vec![trial.clone()]).unwrap();
    let trials: Vec<TrialData> = serde_json::from_str(&json).unwrap();
    assert_eq!(trials, vec![trial.clone()]);

    let direct = fit_trial(&config, &trial).unwrap();
    let loaded = fit_trial(&config, &trials[0]).unwrap();
    assert_eq!(direct, loaded);
}

#[test]
fn minimal_trial_file_uses_data_as_action_values() {
    let json = r#"{
        "participant": "p7",
        "data": [[0, 0], [80, 1], [80, 9], [3, 12]],
        "ground_truth": [1, 0],
        "actions": [null, 0, null, null]
    }"#;
    let trial: TrialData = serde_json::from_str(json).unwrap();
    assert_eq!(trial.trial_len(), 3);
    assert!(trial.action_values.is_none());

    let config = test_config(InternalConfig::Normative, Behaviour::Random, 0);
    let summary = fit_trial(&config, &trial).unwrap();
    assert_eq!(summary.steps[1].action.map(|iv| iv.value), Some(80.0));
    assert!(summary.judgement_log_likelihood.is_none());
}
