//! End-to-end scenarios in generative and replay mode.

use intervene_core::config::{
    ActionConfig, AgentConfig, InternalConfig, PolicyConfig, SearchConfig, ValueFunctionConfig,
};
use intervene_core::engine::action::{Behaviour, Knowledge};
use intervene_core::engine::internal::InternalState;
use intervene_core::{fit_trial, Intervention};
use intervene_tests::{
    assert_close, internal_variants, simulate, simulated_trial, single_link, test_config, Harness,
    TEST_ACTION_VALUES,
};

#[test]
fn flat_prior_map_is_the_empty_graph() {
    for (name, internal) in internal_variants() {
        let config = test_config(internal, Behaviour::Observer, 0);
        let agent = config.build_agent(10, 3, None).unwrap();
        assert_eq!(agent.internal().map(), vec![0.0; 6], "{}", name);
    }
}

#[test]
fn holding_the_cause_reveals_the_link() {
    let ground_truth = single_link(2, 0, 1, 1.0);
    let hold = Intervention::new(0, 80.0);

    for internal in [InternalConfig::LocalComputations, InternalConfig::Normative] {
        let config = test_config(internal, Behaviour::Observer, 11);
        let mut harness = Harness::new(&config, 30, 2, &ground_truth);
        for _ in 0..30 {
            harness.step(Some(hold));
        }
        // 1 -> 0 points into the held variable and stays at its flat prior.
        assert_eq!(harness.internal.map(), vec![1.0, 0.0]);
        assert!(harness.internal.posterior_entropy() < harness.internal.prior_entropy());
    }

    let config = test_config(InternalConfig::Continuous { prior_sd: 1e5 }, Behaviour::Observer, 11);
    let mut harness = Harness::new(&config, 30, 2, &ground_truth);
    for _ in 0..30 {
        harness.step(Some(hold));
    }
    let map = harness.internal.map();
    assert_close(map[0], 1.0, 0.25, "continuous 0 -> 1");
    assert_eq!(map[1], 0.0);
}

#[test]
fn generative_runs_are_reproducible_per_seed() {
    let ground_truth = single_link(3, 0, 2, -1.0);
    let config = test_config(InternalConfig::LocalComputations, Behaviour::Random, 5);

    let first = simulate(&config, 15, 3, &ground_truth);
    let second = simulate(&config, 15, 3, &ground_truth);
    assert_eq!(first, second);

    let other = simulate(&AgentConfig { seed: 6, ..config }, 15, 3, &ground_truth);
    assert_ne!(first.trajectory, other.trajectory);
}

#[test]
fn observers_never_intervene() {
    let config = test_config(InternalConfig::Normative, Behaviour::Observer, 2);
    let run = simulate(&config, 20, 2, &single_link(2, 1, 0, 0.5));
    assert!(run.interventions.iter().all(Option::is_none));
    assert_eq!(run.entropy_history.len(), 21);
}

#[test]
fn interventions_use_the_action_grid() {
    let config = test_config(InternalConfig::LocalComputations, Behaviour::Random, 8);
    let run = simulate(&config, 25, 3, &single_link(3, 0, 1, 1.0));
    for (n, iv) in run.interventions.iter().enumerate() {
        if let Some(iv) = iv {
            assert!(iv.variable < 3);
            assert!(TEST_ACTION_VALUES.contains(&iv.value));
            assert_eq!(run.trajectory[n + 1][iv.variable], iv.value);
        }
    }
}

#[test]
fn tree_search_actor_runs_and_refits_its_own_trial() {
    let config = AgentConfig {
        seed: 21,
        action: ActionConfig {
            behaviour: Behaviour::Actor,
            values: TEST_ACTION_VALUES.to_vec(),
            action_len: 2,
            policy: PolicyConfig::Softmax { temperature: 1.0 },
            value_function: ValueFunctionConfig::TreeSearch {
                samples: 2,
                knowledge: Knowledge::Posterior,
                search: SearchConfig::HardHorizon { depth: 1 },
            },
            ..ActionConfig::default()
        },
        ..AgentConfig::default()
    };
    let ground_truth = single_link(2, 0, 1, 1.0);
    let trial = simulated_trial(&config, 8, 2, &ground_truth);
    assert_eq!(trial.data.len(), 9);
    assert_eq!(trial.actions.len(), 9);

    let summary = fit_trial(&config, &trial).unwrap();
    assert_eq!(summary.steps.len(), 8);
    assert!(summary.action_log_likelihood <= 0.0);
    assert!(summary.action_log_likelihood.is_finite());
    for step in &summary.steps {
        assert!(step.action_log_probability <= 0.0);
    }
}

#[test]
fn replay_scores_every_variant() {
    let ground_truth = single_link(2, 0, 1, 0.5);
    let generator = test_config(InternalConfig::LocalComputations, Behaviour::Random, 13);
    let trial = simulated_trial(&generator, 12, 2, &ground_truth);

    for (name, internal) in internal_variants() {
        let config = test_config(internal, Behaviour::Random, 1);
        let summary = fit_trial(&config, &trial).unwrap();
        let uniform = -(5f64).ln() * 12.0;
        assert_close(summary.action_log_likelihood, uniform, 1e-9, name);
        let judgement = summary.judgement_log_likelihood.unwrap();
        assert!(!judgement.is_nan(), "{}: judgement score is NaN", name);
        assert_eq!(summary.map.len(), 2);
    }
}

#[test]
fn unscored_actions_contribute_nothing() {
    let generator = test_config(InternalConfig::LocalComputations, Behaviour::Random, 17);
    let mut trial = simulated_trial(&generator, 10, 2, &single_link(2, 0, 1, 1.0));
    trial.actions_fit = Some(vec![None; 11]);

    let config = test_config(InternalConfig::LocalComputations, Behaviour::Random, 0);
    let summary = fit_trial(&config, &trial).unwrap();

    let acted = trial.actions[..10].iter().filter(|a| a.is_some()).count();
    let expected = -(5f64).ln() * (10 - acted) as f64;
    assert_close(summary.action_log_likelihood, expected, 1e-9, "partially scored actions");
}

#[test]
fn empirical_prior_shapes_the_starting_beliefs() {
    let config = AgentConfig {
        prior: intervene_core::config::PriorConfig::Empirical { temperature: 3.0 },
        ..test_config(InternalConfig::LocalComputations, Behaviour::Observer, 0)
    };
    let agent = config.build_agent(10, 2, Some(&[1.0, -0.5])).unwrap();
    assert_eq!(agent.internal().map(), vec![1.0, -0.5]);
    assert!(agent.internal().prior_entropy() < 2.0 * (5f64).log2());
}
