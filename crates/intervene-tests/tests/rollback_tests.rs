//! Rollback restores earlier states exactly and falls back to the prior when
//! history runs out.

use intervene_core::engine::action::{ActionData, Behaviour};
use intervene_core::engine::internal::InternalState;
use intervene_core::{Experiment, Intervention};
use intervene_tests::{internal_variants, simulate, single_link, test_config, Harness};

const N: usize = 16;

/// Harness replaying a recorded trajectory, so reruns see identical data.
fn replay_harness(internal: intervene_core::config::InternalConfig) -> (Harness, Vec<Option<Intervention>>) {
    let ground_truth = single_link(3, 0, 1, 1.0);
    let generator = test_config(
        intervene_core::config::InternalConfig::LocalComputations,
        Behaviour::Random,
        31,
    );
    let run = simulate(&generator, N, 3, &ground_truth);

    let config = test_config(internal, Behaviour::Observer, 0);
    let mut harness = Harness::new(&config, N, 3, &ground_truth);
    harness.env.load_trial_data(run.trajectory.clone()).unwrap();
    (harness, run.interventions)
}

#[test]
fn rollback_to_start_restores_prior_exactly() {
    for (name, internal) in internal_variants() {
        let (mut harness, interventions) = replay_harness(internal);
        let prior = harness.internal.posterior_over_links();
        let prior_entropy = harness.internal.posterior_entropy();

        for iv in interventions.iter().take(10) {
            harness.step(*iv);
        }
        harness.rollback(10);

        assert_eq!(harness.internal.n(), 0, "{}", name);
        assert_eq!(harness.internal.posterior_over_links(), prior, "{}", name);
        assert_eq!(harness.internal.posterior_entropy().to_bits(), prior_entropy.to_bits(), "{}", name);
    }
}

#[test]
fn rollback_then_rerun_is_bit_identical() {
    for (name, internal) in internal_variants() {
        let (mut harness, interventions) = replay_harness(internal);
        for iv in interventions.iter().take(6) {
            harness.step(*iv);
        }
        let checkpoint = harness.internal.posterior_over_links();

        for iv in interventions.iter().skip(6).take(5) {
            harness.step(*iv);
        }
        let first_pass = harness.internal.posterior_over_links();
        let first_history = harness.internal.entropy_history();

        harness.rollback(5);
        assert_eq!(harness.internal.n(), 6, "{}", name);
        assert_eq!(harness.internal.posterior_over_links(), checkpoint, "{}", name);

        for iv in interventions.iter().skip(6).take(5) {
            harness.step(*iv);
        }
        assert_eq!(harness.internal.posterior_over_links(), first_pass, "{}", name);
        assert_eq!(harness.internal.entropy_history(), first_history, "{}", name);
    }
}

#[test]
fn rollback_past_history_resets_to_prior() {
    for (name, internal) in internal_variants() {
        let (mut harness, interventions) = replay_harness(internal);
        let prior = harness.internal.posterior_over_links();
        for iv in interventions.iter().take(4) {
            harness.step(*iv);
        }
        harness.internal.rollback(50);
        assert_eq!(harness.internal.n(), 0, "{}", name);
        assert_eq!(harness.internal.posterior_over_links(), prior, "{}", name);
        assert_eq!(harness.internal.entropy_history().len(), 1, "{}", name);
    }
}

#[test]
fn agent_rollback_rewinds_likelihoods() {
    let ground_truth = single_link(2, 1, 0, -1.0);
    let generator = test_config(
        intervene_core::config::InternalConfig::LocalComputations,
        Behaviour::Random,
        41,
    );
    let run = simulate(&generator, N, 2, &ground_truth);
    let mut actions: Vec<Option<usize>> = run.interventions.iter().map(|iv| iv.map(|iv| iv.variable)).collect();
    actions.push(None);
    let mut values = run.trajectory.clone();
    for (row, iv) in values.iter_mut().zip(&run.interventions) {
        if let Some(iv) = iv {
            row[iv.variable] = iv.value;
        }
    }

    let config = test_config(
        intervene_core::config::InternalConfig::LocalComputations,
        Behaviour::Random,
        3,
    );
    let mut agent = config.build_agent(N, 2, None).unwrap();
    agent
        .action_mut()
        .load_action_data(ActionData {
            actions: actions.clone(),
            actions_fit: actions,
            values,
        })
        .unwrap();
    agent
        .internal_mut()
        .load_judgement_data(vec![vec![None, None]; N], run.map.clone())
        .unwrap();
    let mut env = config.build_environment(N, 2, &ground_truth).unwrap();
    env.load_trial_data(run.trajectory.clone()).unwrap();

    for _ in 0..8 {
        agent.fit_step(&mut env).unwrap();
    }
    let action_ll = agent.action_log_likelihood();
    let judgement_ll = agent.judgement_log_likelihood();

    for _ in 0..4 {
        agent.fit_step(&mut env).unwrap();
    }
    agent.rollback(4);
    env.rollback(4);
    assert_eq!(agent.n(), 8);
    assert_eq!(agent.action_log_likelihood(), action_ll);
    assert_eq!(agent.judgement_log_likelihood(), judgement_ll);

    let mut experiment = Experiment::new(agent, env).unwrap();
    let summary = experiment.fit().unwrap();
    assert_eq!(summary.steps.len(), N - 8);
    assert_eq!(summary.steps[0].n, 9);
}
