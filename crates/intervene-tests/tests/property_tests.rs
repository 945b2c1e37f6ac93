//! Property tests for normalization, entropy bounds, action round-trips,
//! running means and smoothing.

use intervene_core::engine::action::{ActionGrid, EpsilonGreedy, Policy, Softmax};
use intervene_core::engine::numeric_kernels::{
    argmax, entropy_bits, incremental_mean, normalize_log_probabilities, smooth_toward_map,
    PROBABILITY_TOLERANCE,
};
use intervene_core::engine::space::HypothesisSpace;
use intervene_core::Intervention;
use proptest::prelude::*;

fn log_weights() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-500f64..50.0, 1..40)
}

fn distribution() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.01f64..10.0, 1..30).prop_map(|w| {
        let total: f64 = w.iter().sum();
        w.into_iter().map(|x| x / total).collect()
    })
}

proptest! {
    #[test]
    fn normalized_log_weights_form_a_distribution(w in log_weights()) {
        let p = normalize_log_probabilities(&w);
        prop_assert_eq!(p.len(), w.len());
        prop_assert!(p.iter().all(|&x| x >= 0.0));
        prop_assert!((p.iter().sum::<f64>() - 1.0).abs() < PROBABILITY_TOLERANCE);
    }

    #[test]
    fn normalization_ignores_constant_shifts(w in log_weights(), shift in -1e3f64..1e3) {
        let shifted: Vec<f64> = w.iter().map(|x| x + shift).collect();
        let a = normalize_log_probabilities(&w);
        let b = normalize_log_probabilities(&shifted);
        for (x, y) in a.iter().zip(&b) {
            prop_assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn entropy_is_bounded_by_uniform(p in distribution()) {
        let h = entropy_bits(&p);
        prop_assert!(h >= -1e-12);
        prop_assert!(h <= (p.len() as f64).log2() + 1e-9);
    }

    #[test]
    fn uniform_and_point_mass_hit_the_bounds(n in 1usize..64, hot in 0usize..64) {
        let uniform = vec![1.0 / n as f64; n];
        prop_assert!((entropy_bits(&uniform) - (n as f64).log2()).abs() < 1e-9);
        let mut point = vec![0.0; n];
        point[hot % n] = 1.0;
        prop_assert_eq!(entropy_bits(&point), 0.0);
    }

    #[test]
    fn flat_actions_round_trip(k in 1usize..6, width in 1usize..12, seed in 0usize..10_000) {
        let values: Vec<f64> = (0..width).map(|i| i as f64 * 10.0 - 50.0).collect();
        let grid = ActionGrid::new(k, values).unwrap();
        let action = seed % grid.num_actions();
        let remapped = grid.remap(action).unwrap();
        prop_assert_eq!(grid.flatten(remapped.as_ref()).unwrap(), action);
        prop_assert!(grid.remap(grid.num_actions()).is_err());
    }

    #[test]
    fn interventions_round_trip_through_constrain(
        k in 1usize..5,
        variable in 0usize..5,
        value in -100f64..100.0,
    ) {
        let grid = ActionGrid::new(k, vec![-80.0, -20.0, 0.0, 40.0, 100.0]).unwrap();
        let iv = Intervention::new(variable % k, value);
        let constrained = grid.constrain(Some(&iv));
        let flat = grid.flatten(Some(&iv)).unwrap();
        prop_assert_eq!(grid.remap(flat).unwrap(), constrained);
    }

    #[test]
    fn running_mean_matches_batch_mean_in_any_order(
        samples in prop::collection::vec(prop::collection::vec(-10f64..10.0, 3), 1..12),
        rotation in 0usize..12,
    ) {
        let mut order = samples.clone();
        order.rotate_left(rotation % samples.len());
        order.reverse();

        let mut forward = vec![0.0; 3];
        for (c, s) in samples.iter().enumerate() {
            incremental_mean(&mut forward, s, c);
        }
        let mut shuffled = vec![0.0; 3];
        for (c, s) in order.iter().enumerate() {
            incremental_mean(&mut shuffled, s, c);
        }

        for i in 0..3 {
            let batch = samples.iter().map(|s| s[i]).sum::<f64>() / samples.len() as f64;
            prop_assert!((forward[i] - batch).abs() < 1e-9);
            prop_assert!((shuffled[i] - batch).abs() < 1e-9);
        }
    }

    #[test]
    fn smoothing_yields_distributions_and_keeps_the_map(
        rows in prop::collection::vec(distribution(), 1..6),
        temperature in 0f64..20.0,
    ) {
        let smoothed = smooth_toward_map(&rows, temperature);
        prop_assert_eq!(smoothed.len(), rows.len());
        for (row, out) in rows.iter().zip(&smoothed) {
            prop_assert!(out.iter().all(|&x| x >= 0.0));
            prop_assert!((out.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            let best = argmax(row);
            prop_assert!(out[best] + 1e-12 >= out.iter().copied().fold(0.0, f64::max));
        }
    }

    #[test]
    fn zero_temperature_smoothing_is_identity(rows in prop::collection::vec(distribution(), 1..6)) {
        prop_assert_eq!(smooth_toward_map(&rows, 0.0), rows);
    }

    #[test]
    fn policies_return_distributions(
        values in prop::collection::vec(-5f64..5.0, 1..30),
        temperature in 0f64..50.0,
        epsilon in 0f64..1.0,
    ) {
        let policies: [Box<dyn Policy>; 2] = [
            Box::new(Softmax::new(temperature).unwrap()),
            Box::new(EpsilonGreedy::new(epsilon).unwrap()),
        ];
        for policy in &policies {
            let p = policy.params(&values);
            prop_assert_eq!(p.len(), values.len());
            prop_assert!(p.iter().all(|&x| x >= 0.0));
            prop_assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            prop_assert_eq!(policy.pmf(values.len(), &values), 0.0);
        }
    }

    #[test]
    fn hypothesis_indices_round_trip(h in 0usize..625) {
        let space = HypothesisSpace::new(2, &[-1.0, -0.5, 0.0, 0.5, 1.0]).unwrap();
        let h = h % space.len();
        prop_assert_eq!(space.index_of(space.vector(h)), Some(h));
        let links = space.models_to_links(&{
            let mut p = vec![0.0; space.len()];
            p[h] = 1.0;
            p
        });
        for (row, &v) in links.iter().zip(space.vector(h)) {
            let idx = space.value_index(v).unwrap();
            prop_assert!((row[idx] - 1.0).abs() < 1e-12);
        }
    }
}
