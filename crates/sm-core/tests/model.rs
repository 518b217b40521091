//! Scenario and invariant tests for the HPYP engine.

use std::collections::BTreeMap;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sm_core::{
    HpypModel, LossReport, ModelConfig, NodeId, PredictMode, SeatingKind, Symbol,
};

fn model_with(
    seq: &[Symbol],
    num_types: usize,
    kind: SeatingKind,
) -> HpypModel<'_, [Symbol], StdRng> {
    let mut config = ModelConfig::new(num_types);
    config.seating = kind;
    HpypModel::new(seq, config, StdRng::seed_from_u64(99)).unwrap()
}

const BOTH_KINDS: [SeatingKind; 2] = [SeatingKind::Full, SeatingKind::Compact];

/// Per-node, per-type count of customers *not* accounted for by children's
/// tables: the data customers. Both Gibbs sweeps resample the latent
/// tables but never touch the data, so this map is conserved. Zero counts
/// are included so key sets stay comparable across sweeps.
fn data_customers<R: Rng>(
    model: &HpypModel<'_, [Symbol], R>,
    num_types: usize,
) -> BTreeMap<(NodeId, Symbol), i64> {
    let mut out = BTreeMap::new();
    let arena = model.tree().arena();
    model.tree().visit_dfs_with_children(|id, children| {
        for y in 0..num_types {
            let y = y as Symbol;
            let mut from_children = 0i64;
            for &child in children {
                from_children += arena.seating(child).t_of(y) as i64;
            }
            out.insert((id, y), arena.seating(id).c_of(y) as i64 - from_children);
        }
    });
    out
}

fn random_symbols(len: usize, num_types: u16, seed: u64) -> Vec<Symbol> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(0..num_types)).collect()
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[test]
fn constant_sequence_funnels_to_root() {
    let seq: Vec<Symbol> = vec![0, 0, 0, 0];
    for kind in BOTH_KINDS {
        let mut m = model_with(&seq, 2, kind);
        m.build_tree(4);

        let root = m.tree().arena().root();
        let seating = m.tree().arena().seating(root);
        // Every observation funnels toward the root; at minimum the first
        // two arrive there, and never more than one per symbol.
        assert!((2..=4).contains(&seating.c_of(0)), "c={}", seating.c_of(0));
        assert_eq!(seating.c_of(1), 0);
        assert!((1..=4).contains(&seating.t_of(0)));
        assert!(m.check_consistency());
    }
}

#[test]
fn alternating_sequence_losses_decrease() {
    let seq: Vec<Symbol> = vec![0, 1, 0, 1, 0, 1];
    let mut m = model_with(&seq, 2, SeatingKind::Full);
    let losses = m.compute_losses(0, 6);

    assert_eq!(losses.len(), 6);
    assert!((losses[0] - 1.0).abs() < 1e-12);
    for &l in &losses[1..] {
        assert!(l > 0.0 && l < 2.0, "loss {l} out of range");
    }
    // The model learns the alternation: later losses are smaller on
    // average than earlier ones.
    let first: f64 = losses[..3].iter().sum();
    let second: f64 = losses[3..].iter().sum();
    assert!(second < first, "first half {first}, second half {second}");

    let report = LossReport::from_losses(losses);
    assert!(report.avg_bits < 1.0);
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("total_bits"));
}

#[test]
fn trained_predictive_distribution_normalizes() {
    let seq: Vec<Symbol> = vec![0, 1, 0];
    for kind in BOTH_KINDS {
        let mut m = model_with(&seq, 2, kind);
        m.build_tree(3);
        let dist = m.predictive_distribution(0, 3);
        assert_eq!(dist.len(), 2);
        let total: f64 = dist.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "sums to {total}");
        assert!(dist.iter().all(|p| (0.0..=1.0).contains(p)));
    }
}

#[test]
fn insert_remove_round_trip_at_root() {
    let seq: Vec<Symbol> = vec![0, 1];
    for kind in BOTH_KINDS {
        let mut m = model_with(&seq, 2, kind);
        m.build_tree(2);

        let root = m.tree().arena().root();
        let before: Vec<(usize, usize)> = (0..2u16)
            .map(|y| {
                let s = m.tree().arena().seating(root);
                (s.c_of(y), s.t_of(y))
            })
            .collect();

        m.insert_observation(0, 2, 0, None);
        m.remove_observation(0, 2, 0, None);

        for (y, &(c, t)) in before.iter().enumerate() {
            let s = m.tree().arena().seating(root);
            assert_eq!(s.c_of(y as Symbol), c, "c for symbol {y}");
            assert_eq!(s.t_of(y as Symbol), t, "t for symbol {y}");
        }
        assert!(m.check_consistency());
    }
}

#[test]
fn gibbs_sweeps_preserve_consistency_and_data() {
    let seq = random_symbols(200, 4, 7);
    let mut m = model_with(&seq, 4, SeatingKind::Compact);
    m.build_tree(200);
    assert!(m.check_consistency());

    let data_before = data_customers(&m, 4);
    m.run_gibbs_sampler(false);
    assert!(m.check_consistency(), "after add/remove sweep");
    assert_eq!(data_customers(&m, 4), data_before, "add/remove moved data");

    m.run_gibbs_sampler(true);
    assert!(m.check_consistency(), "after direct sweep");
    assert_eq!(data_customers(&m, 4), data_before, "direct sweep moved data");
}

#[test]
fn mid_edge_context_split_stays_consistent() {
    // "011" diverges inside the edge to "01", forcing a split during the
    // ordinary build.
    let seq: Vec<Symbol> = vec![0, 1, 1, 0];
    for kind in BOTH_KINDS {
        let nodes_without_split = {
            let mut m = model_with(&seq, 2, kind);
            m.build_tree(2);
            m.tree().node_count()
        };
        let mut m = model_with(&seq, 2, kind);
        m.build_tree(4);
        // The split created the intermediate "1" in addition to the new
        // context nodes.
        assert!(m.tree().node_count() > nodes_without_split + 2);
        assert!(m.check_consistency());
    }
}

// ---------------------------------------------------------------------
// Laws
// ---------------------------------------------------------------------

#[test]
fn loss_matches_predictive_on_split_free_sequence() {
    // A constant sequence grows a pure chain of contexts, so the node
    // the loss is read from is exactly the pre-insertion longest-suffix
    // terminal.
    let seq: Vec<Symbol> = vec![0; 8];
    let mut m = model_with(&seq, 2, SeatingKind::Full);
    m.insert_root(0);
    for i in 1..8 {
        let predicted = m.predict(0, i, 0);
        let probs = m.insert_context_and_observation(0, i, 0);
        let recorded = probs[probs.len() - 2];
        assert!(
            (predicted - recorded).abs() < 1e-12,
            "step {i}: predict {predicted} vs recorded {recorded}"
        );
    }
}

#[test]
fn prediction_modes_agree_on_exact_nodes() {
    let seq = random_symbols(40, 2, 11);
    let mut m = model_with(&seq, 2, SeatingKind::Full);
    m.build_tree(40);
    // The full history up to 39 is a node, so all three modes coincide.
    for y in 0..2u16 {
        let above = m.predict(0, 39, y);
        let below = m.predict_below(0, 39, y);
        let fragment = m.predict_with_fragmentation(0, 39, y);
        assert!((above - below).abs() < 1e-12);
        assert!((above - fragment).abs() < 1e-12);
    }
}

#[test]
fn fragment_prediction_is_a_probability() {
    // Query a context that ends inside an edge so the transient
    // restaurant path actually runs.
    let seq: Vec<Symbol> = vec![0, 1, 1];
    for kind in BOTH_KINDS {
        let mut m = model_with(&seq, 2, kind);
        // Contexts "0" and "01": the query "1" ends inside the edge from
        // the root to "01".
        m.build_tree(3);

        for y in 0..2u16 {
            let p = m.predict_with_fragmentation(1, 2, y);
            assert!((0.0..=1.0).contains(&p), "p={p}");
        }
    }
}

#[test]
fn predict_sequence_matches_pointwise_calls() {
    let seq = random_symbols(20, 2, 13);
    let mut m = model_with(&seq, 2, SeatingKind::Full);
    m.build_tree(20);
    let batch = m.predict_sequence(0, 20, PredictMode::Above);
    for (i, &p) in batch.iter().enumerate() {
        let single = m.predict(0, i, seq[i]);
        assert!((p - single).abs() < 1e-12);
    }
}

#[test]
fn mixing_weights_interpolate_depths() {
    let seq = random_symbols(30, 2, 17);
    let mut m = model_with(&seq, 2, SeatingKind::Full);
    m.build_tree(30);

    let plain = m.predictive_distribution(0, 30);
    let mixed = m.predictive_distribution_with_mixing(0, 30, &[]);
    for (a, b) in plain.iter().zip(mixed.iter()) {
        assert!((a - b).abs() < 1e-12, "empty weights must be a no-op");
    }

    let uniform = m.predictive_distribution_with_mixing(0, 30, &[1.0]);
    for p in uniform {
        assert!((p - 0.5).abs() < 1e-12);
    }
}

#[test]
fn log_joint_is_finite_on_reachable_states() {
    let seq = random_symbols(120, 3, 23);
    let mut m = model_with(&seq, 3, SeatingKind::Compact);
    m.build_tree(120);

    assert!(m.compute_log_joint().is_finite());
    m.run_gibbs_sampler(true);
    assert!(m.compute_log_joint().is_finite());
}

#[test]
fn sliding_window_training_stays_consistent() {
    let seq = random_symbols(60, 2, 29);
    let mut m = model_with(&seq, 2, SeatingKind::Full);
    let losses = m.compute_losses_with_deletion(0, 60, 16);
    assert_eq!(losses.len(), 60);
    assert!(losses.iter().all(|l| l.is_finite() && *l >= 0.0));
    assert!(m.check_consistency());
}

#[test]
fn remove_add_sweep_preserves_consistency() {
    let seq = random_symbols(50, 2, 31);
    for kind in BOTH_KINDS {
        let mut m = model_with(&seq, 2, kind);
        m.build_tree(50);
        m.remove_add_sweep(0, 50);
        assert!(m.check_consistency());
    }
}

#[test]
fn add_remove_gibbs_runs_on_full_seating() {
    let seq = random_symbols(80, 2, 37);
    let mut m = model_with(&seq, 2, SeatingKind::Full);
    m.build_tree(80);
    let data_before = data_customers(&m, 2);
    m.run_gibbs_sampler(false);
    assert!(m.check_consistency());
    assert_eq!(data_customers(&m, 2), data_before);
}

#[test]
fn update_tree_continues_a_build() {
    let seq = random_symbols(40, 2, 41);
    let mut m = model_with(&seq, 2, SeatingKind::Full);
    m.build_tree(20);
    m.update_tree(20, 40);
    assert!(m.check_consistency());

    // Every mode produces probabilities over the trained model.
    for mode in [PredictMode::Above, PredictMode::Below, PredictMode::Fragment] {
        let probs = m.predict_sequence(0, 40, mode);
        assert_eq!(probs.len(), 40);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)), "{mode:?}");
    }
}

#[test]
fn config_round_trips_through_json() {
    let config = ModelConfig {
        num_types: 4,
        seating: SeatingKind::Compact,
        ..ModelConfig::new(4)
    };
    let json = serde_json::to_string(&config).unwrap();
    let back: ModelConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.num_types, 4);
    assert_eq!(back.seating, SeatingKind::Compact);
    assert!(back.validate().is_ok());
}

// ---------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Seating an extra observation at the longest-suffix context of the
    /// full history and removing it again leaves the model consistent,
    /// keeps the deepest restaurant's counts intact, and inserts no
    /// nodes.
    #[test]
    fn insert_remove_keeps_model_consistent(
        symbols in proptest::collection::vec(0u16..4, 3..24),
        obs in 0u16..4,
        seed in 0u64..1_000,
    ) {
        let mut m = HpypModel::new(
            &symbols[..],
            ModelConfig::new(4),
            StdRng::seed_from_u64(seed),
        ).unwrap();
        let len = symbols.len();
        m.build_tree(len);

        let path = m.tree().find_longest_suffix(&symbols[..], 0, len);
        let deep = path.last().unwrap().id;
        let deep_counts: Vec<usize> = (0..4u16)
            .map(|y| m.tree().arena().seating(deep).c_of(y))
            .collect();
        let nodes = m.tree().node_count();

        m.insert_observation(0, len, obs, Some(&path));
        m.remove_observation(0, len, obs, Some(&path));

        prop_assert!(m.check_consistency());
        prop_assert_eq!(m.tree().node_count(), nodes);
        for (y, &c) in deep_counts.iter().enumerate() {
            prop_assert_eq!(
                m.tree().arena().seating(deep).c_of(y as Symbol),
                c,
                "deepest c for symbol {}", y
            );
        }
    }

    /// Predictive distributions normalize on arbitrary prefixes.
    #[test]
    fn predictive_distribution_always_normalizes(
        symbols in proptest::collection::vec(0u16..3, 2..20),
        seed in 0u64..1_000,
    ) {
        let mut m = HpypModel::new(
            &symbols[..],
            ModelConfig::new(3),
            StdRng::seed_from_u64(seed),
        ).unwrap();
        let len = symbols.len();
        m.build_tree(len);
        let dist = m.predictive_distribution(0, len);
        let total: f64 = dist.iter().sum();
        prop_assert!((total - 1.0).abs() < 1e-9);
    }
}
