use std::sync::Arc;

use npc_harness::consistency::{
    CombinerRegistry, ConsistencyEnforcer, ConsistencyError, MinimumCombiner, ScoreCombiner,
};
use npc_harness::hierarchy::{HierarchyGraph, Layer, LegalPath, PerLayer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// P0 -> {S0, S1}, P1 -> {S1, S2}; S0 -> {C0}, S1 -> {C1, C2}, S2 -> {C3}
fn graph() -> HierarchyGraph {
    HierarchyGraph::from_label_triples([
        ("P0", "S0", "C0"),
        ("P0", "S1", "C1"),
        ("P0", "S1", "C2"),
        ("P1", "S1", "C1"),
        ("P1", "S1", "C2"),
        ("P1", "S2", "C3"),
    ])
    .unwrap()
}

fn scores(p: &[f64], s: &[f64], c: &[f64]) -> PerLayer<Vec<f64>> {
    PerLayer::new(p.to_vec(), s.to_vec(), c.to_vec())
}

fn brute_force_best(
    graph: &HierarchyGraph,
    combiner: &dyn ScoreCombiner,
    scores: &PerLayer<Vec<f64>>,
) -> f64 {
    graph
        .all_legal_paths()
        .map(|path| {
            combiner.combine(
                scores.pathway[path.pathway],
                scores.superclass[path.superclass],
                scores.class[path.class],
            )
        })
        .fold(f64::NEG_INFINITY, f64::max)
}

#[test]
fn legal_independent_argmax_takes_the_fast_path() {
    let graph = graph();
    let enforcer = ConsistencyEnforcer::new(&graph);
    let prediction = enforcer
        .enforce(&scores(&[0.9, 0.1], &[0.2, 0.7, 0.1], &[0.1, 0.6, 0.2, 0.1]))
        .unwrap();
    assert!(prediction.fast_path);
    assert_eq!(prediction.path, LegalPath::new(0, 1, 1));
}

#[test]
fn illegal_argmax_is_projected_onto_best_legal_path() {
    let graph = graph();
    let enforcer = ConsistencyEnforcer::new(&graph);
    // independent argmax (P0, S2, C3) is not legal
    let s = scores(&[0.8, 0.6], &[0.1, 0.4, 0.9], &[0.1, 0.2, 0.1, 0.9]);
    assert_eq!(
        enforcer.independent_argmax(&s),
        Some(LegalPath::new(0, 2, 3))
    );
    let prediction = enforcer.enforce(&s).unwrap();
    assert!(!prediction.fast_path);
    assert!(graph.is_legal(prediction.path));
    // P1 * S2 * C3 = 0.486 beats P0 * S1 * C1 = 0.064
    assert_eq!(prediction.path, LegalPath::new(1, 2, 3));
    assert!((prediction.combined_score - 0.6 * 0.9 * 0.9).abs() < 1e-12);
}

#[test]
fn enforcement_is_optimal_over_random_scores() {
    let graph = graph();
    let registry = CombinerRegistry::default();
    let mut rng = StdRng::seed_from_u64(7);
    for name in registry.list() {
        let combiner = registry.get(&name).unwrap();
        let enforcer = ConsistencyEnforcer::new(&graph).with_combiner(Arc::clone(&combiner));
        for _ in 0..200 {
            let s = PerLayer::from_fn(|layer| {
                (0..graph.layer_len(layer))
                    .map(|_| rng.gen::<f64>())
                    .collect::<Vec<_>>()
            });
            let prediction = enforcer.enforce(&s).unwrap();
            assert!(graph.is_legal(prediction.path));
            let best = brute_force_best(&graph, combiner.as_ref(), &s);
            assert!(
                (prediction.combined_score - best).abs() < 1e-9,
                "{name}: enforced {} but best legal path scores {best}",
                prediction.combined_score
            );
        }
    }
}

#[test]
fn ties_prefer_higher_pathway_score_then_lower_indices() {
    let graph = graph();
    let enforcer = ConsistencyEnforcer::new(&graph).with_combiner(Arc::new(MinimumCombiner));
    // all classes cap the minimum at 0.5, so every path ties on the combined score
    let s = scores(&[0.9, 0.95], &[0.9, 0.9, 0.9], &[0.5, 0.5, 0.5, 0.5]);
    let prediction = enforcer.enforce(&s).unwrap();
    assert_eq!(prediction.path.pathway, 1, "higher raw pathway score wins the tie");
    assert_eq!(prediction.path, LegalPath::new(1, 1, 1));

    let repeat = enforcer.enforce(&s).unwrap();
    assert_eq!(prediction, repeat);
}

#[test]
fn custom_closure_combiner_is_used() {
    let graph = graph();
    // rank purely by class score
    let by_class = |_: f64, _: f64, c: f64| c;
    let enforcer = ConsistencyEnforcer::new(&graph).with_combiner(Arc::new(by_class));
    let prediction = enforcer
        .enforce(&scores(&[0.9, 0.1], &[0.9, 0.1, 0.1], &[0.1, 0.1, 0.1, 0.8]))
        .unwrap();
    assert_eq!(prediction.path.class, 3);
    assert_eq!(enforcer.combiner_name(), "custom");
}

#[test]
fn unscored_nodes_make_paths_ineligible() {
    let graph = graph();
    let enforcer = ConsistencyEnforcer::new(&graph);
    let s = scores(
        &[0.9, f64::NAN],
        &[0.1, 0.9, f64::NAN],
        &[0.1, f64::NAN, 0.3, 0.9],
    );
    let prediction = enforcer.enforce(&s).unwrap();
    assert_eq!(prediction.path, LegalPath::new(0, 1, 2));
}

#[test]
fn nothing_reachable_is_an_unreachable_hierarchy() {
    let graph = graph();
    let enforcer = ConsistencyEnforcer::new(&graph);
    // only C3 is scored, and its sole superclass S2 is not
    let s = scores(
        &[0.5, 0.5],
        &[0.5, 0.5, f64::NAN],
        &[f64::NAN, f64::NAN, f64::NAN, 0.9],
    );
    assert!(matches!(
        enforcer.enforce(&s),
        Err(ConsistencyError::UnreachableHierarchy { .. })
    ));
}

#[test]
fn wrong_score_length_is_a_shape_error() {
    let graph = graph();
    let enforcer = ConsistencyEnforcer::new(&graph);
    let err = enforcer
        .enforce(&scores(&[0.5, 0.5], &[0.5], &[0.5; 4]))
        .unwrap_err();
    assert_eq!(
        err,
        ConsistencyError::ScoreShape {
            layer: Layer::Superclass,
            expected: 3,
            actual: 1
        }
    );
}

#[test]
fn named_scores_ignore_unknown_labels() {
    let graph = graph();
    let enforcer = ConsistencyEnforcer::new(&graph);
    let named = |xs: &[(&str, f64)]| {
        xs.iter()
            .map(|(n, v)| (n.to_string(), *v))
            .collect::<Vec<_>>()
    };
    let prediction = enforcer
        .enforce_named(&PerLayer::new(
            named(&[("P1", 0.7), ("Ghost", 1.0)]),
            named(&[("S2", 0.8)]),
            named(&[("C3", 0.9)]),
        ))
        .unwrap();
    assert_eq!(graph.path_names(prediction.path), Some(("P1", "S2", "C3")));

    let err = enforcer
        .enforce_named(&PerLayer::new(
            named(&[("Ghost", 1.0)]),
            named(&[("S2", 0.8)]),
            named(&[("C3", 0.9)]),
        ))
        .unwrap_err();
    match err {
        ConsistencyError::UnreachableHierarchy { reason } => {
            assert!(reason.contains("pathway:Ghost"), "{reason}")
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn batch_failures_are_isolated() {
    let graph = graph();
    let enforcer = ConsistencyEnforcer::new(&graph);
    let good = scores(&[0.9, 0.1], &[0.2, 0.7, 0.1], &[0.1, 0.6, 0.2, 0.1]);
    let bad = scores(&[f64::NAN, f64::NAN], &[0.2, 0.7, 0.1], &[0.1, 0.6, 0.2, 0.1]);
    let results = enforcer.enforce_batch(&[good.clone(), bad, good]);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());
}
