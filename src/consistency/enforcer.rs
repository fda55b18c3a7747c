//! Projection of independent per-layer scores onto a single legal path.
//!
//! This is the "static attention" of the classifier: a fixed selection over
//! the legal paths of the hierarchy, computed from graph structure and the
//! three score vectors alone. Nothing here is learned.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;

use crate::hierarchy::{HierarchyGraph, Layer, LegalPath, PerLayer};

use super::combiner::{ProductCombiner, ScoreCombiner};

/// Paths whose combined score is within this distance of the best are ties.
pub const DEFAULT_TIE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsistencyError {
    #[error("unreachable hierarchy: {reason}")]
    UnreachableHierarchy { reason: String },
    #[error("{layer} scores have length {actual}, expected {expected}")]
    ScoreShape {
        layer: Layer,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConsistentPrediction {
    pub path: LegalPath,
    pub combined_score: f64,
    /// The independent per-layer argmaxes already formed this legal path.
    pub fast_path: bool,
}

/// Selects the best-scoring legal path for a sample.
///
/// A node is *scored* when its score is finite; a path is a candidate only
/// when all three of its nodes are scored. Ties within `epsilon` of the best
/// combined score are broken by the raw pathway score, then superclass, then
/// class (higher wins), then by the lower node indices.
#[derive(Clone)]
pub struct ConsistencyEnforcer<'g> {
    graph: &'g HierarchyGraph,
    combiner: Arc<dyn ScoreCombiner>,
    epsilon: f64,
}

impl<'g> ConsistencyEnforcer<'g> {
    pub fn new(graph: &'g HierarchyGraph) -> Self {
        Self {
            graph,
            combiner: Arc::new(ProductCombiner),
            epsilon: DEFAULT_TIE_EPSILON,
        }
    }

    pub fn with_combiner(mut self, combiner: Arc<dyn ScoreCombiner>) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = if epsilon.is_finite() {
            epsilon.max(0.0)
        } else {
            DEFAULT_TIE_EPSILON
        };
        self
    }

    pub fn graph(&self) -> &HierarchyGraph {
        self.graph
    }

    pub fn combiner_name(&self) -> &str {
        self.combiner.name()
    }

    /// Score vectors are indexed by each layer's node index.
    pub fn enforce(
        &self,
        scores: &PerLayer<Vec<f64>>,
    ) -> Result<ConsistentPrediction, ConsistencyError> {
        self.check_shape(scores)?;

        if let Some(path) = self.independent_argmax(scores) {
            if self.graph.is_legal(path) {
                if let Some(combined_score) = self.path_score(scores, path) {
                    return Ok(ConsistentPrediction {
                        path,
                        combined_score,
                        fast_path: true,
                    });
                }
            }
        }

        self.scan(scores)
    }

    /// Score by label name. Names that are not nodes of the graph are ignored;
    /// repeated names keep their highest score.
    pub fn enforce_named(
        &self,
        scores: &PerLayer<Vec<(String, f64)>>,
    ) -> Result<ConsistentPrediction, ConsistencyError> {
        let mut unknown: Vec<String> = Vec::new();
        let dense = PerLayer::from_fn(|layer| {
            let mut dense = vec![f64::NAN; self.graph.layer_len(layer)];
            for (name, score) in &scores[layer] {
                match self.graph.node_id(layer, name) {
                    Some(node) => {
                        let slot = &mut dense[node.index];
                        if slot.is_nan() || *score > *slot {
                            *slot = *score;
                        }
                    }
                    None => unknown.push(format!("{layer}:{name}")),
                }
            }
            dense
        });

        self.enforce(&dense).map_err(|err| match err {
            ConsistencyError::UnreachableHierarchy { reason } if !unknown.is_empty() => {
                ConsistencyError::UnreachableHierarchy {
                    reason: format!("{reason}; labels outside the hierarchy: {}", unknown.join(", ")),
                }
            }
            other => other,
        })
    }

    /// One result per sample; a failing sample never affects the others.
    pub fn enforce_batch(
        &self,
        batch: &[PerLayer<Vec<f64>>],
    ) -> Vec<Result<ConsistentPrediction, ConsistencyError>> {
        batch.iter().map(|scores| self.enforce(scores)).collect()
    }

    /// Per-layer argmax over scored nodes (lowest index wins ties). The triple
    /// is not necessarily a legal path.
    pub fn independent_argmax(&self, scores: &PerLayer<Vec<f64>>) -> Option<LegalPath> {
        Some(LegalPath::new(
            argmax(&scores.pathway)?,
            argmax(&scores.superclass)?,
            argmax(&scores.class)?,
        ))
    }

    fn check_shape(&self, scores: &PerLayer<Vec<f64>>) -> Result<(), ConsistencyError> {
        for (layer, values) in scores.iter() {
            let expected = self.graph.layer_len(layer);
            if values.len() != expected {
                return Err(ConsistencyError::ScoreShape {
                    layer,
                    expected,
                    actual: values.len(),
                });
            }
        }
        Ok(())
    }

    fn path_score(&self, scores: &PerLayer<Vec<f64>>, path: LegalPath) -> Option<f64> {
        let p = scores.pathway[path.pathway];
        let s = scores.superclass[path.superclass];
        let c = scores.class[path.class];
        if !(p.is_finite() && s.is_finite() && c.is_finite()) {
            return None;
        }
        let combined = self.combiner.combine(p, s, c);
        (!combined.is_nan()).then_some(combined)
    }

    fn scan(&self, scores: &PerLayer<Vec<f64>>) -> Result<ConsistentPrediction, ConsistencyError> {
        let best = self
            .graph
            .all_legal_paths()
            .filter_map(|path| self.path_score(scores, path))
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));

        let Some(best) = best else {
            return Err(ConsistencyError::UnreachableHierarchy {
                reason: format!(
                    "none of the {} legal paths has scores on all three layers",
                    self.graph.legal_path_count()
                ),
            });
        };

        let threshold = best - self.epsilon;
        let mut chosen: Option<(LegalPath, f64)> = None;
        for path in self.graph.all_legal_paths() {
            let Some(value) = self.path_score(scores, path) else {
                continue;
            };
            if value < threshold {
                continue;
            }
            chosen = match chosen {
                Some((current, current_value)) if !prefer(scores, path, current) => {
                    Some((current, current_value))
                }
                _ => Some((path, value)),
            };
        }

        chosen
            .map(|(path, combined_score)| ConsistentPrediction {
                path,
                combined_score,
                fast_path: false,
            })
            .ok_or_else(|| ConsistencyError::UnreachableHierarchy {
                reason: "no candidate path survived tie-breaking".to_string(),
            })
    }
}

fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &value) in values.iter().enumerate() {
        if !value.is_finite() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Whether `a` beats `b` among tied paths.
fn prefer(scores: &PerLayer<Vec<f64>>, a: LegalPath, b: LegalPath) -> bool {
    for layer in Layer::ALL {
        let sa = scores[layer][a.index(layer)];
        let sb = scores[layer][b.index(layer)];
        match sa.total_cmp(&sb) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    a < b
}
