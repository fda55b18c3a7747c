//! Per-class metrics and their aggregation across holdouts.

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::dataset::LabelMatrix;
use crate::hierarchy::{HierarchyGraph, Layer, LegalPath, NodeId, PerLayer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Precision,
    Recall,
    Auprc,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::Precision, MetricKind::Recall, MetricKind::Auprc];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Precision => "precision",
            MetricKind::Recall => "recall",
            MetricKind::Auprc => "auprc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub layer: Layer,
    pub class: String,
    /// Positives among the evaluated samples.
    pub support: usize,
    pub precision: f64,
    pub recall: f64,
    /// `None` when the class has no positives.
    pub auprc: Option<f64>,
}

impl ClassMetrics {
    pub fn value(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::Precision => Some(self.precision),
            MetricKind::Recall => Some(self.recall),
            MetricKind::Auprc => self.auprc,
        }
    }
}

/// Metrics for every node of the graph, in layer then node-index order.
///
/// Precision and recall use the hierarchy-consistent prediction of each
/// sample (`None` predicts nothing); AUPRC ranks the raw adapter scores.
pub fn class_metrics(
    graph: &HierarchyGraph,
    truth: &LabelMatrix,
    predicted: &[Option<LegalPath>],
    scores: &[PerLayer<Vec<f64>>],
) -> Vec<ClassMetrics> {
    let mut out = Vec::with_capacity(graph.node_count());
    for layer in Layer::ALL {
        for node in 0..graph.layer_len(layer) {
            let actual: Vec<bool> = truth
                .rows
                .iter()
                .map(|row| row[layer].get(node).copied().unwrap_or(false))
                .collect();
            let (mut tp, mut fp, mut fneg) = (0usize, 0usize, 0usize);
            for (is_positive, prediction) in actual.iter().zip(predicted) {
                let hit = prediction.is_some_and(|path| path.index(layer) == node);
                match (hit, *is_positive) {
                    (true, true) => tp += 1,
                    (true, false) => fp += 1,
                    (false, true) => fneg += 1,
                    (false, false) => {}
                }
            }
            let node_scores: Vec<f64> = scores
                .iter()
                .map(|row| row[layer].get(node).copied().unwrap_or(f64::NAN))
                .collect();
            out.push(ClassMetrics {
                layer,
                class: graph
                    .node_name(NodeId::new(layer, node))
                    .unwrap_or_default()
                    .to_string(),
                support: actual.iter().filter(|v| **v).count(),
                precision: safe_div(tp, tp + fp),
                recall: safe_div(tp, tp + fneg),
                auprc: average_precision(&node_scores, &actual),
            });
        }
    }
    out
}

fn safe_div(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Step-wise average precision: `Σ (R_n − R_{n−1}) · P_n` over distinct
/// score thresholds, highest first. Non-finite scores rank last.
pub fn average_precision(scores: &[f64], truth: &[bool]) -> Option<f64> {
    let positives = truth.iter().filter(|t| **t).count();
    if positives == 0 || scores.len() != truth.len() {
        return None;
    }
    let key = |i: usize| {
        if scores[i].is_finite() {
            scores[i]
        } else {
            f64::NEG_INFINITY
        }
    };
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| key(b).total_cmp(&key(a)));

    let (mut tp, mut seen, mut pos) = (0usize, 0usize, 0usize);
    let mut ap = 0.0;
    let mut previous_recall = 0.0;
    while pos < order.len() {
        let threshold = key(order[pos]);
        while pos < order.len() && key(order[pos]) == threshold {
            if truth[order[pos]] {
                tp += 1;
            }
            seen += 1;
            pos += 1;
        }
        let recall = tp as f64 / positives as f64;
        ap += (recall - previous_recall) * (tp as f64 / seen as f64);
        previous_recall = recall;
    }
    Some(ap)
}

/// Running mean and sum of squared deviations. Merging is associative and
/// commutative up to floating-point rounding.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricAccumulator {
    count: usize,
    mean: f64,
    m2: f64,
}

impl MetricAccumulator {
    pub fn from_value(value: f64) -> Self {
        Self {
            count: 1,
            mean: value,
            m2: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        *self = self.merge(Self::from_value(value));
    }

    pub fn merge(self, other: Self) -> Self {
        if self.count == 0 {
            return other;
        }
        if other.count == 0 {
            return self;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * other.count as f64 / count as f64;
        let m2 = self.m2
            + other.m2
            + delta * delta * (self.count as f64 * other.count as f64) / count as f64;
        Self { count, mean, m2 }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finish(&self) -> Option<AggregatedMetric> {
        if self.count == 0 {
            return None;
        }
        let variance = if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        };
        let std = variance.sqrt();
        let ci95 = t_critical_95(self.count).map(|t| t * std / (self.count as f64).sqrt());
        Some(AggregatedMetric {
            n: self.count,
            mean: self.mean,
            variance,
            std,
            ci95,
        })
    }
}

impl FromIterator<f64> for MetricAccumulator {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::default(), |acc, v| acc.merge(Self::from_value(v)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregatedMetric {
    pub n: usize,
    pub mean: f64,
    /// Sample variance (n − 1 denominator); 0 for a single observation.
    pub variance: f64,
    pub std: f64,
    /// Half-width of the 95% Student-t interval; `None` below two observations.
    pub ci95: Option<f64>,
}

/// Two-sided 95% critical value of Student's t with `n − 1` degrees of freedom.
pub fn t_critical_95(n: usize) -> Option<f64> {
    if n < 2 {
        return None;
    }
    StudentsT::new(0.0, 1.0, (n - 1) as f64)
        .ok()
        .map(|dist| dist.inverse_cdf(0.975))
}
