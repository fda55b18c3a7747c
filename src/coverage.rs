//! How much of the hierarchy a labeled dataset actually observes.
//!
//! Two figures are reported and they intentionally disagree in one case:
//!
//! - **Per layer**: distinct labels seen anywhere in the dataset that name a
//!   node of that layer, over the number of nodes in the layer.
//! - **DAG**: distinct (pathway, superclass, class) triples seen in the
//!   dataset that are legal paths, over the number of legal paths.
//!
//! A sample whose triple is *not* a legal path is left out of both the
//! numerator and the denominator of the DAG figure, yet its labels still
//! count towards per-layer coverage. Per-layer coverage can therefore look
//! healthier than the usable, path-level coverage. This asymmetry is part
//! of the contract; do not "fix" one figure to match the other.
//!
//! Multi-label samples contribute every combination of their labels.
//! Labels that are not graph nodes are never counted as observed nodes (so
//! coverage stays in `[0, 1]`) and are reported separately.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::dataset::Dataset;
use crate::hierarchy::{HierarchyGraph, Layer, LegalPath, PerLayer};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerCoverage {
    pub observed_nodes: usize,
    pub total_nodes: usize,
    pub coverage: f64,
    /// Distinct labels in the dataset that are not nodes of this layer.
    pub unknown_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DagCoverage {
    pub observed_paths: usize,
    pub total_legal_paths: usize,
    pub coverage: f64,
    /// Distinct label triples present in the dataset that are not legal paths.
    pub illegal_triples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub dataset: String,
    pub layers: PerLayer<LayerCoverage>,
    pub dag: DagCoverage,
}

/// One row of the coverage table: `pathways`, `superclasses`, `classes` or `DAG`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageRow {
    pub key: String,
    pub observed: usize,
    pub total: usize,
    pub coverage: f64,
}

pub fn coverage(graph: &HierarchyGraph, dataset: &Dataset) -> CoverageReport {
    let mut seen: PerLayer<BTreeSet<&str>> = PerLayer::default();
    let mut unknown: PerLayer<BTreeSet<&str>> = PerLayer::default();
    let mut legal: BTreeSet<LegalPath> = BTreeSet::new();
    let mut illegal: BTreeSet<(&str, &str, &str)> = BTreeSet::new();

    for sample in &dataset.samples {
        for (layer, labels) in sample.labels.iter() {
            for label in labels {
                if graph.node_id(layer, label).is_some() {
                    seen[layer].insert(label.as_str());
                } else {
                    unknown[layer].insert(label.as_str());
                }
            }
        }
        for (p, s, c) in sample.label_triples() {
            match legal_path_by_name(graph, p, s, c) {
                Some(path) => {
                    legal.insert(path);
                }
                None => {
                    illegal.insert((p, s, c));
                }
            }
        }
    }

    let layers = PerLayer::from_fn(|layer| {
        let total_nodes = graph.layer_len(layer);
        let observed_nodes = seen[layer].len();
        LayerCoverage {
            observed_nodes,
            total_nodes,
            coverage: ratio(observed_nodes, total_nodes),
            unknown_labels: unknown[layer].iter().map(|s| s.to_string()).collect(),
        }
    });

    let total_legal_paths = graph.legal_path_count();
    let dag = DagCoverage {
        observed_paths: legal.len(),
        total_legal_paths,
        coverage: ratio(legal.len(), total_legal_paths),
        illegal_triples: illegal.len(),
    };

    CoverageReport {
        dataset: dataset.name.clone(),
        layers,
        dag,
    }
}

fn legal_path_by_name(graph: &HierarchyGraph, p: &str, s: &str, c: &str) -> Option<LegalPath> {
    let path = LegalPath::new(
        graph.node_id(Layer::Pathway, p)?.index,
        graph.node_id(Layer::Superclass, s)?.index,
        graph.node_id(Layer::Class, c)?.index,
    );
    graph.is_legal(path).then_some(path)
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        (numerator as f64 / denominator as f64).clamp(0.0, 1.0)
    }
}

impl CoverageReport {
    pub fn rows(&self) -> Vec<CoverageRow> {
        let mut rows: Vec<CoverageRow> = self
            .layers
            .iter()
            .map(|(layer, c)| CoverageRow {
                key: layer.plural().to_string(),
                observed: c.observed_nodes,
                total: c.total_nodes,
                coverage: c.coverage,
            })
            .collect();
        rows.push(CoverageRow {
            key: "DAG".to_string(),
            observed: self.dag.observed_paths,
            total: self.dag.total_legal_paths,
            coverage: self.dag.coverage,
        });
        rows
    }
}

pub fn render_coverage_csv(report: &CoverageReport) -> String {
    let mut out = String::from("layer,observed,total,coverage\n");
    for row in report.rows() {
        out.push_str(&format!(
            "{},{},{},{:.6}\n",
            row.key, row.observed, row.total, row.coverage
        ));
    }
    out
}

pub fn render_coverage_markdown(report: &CoverageReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# DAG coverage: {}\n\n", report.dataset));
    out.push_str("| layer | observed | total | coverage |\n");
    out.push_str("|---|---:|---:|---:|\n");
    for row in report.rows() {
        out.push_str(&format!(
            "| {} | {} | {} | {:.4} |\n",
            row.key, row.observed, row.total, row.coverage
        ));
    }

    let unknown: Vec<String> = report
        .layers
        .iter()
        .filter(|(_, c)| !c.unknown_labels.is_empty())
        .map(|(layer, c)| format!("- {}: {}", layer.plural(), c.unknown_labels.join(", ")))
        .collect();
    if !unknown.is_empty() {
        out.push_str("\n## Labels outside the hierarchy\n\n");
        for line in unknown {
            out.push_str(&line);
            out.push('\n');
        }
    }
    if report.dag.illegal_triples > 0 {
        out.push_str(&format!(
            "\n{} distinct label triples are not legal paths and are excluded from DAG coverage.\n",
            report.dag.illegal_triples
        ));
    }
    out
}
