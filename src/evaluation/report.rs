//! Tables written after an evaluation run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::hierarchy::Layer;
use crate::split::SplitStage;

use super::driver::{EvaluationReport, HoldoutSweep, UnitResult};
use super::metrics::{MetricAccumulator, MetricKind};

#[derive(Debug, Clone, Serialize)]
pub struct RunStamp {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub seed: u64,
    pub split_fingerprint: String,
    pub adapter: String,
    pub combiner: String,
}

impl RunStamp {
    pub fn new(
        seed: u64,
        split_fingerprint: impl Into<String>,
        adapter: impl Into<String>,
        combiner: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            seed,
            split_fingerprint: split_fingerprint.into(),
            adapter: adapter.into(),
            combiner: combiner.into(),
        }
    }
}

/// One line of the performance table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceRow {
    pub feature_set: String,
    pub stage: SplitStage,
    /// `pathways`, `superclasses`, `classes`, or `DAG` for path-level rows.
    pub layer: String,
    pub class: String,
    pub metric: String,
    pub mean: f64,
    pub std: f64,
    pub ci95: Option<f64>,
    /// Observations behind the row: completed holdouts, or 1 for the test stage.
    pub holdouts: usize,
}

pub const DAG_ROW_LAYER: &str = "DAG";
pub const DAG_ROW_CLASS: &str = "all";

/// Validation aggregates first, then test results, each in feature-set order.
pub fn performance_rows(report: &EvaluationReport) -> Vec<PerformanceRow> {
    let mut rows = Vec::new();
    for aggregate in report.sweep.aggregates() {
        for metric in &aggregate.metrics {
            rows.push(PerformanceRow {
                feature_set: aggregate.feature_set.clone(),
                stage: SplitStage::Validation,
                layer: metric.layer.plural().to_string(),
                class: metric.class.clone(),
                metric: metric.metric.as_str().to_string(),
                mean: metric.aggregate.mean,
                std: metric.aggregate.std,
                ci95: metric.aggregate.ci95,
                holdouts: metric.aggregate.n,
            });
        }
        if let Some(rate) = aggregate.consistency_rate {
            rows.push(PerformanceRow {
                feature_set: aggregate.feature_set.clone(),
                stage: SplitStage::Validation,
                layer: DAG_ROW_LAYER.to_string(),
                class: DAG_ROW_CLASS.to_string(),
                metric: "consistency_rate".to_string(),
                mean: rate.mean,
                std: rate.std,
                ci95: rate.ci95,
                holdouts: rate.n,
            });
        }
    }
    for result in &report.test_results {
        rows.extend(test_rows(result));
    }
    rows
}

fn test_rows(result: &UnitResult) -> Vec<PerformanceRow> {
    let row = |layer: String, class: String, metric: &str, value: f64| PerformanceRow {
        feature_set: result.feature_set.clone(),
        stage: result.stage,
        layer,
        class,
        metric: metric.to_string(),
        mean: value,
        std: 0.0,
        ci95: None,
        holdouts: 1,
    };
    let mut rows: Vec<PerformanceRow> = result
        .metrics
        .iter()
        .flat_map(|m| {
            MetricKind::ALL.into_iter().filter_map(move |kind| {
                m.value(kind).map(|value| (m, kind, value))
            })
        })
        .map(|(m, kind, value)| {
            row(
                m.layer.plural().to_string(),
                m.class.clone(),
                kind.as_str(),
                value,
            )
        })
        .collect();
    rows.push(row(
        DAG_ROW_LAYER.to_string(),
        DAG_ROW_CLASS.to_string(),
        "consistency_rate",
        result.consistency_rate,
    ));
    rows
}

fn stage_str(stage: SplitStage) -> &'static str {
    match stage {
        SplitStage::Test => "test",
        SplitStage::SubTrain => "sub_train",
        SplitStage::Validation => "validation",
    }
}

/// Quote a CSV field when it holds a separator, quote or newline.
pub fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.6}")).unwrap_or_default()
}

pub fn render_performance_csv(rows: &[PerformanceRow]) -> String {
    let mut out = String::from("feature_set,stage,layer,class,metric,mean,std,ci95,holdouts\n");
    for row in rows {
        out.push_str(&format!(
            "{},{},{},{},{},{:.6},{:.6},{},{}\n",
            csv_field(&row.feature_set),
            stage_str(row.stage),
            row.layer,
            csv_field(&row.class),
            row.metric,
            row.mean,
            row.std,
            opt(row.ci95),
            row.holdouts
        ));
    }
    out
}

pub fn write_performance_csv(path: impl AsRef<Path>, rows: &[PerformanceRow]) -> std::io::Result<()> {
    if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_performance_csv(rows))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarplotPoint {
    pub feature_set: String,
    pub stage: SplitStage,
    pub metric: String,
    pub mean: f64,
    pub ci95: Option<f64>,
}

/// Bars for one class: one point per (feature set, stage, metric).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarplotSeries {
    pub layer: String,
    pub class: String,
    pub points: Vec<BarplotPoint>,
}

impl BarplotSeries {
    /// Sanitized names plus a short hash of the raw ones, so classes that
    /// sanitize alike still get their own file.
    pub fn file_name(&self) -> String {
        let digest = blake3::hash(format!("{}\n{}", self.layer, self.class).as_bytes()).to_hex();
        format!(
            "{}_{}_{}.csv",
            sanitize(&self.layer),
            sanitize(&self.class),
            &digest.as_str()[..8]
        )
    }

    pub fn render_csv(&self) -> String {
        let mut out = String::from("feature_set,stage,metric,mean,ci95\n");
        for point in &self.points {
            out.push_str(&format!(
                "{},{},{},{:.6},{}\n",
                csv_field(&point.feature_set),
                stage_str(point.stage),
                point.metric,
                point.mean,
                opt(point.ci95)
            ));
        }
        out
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn layer_rank(layer: &str) -> usize {
    Layer::ALL
        .iter()
        .position(|l| l.plural() == layer)
        .unwrap_or(Layer::ALL.len())
}

/// Group rows by (layer, class), layers coarse to fine and the DAG last.
pub fn barplot_series(rows: &[PerformanceRow]) -> Vec<BarplotSeries> {
    let mut grouped: BTreeMap<(usize, &str, &str), Vec<BarplotPoint>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry((layer_rank(&row.layer), row.layer.as_str(), row.class.as_str()))
            .or_default()
            .push(BarplotPoint {
                feature_set: row.feature_set.clone(),
                stage: row.stage,
                metric: row.metric.clone(),
                mean: row.mean,
                ci95: row.ci95,
            });
    }
    grouped
        .into_iter()
        .map(|((_, layer, class), points)| BarplotSeries {
            layer: layer.to_string(),
            class: class.to_string(),
            points,
        })
        .collect()
}

/// One CSV per series; returns the written paths.
pub fn write_barplot_series(
    directory: impl AsRef<Path>,
    series: &[BarplotSeries],
) -> std::io::Result<Vec<PathBuf>> {
    let directory = directory.as_ref();
    std::fs::create_dir_all(directory)?;
    let mut written = Vec::with_capacity(series.len());
    for s in series {
        let path = directory.join(s.file_name());
        std::fs::write(&path, s.render_csv())?;
        written.push(path);
    }
    Ok(written)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRequirementRow {
    pub feature_set: String,
    pub holdouts: usize,
    pub train_seconds_mean: f64,
    pub train_seconds_std: f64,
    pub predict_seconds_mean: f64,
    pub predict_seconds_std: f64,
}

pub fn time_requirements(sweep: &HoldoutSweep) -> Vec<TimeRequirementRow> {
    sweep
        .aggregates()
        .iter()
        .filter_map(|aggregate| {
            let train = aggregate.train_seconds?;
            let predict = aggregate.predict_seconds?;
            Some(TimeRequirementRow {
                feature_set: aggregate.feature_set.clone(),
                holdouts: train.n,
                train_seconds_mean: train.mean,
                train_seconds_std: train.std,
                predict_seconds_mean: predict.mean,
                predict_seconds_std: predict.std,
            })
        })
        .collect()
}

pub fn render_time_requirements_csv(rows: &[TimeRequirementRow]) -> String {
    let mut out = String::from(
        "feature_set,holdouts,train_seconds_mean,train_seconds_std,predict_seconds_mean,predict_seconds_std\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{},{},{:.6},{:.6},{:.6},{:.6}\n",
            csv_field(&row.feature_set),
            row.holdouts,
            row.train_seconds_mean,
            row.train_seconds_std,
            row.predict_seconds_mean,
            row.predict_seconds_std
        ));
    }
    out
}

/// Unweighted mean over classes of one layer for one feature set and stage.
pub fn macro_average(
    rows: &[PerformanceRow],
    feature_set: &str,
    stage: SplitStage,
    layer: Layer,
    metric: MetricKind,
) -> Option<f64> {
    rows.iter()
        .filter(|r| {
            r.feature_set == feature_set
                && r.stage == stage
                && r.layer == layer.plural()
                && r.metric == metric.as_str()
        })
        .map(|r| r.mean)
        .collect::<MetricAccumulator>()
        .finish()
        .map(|agg| agg.mean)
}

pub fn render_evaluation_markdown(report: &EvaluationReport, stamp: &RunStamp) -> String {
    let rows = performance_rows(report);
    let sweep = &report.sweep;
    let mut out = String::new();

    out.push_str("# Feature-set evaluation\n\n");
    out.push_str(&format!("- Run: `{}`\n", stamp.run_id));
    out.push_str(&format!("- Started: {}\n", stamp.started_at.to_rfc3339()));
    out.push_str(&format!("- Seed: {}\n", stamp.seed));
    out.push_str(&format!("- Split fingerprint: `{}`\n", stamp.split_fingerprint));
    out.push_str(&format!("- Model: {}\n", stamp.adapter));
    out.push_str(&format!("- Path combiner: {}\n", stamp.combiner));
    out.push_str(&format!("- Holdouts: {}\n\n", sweep.holdouts()));

    for stage in [SplitStage::Validation, SplitStage::Test] {
        out.push_str(&format!("## {} (macro AUPRC)\n\n", stage_str(stage)));
        out.push_str("| feature set | pathways | superclasses | classes |\n");
        out.push_str("|---|---:|---:|---:|\n");
        for feature_set in sweep.feature_sets() {
            let cells: Vec<String> = Layer::ALL
                .iter()
                .map(|&layer| {
                    macro_average(&rows, feature_set, stage, layer, MetricKind::Auprc)
                        .map(|v| format!("{v:.4}"))
                        .unwrap_or_else(|| "-".to_string())
                })
                .collect();
            out.push_str(&format!("| {} | {} |\n", feature_set, cells.join(" | ")));
        }
        out.push('\n');
    }

    let times = time_requirements(sweep);
    if !times.is_empty() {
        out.push_str("## Time requirements (seconds per holdout)\n\n");
        out.push_str("| feature set | train | predict |\n");
        out.push_str("|---|---:|---:|\n");
        for row in times {
            out.push_str(&format!(
                "| {} | {:.3} ± {:.3} | {:.3} ± {:.3} |\n",
                row.feature_set,
                row.train_seconds_mean,
                row.train_seconds_std,
                row.predict_seconds_mean,
                row.predict_seconds_std
            ));
        }
        out.push('\n');
    }

    let mut failures: Vec<String> = sweep
        .failures()
        .iter()
        .chain(&report.test_failures)
        .map(|f| format!("- {f}"))
        .collect();
    for result in sweep.results().iter().chain(&report.test_results) {
        let unit = match result.holdout {
            Some(holdout) => format!("holdout {holdout}"),
            None => "test stage".to_string(),
        };
        for sample in &result.unreachable {
            failures.push(format!(
                "- feature set '{}', {unit}: sample '{}' unreachable: {}",
                result.feature_set, sample.sample_id, sample.reason
            ));
        }
    }
    if !failures.is_empty() {
        out.push_str("## Failed units\n\n");
        out.push_str(&failures.join("\n"));
        out.push('\n');
    }
    out
}
