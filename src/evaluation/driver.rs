//! Holdout sweep over feature sets, then a single final test stage.
//!
//! A *unit* is one `(feature_set, holdout)` pair: train on the holdout's
//! sub-train part, predict its validation part, project every prediction
//! onto a legal path and score it. Units are independent and run on
//! blocking worker threads; their results are reduced per feature set only
//! after every unit has finished, in holdout order.
//!
//! The test split is touched exactly once per feature set, by
//! [`EvaluationDriver::evaluate_test`], which consumes a completed
//! [`HoldoutSweep`]. There is no per-holdout path to the test data.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::consistency::{
    ConsistencyEnforcer, ConsistencyError, ProductCombiner, ScoreCombiner, DEFAULT_TIE_EPSILON,
};
use crate::dataset::Dataset;
use crate::hierarchy::{HierarchyGraph, Layer};
use crate::split::{SplitAssignment, SplitError, SplitStage};

use super::adapter::ModelAdapter;
use super::metrics::{
    class_metrics, AggregatedMetric, ClassMetrics, MetricAccumulator, MetricKind,
};
use super::observer::{EvaluationObserver, UnitEvent};

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct EvaluationOptions {
    /// Maximum number of units in flight.
    pub concurrency: usize,
    /// Tie tolerance handed to the consistency enforcer.
    pub epsilon: f64,
    pub combiner: Arc<dyn ScoreCombiner>,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            epsilon: DEFAULT_TIE_EPSILON,
            combiner: Arc::new(ProductCombiner),
        }
    }
}

impl std::fmt::Debug for EvaluationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationOptions")
            .field("concurrency", &self.concurrency)
            .field("epsilon", &self.epsilon)
            .field("combiner", &self.combiner.name())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("no feature sets selected")]
    EmptyFeatureSets,
    #[error("feature set '{name}' is not present in every sample (available: {available})")]
    UnknownFeatureSet { name: String, available: String },
    #[error("feature set '{0}' is selected more than once")]
    DuplicateFeatureSet(String),
    #[error("split assignment covers {assignment} samples but the dataset has {dataset}")]
    AssignmentMismatch { assignment: usize, dataset: usize },
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error("holdout sweep was cancelled with {abandoned} units abandoned; the test stage needs a complete sweep")]
    SweepCancelled { abandoned: usize },
    #[error("holdout sweep was produced from a different split assignment")]
    ForeignSweep,
}

/// Outcome of one successful unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitResult {
    pub feature_set: String,
    /// The stage that was evaluated: `validation` or `test`.
    pub stage: SplitStage,
    /// `None` for the final test stage.
    pub holdout: Option<usize>,
    pub n_train: usize,
    pub n_evaluated: usize,
    pub metrics: Vec<ClassMetrics>,
    /// Share of evaluated samples whose independent argmaxes were already legal.
    pub consistency_rate: f64,
    /// Evaluated samples for which no legal path could be scored.
    pub unreachable: Vec<UnreachableSample>,
    pub train_seconds: f64,
    pub predict_seconds: f64,
}

/// A sample the enforcer could not place on any legal path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnreachableSample {
    pub sample_id: String,
    pub reason: String,
}

/// An isolated unit failure; other units are unaffected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub feature_set: String,
    pub stage: SplitStage,
    pub holdout: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.holdout {
            Some(holdout) => write!(
                f,
                "feature set '{}', holdout {holdout}: {}",
                self.feature_set, self.message
            ),
            None => write!(
                f,
                "feature set '{}', test stage: {}",
                self.feature_set, self.message
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedClassMetric {
    pub layer: Layer,
    pub class: String,
    pub metric: MetricKind,
    pub aggregate: AggregatedMetric,
}

/// Cross-holdout summary for one feature set.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureSetAggregate {
    pub feature_set: String,
    pub holdouts_completed: usize,
    pub holdouts_failed: usize,
    pub metrics: Vec<AggregatedClassMetric>,
    pub consistency_rate: Option<AggregatedMetric>,
    pub train_seconds: Option<AggregatedMetric>,
    pub predict_seconds: Option<AggregatedMetric>,
}

/// Everything the holdout stage produced. Only the driver builds one.
#[derive(Debug, Clone, Serialize)]
pub struct HoldoutSweep {
    status: SweepStatus,
    feature_sets: Vec<String>,
    split_fingerprint: String,
    holdouts: usize,
    results: Vec<UnitResult>,
    failures: Vec<UnitFailure>,
    abandoned: usize,
    aggregates: Vec<FeatureSetAggregate>,
}

impl HoldoutSweep {
    pub fn status(&self) -> SweepStatus {
        self.status
    }

    pub fn is_complete(&self) -> bool {
        self.status == SweepStatus::Completed
    }

    pub fn feature_sets(&self) -> &[String] {
        &self.feature_sets
    }

    pub fn split_fingerprint(&self) -> &str {
        &self.split_fingerprint
    }

    pub fn holdouts(&self) -> usize {
        self.holdouts
    }

    /// Ordered by feature set (selection order), then holdout.
    pub fn results(&self) -> &[UnitResult] {
        &self.results
    }

    pub fn failures(&self) -> &[UnitFailure] {
        &self.failures
    }

    /// Units never started because of cancellation.
    pub fn abandoned(&self) -> usize {
        self.abandoned
    }

    pub fn aggregates(&self) -> &[FeatureSetAggregate] {
        &self.aggregates
    }

    pub fn aggregate(&self, feature_set: &str) -> Option<&FeatureSetAggregate> {
        self.aggregates.iter().find(|a| a.feature_set == feature_set)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub sweep: HoldoutSweep,
    pub test_results: Vec<UnitResult>,
    pub test_failures: Vec<UnitFailure>,
}

#[derive(Debug, Clone)]
struct UnitKey {
    feature_set: String,
    holdout: Option<usize>,
}

impl UnitKey {
    fn stage(&self) -> SplitStage {
        match self.holdout {
            Some(_) => SplitStage::Validation,
            None => SplitStage::Test,
        }
    }

    fn failure(&self, message: impl Into<String>) -> UnitFailure {
        UnitFailure {
            feature_set: self.feature_set.clone(),
            stage: self.stage(),
            holdout: self.holdout,
            message: message.into(),
        }
    }
}

pub struct EvaluationDriver<A: ModelAdapter> {
    adapter: Arc<A>,
    graph: Arc<HierarchyGraph>,
    dataset: Arc<Dataset>,
    assignment: Arc<SplitAssignment>,
    options: EvaluationOptions,
    split_fingerprint: String,
}

impl<A: ModelAdapter> EvaluationDriver<A> {
    pub fn new(
        adapter: Arc<A>,
        graph: Arc<HierarchyGraph>,
        dataset: Arc<Dataset>,
        assignment: Arc<SplitAssignment>,
        options: EvaluationOptions,
    ) -> Self {
        let split_fingerprint = assignment.fingerprint();
        Self {
            adapter,
            graph,
            dataset,
            assignment,
            options,
            split_fingerprint,
        }
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn options(&self) -> &EvaluationOptions {
        &self.options
    }

    pub fn split_fingerprint(&self) -> &str {
        &self.split_fingerprint
    }

    /// Run every `(feature_set, holdout)` unit.
    ///
    /// Configuration problems fail before any unit starts. Adapter failures
    /// are recorded per unit. When `cancel_flag` is raised, units that have
    /// not started are abandoned, running units finish and are kept, and the
    /// sweep is marked [`SweepStatus::Cancelled`].
    pub async fn evaluate_holdouts(
        &self,
        feature_sets: &[String],
        observer: Option<&dyn EvaluationObserver>,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<HoldoutSweep, EvaluationError> {
        self.preflight(feature_sets)?;

        let holdouts = self.assignment.holdouts.len();
        tracing::info!(
            feature_sets = feature_sets.len(),
            holdouts,
            concurrency = self.options.concurrency,
            adapter = self.adapter.name(),
            "starting holdout sweep"
        );

        let units: Vec<UnitKey> = feature_sets
            .iter()
            .flat_map(|feature_set| {
                (1..=holdouts).map(move |holdout| UnitKey {
                    feature_set: feature_set.clone(),
                    holdout: Some(holdout),
                })
            })
            .collect();

        let events = self.run_units(units, observer, cancel_flag).await;
        let abandoned = events.iter().filter(|e| e.is_none()).count();
        let (results, failures) = collect_events(events.into_iter().flatten(), feature_sets);

        let aggregates = feature_sets
            .iter()
            .map(|feature_set| aggregate_feature_set(feature_set, &results, &failures))
            .collect();

        let status = if abandoned > 0 {
            tracing::warn!(abandoned, "holdout sweep cancelled");
            SweepStatus::Cancelled
        } else {
            SweepStatus::Completed
        };
        tracing::info!(
            completed = results.len(),
            failed = failures.len(),
            abandoned,
            "holdout sweep finished"
        );

        Ok(HoldoutSweep {
            status,
            feature_sets: feature_sets.to_vec(),
            split_fingerprint: self.split_fingerprint.clone(),
            holdouts,
            results,
            failures,
            abandoned,
            aggregates,
        })
    }

    /// Retrain each feature set on the whole remainder and score it on the
    /// test split. Refuses a cancelled sweep or one from another split.
    pub async fn evaluate_test(
        &self,
        sweep: HoldoutSweep,
    ) -> Result<EvaluationReport, EvaluationError> {
        self.evaluate_test_with_observer(sweep, None).await
    }

    pub async fn evaluate_test_with_observer(
        &self,
        sweep: HoldoutSweep,
        observer: Option<&dyn EvaluationObserver>,
    ) -> Result<EvaluationReport, EvaluationError> {
        if sweep.status == SweepStatus::Cancelled {
            return Err(EvaluationError::SweepCancelled {
                abandoned: sweep.abandoned,
            });
        }
        if sweep.split_fingerprint != self.split_fingerprint {
            return Err(EvaluationError::ForeignSweep);
        }
        self.preflight(&sweep.feature_sets)?;

        tracing::info!(
            feature_sets = sweep.feature_sets.len(),
            test_samples = self.assignment.test.len(),
            "starting test stage"
        );
        let units: Vec<UnitKey> = sweep
            .feature_sets
            .iter()
            .map(|feature_set| UnitKey {
                feature_set: feature_set.clone(),
                holdout: None,
            })
            .collect();
        let events = self.run_units(units, observer, None).await;
        let (test_results, test_failures) =
            collect_events(events.into_iter().flatten(), &sweep.feature_sets);

        Ok(EvaluationReport {
            sweep,
            test_results,
            test_failures,
        })
    }

    fn preflight(&self, feature_sets: &[String]) -> Result<(), EvaluationError> {
        if feature_sets.is_empty() {
            return Err(EvaluationError::EmptyFeatureSets);
        }
        let available = self.dataset.feature_sets();
        let mut seen = BTreeSet::new();
        for name in feature_sets {
            if !seen.insert(name.as_str()) {
                return Err(EvaluationError::DuplicateFeatureSet(name.clone()));
            }
            if !available.contains(name) {
                return Err(EvaluationError::UnknownFeatureSet {
                    name: name.clone(),
                    available: available.join(", "),
                });
            }
        }
        if self.assignment.n_samples != self.dataset.len() {
            return Err(EvaluationError::AssignmentMismatch {
                assignment: self.assignment.n_samples,
                dataset: self.dataset.len(),
            });
        }
        self.assignment.verify()?;
        Ok(())
    }

    /// `None` marks a unit abandoned after cancellation.
    async fn run_units(
        &self,
        units: Vec<UnitKey>,
        observer: Option<&dyn EvaluationObserver>,
        cancel_flag: Option<&AtomicBool>,
    ) -> Vec<Option<UnitEvent>> {
        let concurrency = self.options.concurrency.max(1);
        stream::iter(units.into_iter().map(|unit| {
            let adapter = Arc::clone(&self.adapter);
            let graph = Arc::clone(&self.graph);
            let dataset = Arc::clone(&self.dataset);
            let assignment = Arc::clone(&self.assignment);
            let options = self.options.clone();
            async move {
                if cancel_flag.is_some_and(|flag| flag.load(AtomicOrdering::Relaxed)) {
                    tracing::debug!(
                        feature_set = %unit.feature_set,
                        holdout = ?unit.holdout,
                        "unit abandoned"
                    );
                    return None;
                }

                let key = unit.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    run_unit(
                        adapter.as_ref(),
                        &graph,
                        &dataset,
                        &assignment,
                        &options,
                        &key,
                    )
                })
                .await;

                let event = match joined {
                    Ok(Ok(result)) => {
                        tracing::debug!(
                            feature_set = %result.feature_set,
                            holdout = ?result.holdout,
                            consistency_rate = result.consistency_rate,
                            "unit completed"
                        );
                        UnitEvent::Completed(result)
                    }
                    Ok(Err(failure)) => {
                        tracing::warn!(%failure, "unit failed");
                        UnitEvent::Failed(failure)
                    }
                    Err(err) => {
                        let failure = unit.failure(format!("unit worker failed: {err}"));
                        tracing::warn!(%failure, "unit failed");
                        UnitEvent::Failed(failure)
                    }
                };

                if let Some(observer) = observer {
                    if let Err(err) = observer.on_unit(&event).await {
                        tracing::warn!(error = %err, "evaluation observer failed");
                    }
                }
                Some(event)
            }
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await
    }
}

fn run_unit<A: ModelAdapter>(
    adapter: &A,
    graph: &HierarchyGraph,
    dataset: &Dataset,
    assignment: &SplitAssignment,
    options: &EvaluationOptions,
    unit: &UnitKey,
) -> Result<UnitResult, UnitFailure> {
    let (train_idx, eval_idx) = match unit.holdout {
        Some(holdout) => {
            let split = assignment.holdout(holdout).ok_or_else(|| {
                unit.failure(format!("holdout {holdout} is not part of the split"))
            })?;
            (split.sub_train.as_slice(), split.validation.as_slice())
        }
        None => (assignment.remainder.as_slice(), assignment.test.as_slice()),
    };

    let train_features = dataset
        .feature_matrix(&unit.feature_set, train_idx)
        .map_err(|e| unit.failure(e.to_string()))?;
    let (train_labels, _) = dataset.label_matrix(graph, train_idx);

    let started = Instant::now();
    let handle = adapter
        .train(&train_features, &train_labels)
        .map_err(|e| unit.failure(e.to_string()))?;
    let train_seconds = started.elapsed().as_secs_f64();

    let eval_features = dataset
        .feature_matrix(&unit.feature_set, eval_idx)
        .map_err(|e| unit.failure(e.to_string()))?;
    let started = Instant::now();
    let scores = adapter
        .predict(&handle, &eval_features)
        .map_err(|e| unit.failure(e.to_string()))?;
    let predict_seconds = started.elapsed().as_secs_f64();

    if scores.len() != eval_idx.len() {
        return Err(unit.failure(format!(
            "adapter returned {} score rows for {} samples",
            scores.len(),
            eval_idx.len()
        )));
    }

    let enforcer = ConsistencyEnforcer::new(graph)
        .with_combiner(Arc::clone(&options.combiner))
        .with_epsilon(options.epsilon);
    let mut predicted = Vec::with_capacity(scores.len());
    let mut fast_paths = 0usize;
    let mut unreachable = Vec::new();
    for (row, outcome) in enforcer.enforce_batch(&scores).into_iter().enumerate() {
        match outcome {
            Ok(prediction) => {
                if prediction.fast_path {
                    fast_paths += 1;
                }
                predicted.push(Some(prediction.path));
            }
            Err(ConsistencyError::UnreachableHierarchy { reason }) => {
                let sample_id = dataset.samples[eval_idx[row]].id.clone();
                tracing::warn!(
                    feature_set = %unit.feature_set,
                    sample = %sample_id,
                    reason = %reason,
                    "sample has no reachable legal path"
                );
                unreachable.push(UnreachableSample { sample_id, reason });
                predicted.push(None);
            }
            Err(err @ ConsistencyError::ScoreShape { .. }) => {
                return Err(unit.failure(err.to_string()));
            }
        }
    }

    let (truth, _) = dataset.label_matrix(graph, eval_idx);
    let metrics = class_metrics(graph, &truth, &predicted, &scores);
    let consistency_rate = if eval_idx.is_empty() {
        0.0
    } else {
        fast_paths as f64 / eval_idx.len() as f64
    };

    Ok(UnitResult {
        feature_set: unit.feature_set.clone(),
        stage: unit.stage(),
        holdout: unit.holdout,
        n_train: train_idx.len(),
        n_evaluated: eval_idx.len(),
        metrics,
        consistency_rate,
        unreachable,
        train_seconds,
        predict_seconds,
    })
}

/// Split events and order both sides by feature-set selection order, then holdout.
fn collect_events(
    events: impl Iterator<Item = UnitEvent>,
    feature_sets: &[String],
) -> (Vec<UnitResult>, Vec<UnitFailure>) {
    let position = |name: &str| feature_sets.iter().position(|f| f == name);
    let mut results = Vec::new();
    let mut failures = Vec::new();
    for event in events {
        match event {
            UnitEvent::Completed(result) => results.push(result),
            UnitEvent::Failed(failure) => failures.push(failure),
        }
    }
    results.sort_by_key(|r| (position(&r.feature_set), r.holdout));
    failures.sort_by_key(|f| (position(&f.feature_set), f.holdout));
    (results, failures)
}

fn aggregate_feature_set(
    feature_set: &str,
    results: &[UnitResult],
    failures: &[UnitFailure],
) -> FeatureSetAggregate {
    let units: Vec<&UnitResult> = results
        .iter()
        .filter(|r| r.feature_set == feature_set)
        .collect();

    let mut metrics = Vec::new();
    if let Some(first) = units.first() {
        for (pos, class) in first.metrics.iter().enumerate() {
            for kind in MetricKind::ALL {
                let accumulator: MetricAccumulator = units
                    .iter()
                    .filter_map(|unit| unit.metrics.get(pos))
                    .filter_map(|m| m.value(kind))
                    .collect();
                if let Some(aggregate) = accumulator.finish() {
                    metrics.push(AggregatedClassMetric {
                        layer: class.layer,
                        class: class.class.clone(),
                        metric: kind,
                        aggregate,
                    });
                }
            }
        }
    }

    let summarize = |f: fn(&UnitResult) -> f64| {
        units.iter().map(|u| f(u)).collect::<MetricAccumulator>().finish()
    };

    FeatureSetAggregate {
        feature_set: feature_set.to_string(),
        holdouts_completed: units.len(),
        holdouts_failed: failures
            .iter()
            .filter(|f| f.feature_set == feature_set)
            .count(),
        metrics,
        consistency_rate: summarize(|u| u.consistency_rate),
        train_seconds: summarize(|u| u.train_seconds),
        predict_seconds: summarize(|u| u.predict_seconds),
    }
}
