use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use npc_harness::dataset::{Dataset, FeatureMatrix, LabelMatrix, LabeledSample};
use npc_harness::evaluation::{
    performance_rows, render_evaluation_markdown, AdapterError, CentroidAdapter, CentroidModel,
    EvaluationDriver, EvaluationError, EvaluationObserver, EvaluationOptions, JsonlUnitObserver,
    ModelAdapter, ObserverError, RunStamp, SweepStatus, UnitEvent,
};
use npc_harness::hierarchy::{HierarchyGraph, PerLayer};
use npc_harness::split::{SplitAssignment, SplitConfig, SplitStage, StratifiedSplitPlanner};
use tempfile::tempdir;

const CLASSES: [(&str, &str, &str, usize); 4] = [
    ("P1", "S1", "C1", 20),
    ("P1", "S1", "C2", 20),
    ("P2", "S2", "C3", 20),
    ("P2", "S3", "C4", 20),
];

/// Well-separated one-hot features per class under two feature-set names.
fn dataset() -> Dataset {
    let mut samples = Vec::new();
    for (class_idx, (p, s, c, n)) in CLASSES.into_iter().enumerate() {
        for k in 0..n {
            let mut values = vec![0.0; CLASSES.len()];
            values[class_idx] = 1.0;
            values.push((k % 5) as f64 * 0.01);
            let id = format!("m{:03}", samples.len());
            samples.push(
                LabeledSample::new(
                    id,
                    PerLayer::new(vec![p.to_string()], vec![s.to_string()], vec![c.to_string()]),
                )
                .with_feature("maccs", values.clone())
                .with_feature("layered", values),
            );
        }
    }
    Dataset::new("driver", samples)
}

struct Fixture {
    graph: Arc<HierarchyGraph>,
    dataset: Arc<Dataset>,
    assignment: Arc<SplitAssignment>,
}

fn fixture(holdouts: usize) -> Fixture {
    let dataset = dataset();
    let graph = dataset.derive_hierarchy().unwrap();
    let assignment = StratifiedSplitPlanner::new(SplitConfig {
        test_size: 0.2,
        validation_size: 0.25,
        holdouts,
        seed: 11,
    })
    .unwrap()
    .plan(&dataset)
    .unwrap();
    Fixture {
        graph: Arc::new(graph),
        dataset: Arc::new(dataset),
        assignment: Arc::new(assignment),
    }
}

fn driver<A: ModelAdapter>(
    fixture: &Fixture,
    adapter: A,
    concurrency: usize,
) -> EvaluationDriver<A> {
    EvaluationDriver::new(
        Arc::new(adapter),
        Arc::clone(&fixture.graph),
        Arc::clone(&fixture.dataset),
        Arc::clone(&fixture.assignment),
        EvaluationOptions {
            concurrency,
            ..EvaluationOptions::default()
        },
    )
}

fn names(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|x| x.to_string()).collect()
}

/// Centroid model that refuses to train on one feature set.
struct FailingOn(&'static str);

impl ModelAdapter for FailingOn {
    type Handle = CentroidModel;

    fn train(
        &self,
        features: &FeatureMatrix,
        labels: &LabelMatrix,
    ) -> Result<CentroidModel, AdapterError> {
        if features.feature_set == self.0 {
            return Err(AdapterError::Training("diverged".to_string()));
        }
        CentroidAdapter.train(features, labels)
    }

    fn predict(
        &self,
        handle: &CentroidModel,
        features: &FeatureMatrix,
    ) -> Result<Vec<PerLayer<Vec<f64>>>, AdapterError> {
        CentroidAdapter.predict(handle, features)
    }
}

/// Raises the cancel flag from inside the first training call.
struct CancelOnTrain {
    flag: Arc<AtomicBool>,
}

impl ModelAdapter for CancelOnTrain {
    type Handle = CentroidModel;

    fn train(
        &self,
        features: &FeatureMatrix,
        labels: &LabelMatrix,
    ) -> Result<CentroidModel, AdapterError> {
        self.flag.store(true, Ordering::SeqCst);
        CentroidAdapter.train(features, labels)
    }

    fn predict(
        &self,
        handle: &CentroidModel,
        features: &FeatureMatrix,
    ) -> Result<Vec<PerLayer<Vec<f64>>>, AdapterError> {
        CentroidAdapter.predict(handle, features)
    }
}

/// Centroid scores, except the first evaluated row is all NaN.
struct BlankFirstRow;

impl ModelAdapter for BlankFirstRow {
    type Handle = CentroidModel;

    fn train(
        &self,
        features: &FeatureMatrix,
        labels: &LabelMatrix,
    ) -> Result<CentroidModel, AdapterError> {
        CentroidAdapter.train(features, labels)
    }

    fn predict(
        &self,
        handle: &CentroidModel,
        features: &FeatureMatrix,
    ) -> Result<Vec<PerLayer<Vec<f64>>>, AdapterError> {
        let mut scores = CentroidAdapter.predict(handle, features)?;
        if let Some(first) = scores.first_mut() {
            *first = first.clone().map(|_, values| vec![f64::NAN; values.len()]);
        }
        Ok(scores)
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<(String, Option<usize>)>>,
}

#[async_trait::async_trait]
impl EvaluationObserver for RecordingObserver {
    async fn on_unit(&self, event: &UnitEvent) -> Result<(), ObserverError> {
        self.events
            .lock()
            .unwrap()
            .push((event.feature_set().to_string(), event.holdout()));
        Ok(())
    }
}

struct BrokenObserver;

#[async_trait::async_trait]
impl EvaluationObserver for BrokenObserver {
    async fn on_unit(&self, _event: &UnitEvent) -> Result<(), ObserverError> {
        Err(ObserverError::Message("sink offline".to_string()))
    }
}

#[tokio::test]
async fn sweep_then_test_on_separable_data() {
    let fixture = fixture(3);
    let driver = driver(&fixture, CentroidAdapter, 4);
    let sweep = driver
        .evaluate_holdouts(&names(&["maccs", "layered"]), None, None)
        .await
        .unwrap();

    assert_eq!(sweep.status(), SweepStatus::Completed);
    assert_eq!(sweep.results().len(), 6);
    assert!(sweep.failures().is_empty());
    let order: Vec<(&str, Option<usize>)> = sweep
        .results()
        .iter()
        .map(|r| (r.feature_set.as_str(), r.holdout))
        .collect();
    assert_eq!(
        order,
        vec![
            ("maccs", Some(1)),
            ("maccs", Some(2)),
            ("maccs", Some(3)),
            ("layered", Some(1)),
            ("layered", Some(2)),
            ("layered", Some(3)),
        ]
    );

    let aggregate = sweep.aggregate("maccs").unwrap();
    assert_eq!(aggregate.holdouts_completed, 3);
    for metric in &aggregate.metrics {
        assert!(
            (metric.aggregate.mean - 1.0).abs() < 1e-9,
            "{} {} {:?} = {}",
            metric.layer,
            metric.class,
            metric.metric,
            metric.aggregate.mean
        );
        assert_eq!(metric.aggregate.n, 3);
    }
    let consistency = aggregate.consistency_rate.unwrap();
    assert!((consistency.mean - 1.0).abs() < 1e-9);

    let report = driver.evaluate_test(sweep).await.unwrap();
    assert_eq!(report.test_results.len(), 2);
    for result in &report.test_results {
        assert_eq!(result.stage, SplitStage::Test);
        assert_eq!(result.holdout, None);
        assert_eq!(result.n_evaluated, fixture.assignment.test.len());
        assert_eq!(result.n_train, fixture.assignment.remainder.len());
        assert!(result.unreachable.is_empty());
    }

    let rows = performance_rows(&report);
    assert!(rows.iter().any(|r| r.stage == SplitStage::Test));
    assert!(rows
        .iter()
        .filter(|r| r.stage == SplitStage::Validation && r.metric != "consistency_rate")
        .all(|r| r.holdouts == 3));
}

#[tokio::test]
async fn adapter_failures_are_isolated_per_unit() {
    let fixture = fixture(2);
    let driver = driver(&fixture, FailingOn("layered"), 2);
    let sweep = driver
        .evaluate_holdouts(&names(&["maccs", "layered"]), None, None)
        .await
        .unwrap();

    assert_eq!(sweep.status(), SweepStatus::Completed);
    assert_eq!(sweep.results().len(), 2);
    assert_eq!(sweep.failures().len(), 2);
    for failure in sweep.failures() {
        assert_eq!(failure.feature_set, "layered");
        assert!(failure.message.contains("diverged"));
        assert!(failure.to_string().contains("holdout"));
    }
    let layered = sweep.aggregate("layered").unwrap();
    assert_eq!(layered.holdouts_completed, 0);
    assert_eq!(layered.holdouts_failed, 2);
    assert!(layered.metrics.is_empty());
    assert_eq!(sweep.aggregate("maccs").unwrap().holdouts_completed, 2);

    let report = driver.evaluate_test(sweep).await.unwrap();
    assert_eq!(report.test_results.len(), 1);
    assert_eq!(report.test_failures.len(), 1);
    assert_eq!(report.test_failures[0].holdout, None);
}

#[tokio::test]
async fn unreachable_samples_are_named_in_results_and_report() {
    let fixture = fixture(2);
    let driver = driver(&fixture, BlankFirstRow, 2);
    let sweep = driver
        .evaluate_holdouts(&names(&["maccs"]), None, None)
        .await
        .unwrap();

    assert!(sweep.failures().is_empty());
    for result in sweep.results() {
        let holdout = fixture.assignment.holdout(result.holdout.unwrap()).unwrap();
        let expected = &fixture.dataset.samples[holdout.validation[0]].id;
        assert_eq!(result.unreachable.len(), 1);
        assert_eq!(&result.unreachable[0].sample_id, expected);
        assert!(result.unreachable[0].reason.contains("legal paths"));
        assert_eq!(result.n_evaluated, holdout.validation.len());
    }

    let report = driver.evaluate_test(sweep).await.unwrap();
    let test_sample = &fixture.dataset.samples[fixture.assignment.test[0]].id;
    assert_eq!(&report.test_results[0].unreachable[0].sample_id, test_sample);

    let stamp = RunStamp::new(11, fixture.assignment.fingerprint(), "centroid", "product");
    let markdown = render_evaluation_markdown(&report, &stamp);
    assert!(markdown.contains("## Failed units"));
    assert!(markdown.contains(&format!("test stage: sample '{test_sample}' unreachable")));
    assert_eq!(markdown.matches(" unreachable: ").count(), 3);
}

#[tokio::test]
async fn aggregates_do_not_depend_on_completion_order() {
    let fixture = fixture(4);
    let feature_sets = names(&["maccs", "layered"]);

    let serial = driver(&fixture, CentroidAdapter, 1)
        .evaluate_holdouts(&feature_sets, None, None)
        .await
        .unwrap();
    let parallel = driver(&fixture, CentroidAdapter, 8)
        .evaluate_holdouts(&feature_sets, None, None)
        .await
        .unwrap();

    for feature_set in &feature_sets {
        let a = serial.aggregate(feature_set).unwrap();
        let b = parallel.aggregate(feature_set).unwrap();
        assert_eq!(
            serde_json::to_value(&a.metrics).unwrap(),
            serde_json::to_value(&b.metrics).unwrap()
        );
        assert_eq!(a.consistency_rate, b.consistency_rate);
    }
}

#[tokio::test]
async fn cancellation_keeps_finished_units_and_blocks_the_test_stage() {
    let fixture = fixture(3);
    let flag = Arc::new(AtomicBool::new(false));
    let adapter = CancelOnTrain {
        flag: Arc::clone(&flag),
    };
    let driver = driver(&fixture, adapter, 1);
    let sweep = driver
        .evaluate_holdouts(&names(&["maccs", "layered"]), None, Some(flag.as_ref()))
        .await
        .unwrap();

    assert_eq!(sweep.status(), SweepStatus::Cancelled);
    assert_eq!(sweep.results().len(), 1);
    assert_eq!(sweep.abandoned(), 5);
    assert_eq!(sweep.aggregate("maccs").unwrap().holdouts_completed, 1);

    let err = driver.evaluate_test(sweep).await.unwrap_err();
    assert!(matches!(err, EvaluationError::SweepCancelled { abandoned: 5 }));
}

#[tokio::test]
async fn raised_flag_abandons_everything() {
    let fixture = fixture(2);
    let flag = AtomicBool::new(true);
    let sweep = driver(&fixture, CentroidAdapter, 2)
        .evaluate_holdouts(&names(&["maccs"]), None, Some(&flag))
        .await
        .unwrap();
    assert_eq!(sweep.status(), SweepStatus::Cancelled);
    assert!(sweep.results().is_empty());
    assert_eq!(sweep.abandoned(), 2);
}

#[tokio::test]
async fn configuration_errors_fail_before_any_unit() {
    let fixture = fixture(2);
    let driver = driver(&fixture, CentroidAdapter, 2);

    let err = driver.evaluate_holdouts(&[], None, None).await.unwrap_err();
    assert!(matches!(err, EvaluationError::EmptyFeatureSets));

    let err = driver
        .evaluate_holdouts(&names(&["maccs", "pubchem"]), None, None)
        .await
        .unwrap_err();
    match err {
        EvaluationError::UnknownFeatureSet { name, available } => {
            assert_eq!(name, "pubchem");
            assert!(available.contains("maccs"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = driver
        .evaluate_holdouts(&names(&["maccs", "maccs"]), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EvaluationError::DuplicateFeatureSet(_)));
}

#[tokio::test]
async fn sweep_from_another_split_is_refused() {
    let first = fixture(2);
    let sweep = driver(&first, CentroidAdapter, 2)
        .evaluate_holdouts(&names(&["maccs"]), None, None)
        .await
        .unwrap();

    let other = fixture(3);
    let err = driver(&other, CentroidAdapter, 2)
        .evaluate_test(sweep)
        .await
        .unwrap_err();
    assert!(matches!(err, EvaluationError::ForeignSweep));
}

#[tokio::test]
async fn observers_see_every_unit_and_their_errors_are_not_fatal() {
    let fixture = fixture(2);
    let driver = driver(&fixture, CentroidAdapter, 3);

    let observer = RecordingObserver::default();
    driver
        .evaluate_holdouts(&names(&["maccs", "layered"]), Some(&observer), None)
        .await
        .unwrap();
    let mut seen = observer.events.lock().unwrap().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("layered".to_string(), Some(1)),
            ("layered".to_string(), Some(2)),
            ("maccs".to_string(), Some(1)),
            ("maccs".to_string(), Some(2)),
        ]
    );

    let sweep = driver
        .evaluate_holdouts(&names(&["maccs"]), Some(&BrokenObserver), None)
        .await
        .unwrap();
    assert_eq!(sweep.results().len(), 2);
}

#[tokio::test]
async fn jsonl_observer_writes_one_line_per_unit() {
    #[derive(serde::Deserialize)]
    struct Line {
        outcome: String,
        feature_set: String,
        holdout: Option<usize>,
    }

    let fixture = fixture(2);
    let driver = driver(&fixture, FailingOn("layered"), 2);
    let dir = tempdir().unwrap();
    let path = dir.path().join("units.jsonl");

    let (sink, worker) = JsonlUnitObserver::new(&path).unwrap();
    let sweep = driver
        .evaluate_holdouts(&names(&["maccs", "layered"]), Some(&sink), None)
        .await
        .unwrap();
    driver
        .evaluate_test_with_observer(sweep, Some(&sink))
        .await
        .unwrap();
    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<Line> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines.iter().filter(|l| l.outcome == "failed").count(), 3);
    assert!(lines
        .iter()
        .filter(|l| l.outcome == "failed")
        .all(|l| l.feature_set == "layered"));
    assert_eq!(lines.iter().filter(|l| l.holdout.is_none()).count(), 2);
}
