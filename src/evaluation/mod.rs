//! Feature-set comparison over nested holdouts.

pub mod adapter;
pub mod centroid;
pub mod driver;
pub mod metrics;
pub mod observer;
pub mod report;

pub use adapter::{AdapterError, ModelAdapter};
pub use centroid::{CentroidAdapter, CentroidModel};
pub use driver::{
    AggregatedClassMetric, EvaluationDriver, EvaluationError, EvaluationOptions,
    EvaluationReport, FeatureSetAggregate, HoldoutSweep, SweepStatus, UnitFailure, UnitResult,
    UnreachableSample, DEFAULT_CONCURRENCY,
};
pub use metrics::{
    average_precision, class_metrics, AggregatedMetric, ClassMetrics, MetricAccumulator,
    MetricKind,
};
pub use observer::{
    EvaluationObserver, JsonlUnitObserver, ObserverError, ObserverWorker, UnitEvent,
};
pub use report::{
    barplot_series, csv_field, performance_rows, render_evaluation_markdown,
    render_performance_csv, render_time_requirements_csv, time_requirements,
    write_barplot_series, write_performance_csv, BarplotPoint, BarplotSeries, PerformanceRow,
    RunStamp, TimeRequirementRow,
};
