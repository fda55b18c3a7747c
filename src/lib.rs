#![forbid(unsafe_code)]

//! # npc-harness
//!
//! Hierarchy-consistent evaluation for natural-product classifiers.
//!
//! A molecule is labeled on three nested layers: pathway, superclass and
//! class. The labels form a layered DAG, and only connected
//! (pathway, superclass, class) triples are meaningful. This crate provides:
//!
//! - the hierarchy itself, with coverage analysis of labeled datasets;
//! - a consistency enforcer that projects independent per-layer scores onto
//!   the best legal path ("static attention" over the DAG);
//! - leakage-safe nested stratified splits and a concurrent holdout driver
//!   that compares feature sets without ever touching the test split until
//!   the final stage.
//!
//! The model itself is an external collaborator behind [`ModelAdapter`].

pub mod config;
pub mod consistency;
pub mod coverage;
pub mod dataset;
pub mod evaluation;
pub mod features;
pub mod hierarchy;
pub mod split;

pub use config::{load_config_from_path, ConfigError, HarnessConfig};
pub use consistency::{
    CombinerRegistry, ConsistencyEnforcer, ConsistencyError, ConsistentPrediction, ScoreCombiner,
};
pub use coverage::{coverage, CoverageReport};
pub use dataset::{load_dataset_from_path, Dataset, DatasetError, LabeledSample};
pub use evaluation::{
    AdapterError, CentroidAdapter, EvaluationDriver, EvaluationError, EvaluationObserver,
    EvaluationOptions, EvaluationReport, HoldoutSweep, JsonlUnitObserver, ModelAdapter,
    SweepStatus, UnitFailure,
};
pub use features::{FeatureSettings, FeatureSettingsError};
pub use hierarchy::{HierarchyError, HierarchyGraph, Layer, LegalPath, PerLayer};
pub use split::{SplitAssignment, SplitConfig, SplitError, StratifiedSplitPlanner};
