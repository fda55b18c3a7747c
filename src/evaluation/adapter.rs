//! Contract between the evaluation driver and the model being evaluated.
//!
//! The network architecture and its training loop live outside this crate.
//! The driver only needs something that trains on a feature matrix with
//! multi-hot labels and returns per-layer scores for new rows.

use crate::dataset::{FeatureMatrix, LabelMatrix};
use crate::hierarchy::PerLayer;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("training failed: {0}")]
    Training(String),
    #[error("prediction failed: {0}")]
    Prediction(String),
}

/// A trainable model. Calls are synchronous and may be slow; the driver runs
/// them on blocking worker threads.
pub trait ModelAdapter: Send + Sync + 'static {
    /// A trained model.
    type Handle: Send + 'static;

    fn name(&self) -> &str {
        "model"
    }

    fn train(
        &self,
        features: &FeatureMatrix,
        labels: &LabelMatrix,
    ) -> Result<Self::Handle, AdapterError>;

    /// One score vector per layer for every row of `features`, indexed by the
    /// hierarchy's node indices. Non-finite scores mark unscored nodes.
    fn predict(
        &self,
        handle: &Self::Handle,
        features: &FeatureMatrix,
    ) -> Result<Vec<PerLayer<Vec<f64>>>, AdapterError>;
}
