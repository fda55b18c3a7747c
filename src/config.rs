//! Run configuration, loaded from JSON.
//!
//! ```json
//! {
//!   "split": { "test_size": 0.2, "validation_size": 0.2, "holdouts": 10, "seed": 42 },
//!   "evaluation": { "concurrency": 4, "epsilon": 1e-12, "combiner": "product" },
//!   "feature_sets": { "layered": true, "maccs": true }
//! }
//! ```
//!
//! Every section and field is optional; missing values take their defaults.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consistency::{CombinerRegistry, DEFAULT_TIE_EPSILON};
use crate::evaluation::{EvaluationOptions, DEFAULT_CONCURRENCY};
use crate::features::{FeatureSettings, FeatureSettingsError};
use crate::split::{SplitConfig, SplitError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Features(#[from] FeatureSettingsError),
    #[error("unknown combiner '{name}' (available: {available})")]
    UnknownCombiner { name: String, available: String },
    #[error("invalid evaluation settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    pub concurrency: usize,
    pub epsilon: f64,
    pub combiner: String,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            epsilon: DEFAULT_TIE_EPSILON,
            combiner: "product".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub split: SplitConfig,
    pub evaluation: EvaluationSettings,
    /// Include flags over the fingerprint catalog; empty means "decide on the command line".
    pub feature_sets: BTreeMap<String, bool>,
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.split.validate()?;
        if self.evaluation.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be >= 1".to_string()));
        }
        if !(self.evaluation.epsilon.is_finite() && self.evaluation.epsilon >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "epsilon must be a finite non-negative number, got {}",
                self.evaluation.epsilon
            )));
        }
        self.feature_settings()?;
        Ok(())
    }

    pub fn feature_settings(&self) -> Result<FeatureSettings, ConfigError> {
        Ok(FeatureSettings::from_map(&self.feature_sets)?)
    }

    /// Resolve the combiner name against `registry`.
    pub fn evaluation_options(
        &self,
        registry: &CombinerRegistry,
    ) -> Result<EvaluationOptions, ConfigError> {
        let combiner = registry.get(&self.evaluation.combiner).ok_or_else(|| {
            ConfigError::UnknownCombiner {
                name: self.evaluation.combiner.clone(),
                available: registry.list().join(", "),
            }
        })?;
        Ok(EvaluationOptions {
            concurrency: self.evaluation.concurrency,
            epsilon: self.evaluation.epsilon,
            combiner,
        })
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<HarnessConfig, ConfigError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let config: HarnessConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}
