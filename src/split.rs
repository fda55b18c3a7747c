//! Leakage-safe nested stratified splitting.
//!
//! Protocol:
//! 1. Every sample is assigned its *rarest class*: among all of its labels
//!    (any layer), the one with the smallest global support.
//! 2. One stratified split of the whole dataset yields `test` and the
//!    `remainder`. `test` is computed once and never changes afterwards.
//! 3. Each holdout draws an independent stratified split of the remainder
//!    (never of the full dataset) into `sub_train` and `validation`.
//!
//! All randomness is derived from a single run seed: the test split uses
//! stream 0 and holdout `k` uses stream `k`. Same seed, same dataset, same
//! assignment.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::hierarchy::Layer;

pub const DEFAULT_TEST_SIZE: f64 = 0.2;
pub const DEFAULT_VALIDATION_SIZE: f64 = 0.2;
pub const DEFAULT_HOLDOUTS: usize = 10;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Fraction of the full dataset reserved for the final test set.
    pub test_size: f64,
    /// Fraction of the remainder used for validation in each holdout.
    pub validation_size: f64,
    pub holdouts: usize,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_size: DEFAULT_TEST_SIZE,
            validation_size: DEFAULT_VALIDATION_SIZE,
            holdouts: DEFAULT_HOLDOUTS,
            seed: DEFAULT_SEED,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<(), SplitError> {
        for (name, value) in [
            ("test_size", self.test_size),
            ("validation_size", self.validation_size),
        ] {
            if !(value.is_finite() && value > 0.0 && value < 1.0) {
                return Err(SplitError::InvalidConfig(format!(
                    "{name} must be in (0, 1), got {value}"
                )));
            }
        }
        if self.holdouts == 0 {
            return Err(SplitError::InvalidConfig("holdouts must be >= 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("invalid split configuration: {0}")]
    InvalidConfig(String),
    #[error("sample '{sample_id}' has no labels to stratify on")]
    UnlabeledSample { sample_id: String },
    #[error(
        "insufficient samples for {layer} '{class}' in the {stage} split: \
         {available} samples cannot be split at fraction {requested_fraction} without leaving one side empty"
    )]
    InsufficientSamples {
        class: String,
        layer: Layer,
        stage: String,
        available: usize,
        requested_fraction: f64,
    },
    #[error("the {stage} split would be empty")]
    EmptySplit { stage: String },
    #[error("split assignment violates the leakage contract: {0}")]
    Leakage(String),
}

/// The label a sample is stratified on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stratum {
    pub layer: Layer,
    pub label: String,
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.layer, self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStage {
    Test,
    SubTrain,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldoutSplit {
    /// 1-based holdout number.
    pub holdout: usize,
    pub seed: u64,
    pub sub_train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Sample indices per split part, each part sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAssignment {
    pub seed: u64,
    pub n_samples: usize,
    pub test: Vec<usize>,
    pub remainder: Vec<usize>,
    pub holdouts: Vec<HoldoutSplit>,
}

impl SplitAssignment {
    pub fn holdout(&self, holdout: usize) -> Option<&HoldoutSplit> {
        self.holdouts.iter().find(|h| h.holdout == holdout)
    }

    /// Where `sample` sits during `holdout`. `None` for unknown holdouts or samples.
    pub fn stage_of(&self, sample: usize, holdout: usize) -> Option<SplitStage> {
        if self.test.binary_search(&sample).is_ok() {
            return self.holdout(holdout).map(|_| SplitStage::Test);
        }
        let split = self.holdout(holdout)?;
        if split.sub_train.binary_search(&sample).is_ok() {
            Some(SplitStage::SubTrain)
        } else if split.validation.binary_search(&sample).is_ok() {
            Some(SplitStage::Validation)
        } else {
            None
        }
    }

    /// Check the leakage contract: `test` and `remainder` partition the
    /// dataset, and every holdout partitions exactly the `remainder`.
    pub fn verify(&self) -> Result<(), SplitError> {
        let test: BTreeSet<usize> = self.test.iter().copied().collect();
        let remainder: BTreeSet<usize> = self.remainder.iter().copied().collect();
        if test.len() != self.test.len() || remainder.len() != self.remainder.len() {
            return Err(SplitError::Leakage("duplicate sample in test or remainder".into()));
        }
        if let Some(idx) = test.intersection(&remainder).next() {
            return Err(SplitError::Leakage(format!(
                "sample {idx} is in both test and remainder"
            )));
        }
        if test.len() + remainder.len() != self.n_samples
            || test.iter().chain(remainder.iter()).any(|&i| i >= self.n_samples)
        {
            return Err(SplitError::Leakage(
                "test and remainder do not cover the dataset exactly".into(),
            ));
        }

        for (pos, split) in self.holdouts.iter().enumerate() {
            if split.holdout != pos + 1 {
                return Err(SplitError::Leakage(format!(
                    "holdout at position {pos} is numbered {}",
                    split.holdout
                )));
            }
            let sub_train: BTreeSet<usize> = split.sub_train.iter().copied().collect();
            let validation: BTreeSet<usize> = split.validation.iter().copied().collect();
            if sub_train.len() != split.sub_train.len()
                || validation.len() != split.validation.len()
            {
                return Err(SplitError::Leakage(format!(
                    "holdout {} repeats a sample",
                    split.holdout
                )));
            }
            if let Some(idx) = sub_train.intersection(&validation).next() {
                return Err(SplitError::Leakage(format!(
                    "holdout {}: sample {idx} is in both sub-train and validation",
                    split.holdout
                )));
            }
            if let Some(idx) = sub_train.union(&validation).find(|i| test.contains(i)) {
                return Err(SplitError::Leakage(format!(
                    "holdout {}: test sample {idx} leaked into training or validation",
                    split.holdout
                )));
            }
            let union: BTreeSet<usize> = sub_train.union(&validation).copied().collect();
            if union != remainder {
                return Err(SplitError::Leakage(format!(
                    "holdout {}: sub-train and validation do not partition the remainder",
                    split.holdout
                )));
            }
        }
        Ok(())
    }

    /// Stable content hash; equal fingerprints mean identical splits.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

/// SplitMix64 step: decorrelated per-stream seeds from one run seed.
pub fn derive_seed(run_seed: u64, stream: u64) -> u64 {
    let mut z = run_seed.wrapping_add(stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Rarest label of every sample, in sample order.
///
/// Ties on support prefer the finer layer, then the lexicographically
/// smaller label.
pub fn rarest_class_strata(dataset: &Dataset) -> Result<Vec<Stratum>, SplitError> {
    let support = dataset.label_support();
    dataset
        .samples
        .iter()
        .map(|sample| {
            sample
                .labels
                .iter()
                .flat_map(|(layer, labels)| {
                    labels.iter().map(move |label| (layer, label.as_str()))
                })
                .min_by_key(|&(layer, label)| {
                    (
                        support.get(&(layer, label)).copied().unwrap_or(0),
                        Reverse(layer),
                        label,
                    )
                })
                .map(|(layer, label)| Stratum {
                    layer,
                    label: label.to_string(),
                })
                .ok_or_else(|| SplitError::UnlabeledSample {
                    sample_id: sample.id.clone(),
                })
        })
        .collect()
}

pub struct StratifiedSplitPlanner {
    config: SplitConfig,
}

impl StratifiedSplitPlanner {
    pub fn new(config: SplitConfig) -> Result<Self, SplitError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    pub fn plan(&self, dataset: &Dataset) -> Result<SplitAssignment, SplitError> {
        let strata = rarest_class_strata(dataset)?;
        let all: Vec<usize> = (0..dataset.len()).collect();

        let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, 0));
        let (test, remainder) =
            stratified_partition(&all, &strata, self.config.test_size, &mut rng, "test")?;

        let mut holdouts = Vec::with_capacity(self.config.holdouts);
        for holdout in 1..=self.config.holdouts {
            let seed = derive_seed(self.config.seed, holdout as u64);
            let mut rng = StdRng::seed_from_u64(seed);
            let stage = format!("holdout {holdout} validation");
            let (validation, sub_train) = stratified_partition(
                &remainder,
                &strata,
                self.config.validation_size,
                &mut rng,
                &stage,
            )?;
            holdouts.push(HoldoutSplit {
                holdout,
                seed,
                sub_train,
                validation,
            });
        }

        let assignment = SplitAssignment {
            seed: self.config.seed,
            n_samples: dataset.len(),
            test,
            remainder,
            holdouts,
        };
        assignment.verify()?;
        tracing::debug!(
            test = assignment.test.len(),
            remainder = assignment.remainder.len(),
            holdouts = assignment.holdouts.len(),
            "planned stratified split"
        );
        Ok(assignment)
    }
}

/// Split `indices` into `(selected, rest)` with `selected` holding about
/// `fraction` of every stratum. Strata with a single member stay in `rest`.
fn stratified_partition(
    indices: &[usize],
    strata: &[Stratum],
    fraction: f64,
    rng: &mut StdRng,
    stage: &str,
) -> Result<(Vec<usize>, Vec<usize>), SplitError> {
    let mut groups: BTreeMap<&Stratum, Vec<usize>> = BTreeMap::new();
    for &idx in indices {
        groups.entry(&strata[idx]).or_default().push(idx);
    }

    let mut selected = Vec::new();
    let mut rest = Vec::new();
    for (stratum, mut members) in groups {
        members.sort_unstable();
        let n = members.len();
        if n < 2 {
            rest.extend(members);
            continue;
        }
        let k = (n as f64 * fraction).round() as usize;
        if k == 0 || k >= n {
            return Err(SplitError::InsufficientSamples {
                class: stratum.label.clone(),
                layer: stratum.layer,
                stage: stage.to_string(),
                available: n,
                requested_fraction: fraction,
            });
        }
        members.shuffle(rng);
        selected.extend_from_slice(&members[..k]);
        rest.extend_from_slice(&members[k..]);
    }

    if selected.is_empty() {
        return Err(SplitError::EmptySplit {
            stage: stage.to_string(),
        });
    }
    if rest.is_empty() {
        return Err(SplitError::EmptySplit {
            stage: format!("{stage} complement"),
        });
    }
    selected.sort_unstable();
    rest.sort_unstable();
    Ok((selected, rest))
}
