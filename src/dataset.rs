//! Labeled molecules and their feature sets.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::hierarchy::{HierarchyError, HierarchyGraph, Layer, PerLayer};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse dataset: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid dataset: {0}")]
    Invalid(String),
}

/// One molecule: identifier, named feature vectors and per-layer labels.
///
/// Labels are multi-label per layer; a layer may carry no label at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub id: String,
    #[serde(default)]
    pub features: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub labels: PerLayer<Vec<String>>,
}

impl LabeledSample {
    pub fn new(id: impl Into<String>, labels: PerLayer<Vec<String>>) -> Self {
        Self {
            id: id.into(),
            features: BTreeMap::new(),
            labels,
        }
    }

    pub fn with_feature(mut self, feature_set: impl Into<String>, values: Vec<f64>) -> Self {
        self.features.insert(feature_set.into(), values);
        self
    }

    /// Every (pathway, superclass, class) combination of this sample's labels.
    pub fn label_triples(&self) -> impl Iterator<Item = (&str, &str, &str)> + '_ {
        self.labels.pathway.iter().flat_map(move |p| {
            self.labels.superclass.iter().flat_map(move |s| {
                self.labels
                    .class
                    .iter()
                    .map(move |c| (p.as_str(), s.as_str(), c.as_str()))
            })
        })
    }

    pub fn has_labels(&self) -> bool {
        Layer::ALL.iter().any(|&layer| !self.labels[layer].is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub samples: Vec<LabeledSample>,
}

/// Row-major feature matrix handed to model adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub feature_set: String,
    pub dimension: usize,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Multi-hot labels indexed by hierarchy node index, one table per layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatrix {
    pub rows: Vec<PerLayer<Vec<bool>>>,
}

impl LabelMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Dataset {
    pub fn new(name: impl Into<String>, samples: Vec<LabeledSample>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Feature-set names present in every sample.
    pub fn feature_sets(&self) -> Vec<String> {
        let Some(first) = self.samples.first() else {
            return Vec::new();
        };
        first
            .features
            .keys()
            .filter(|name| self.samples.iter().all(|s| s.features.contains_key(*name)))
            .cloned()
            .collect()
    }

    /// Global support of every (layer, label) pair.
    pub fn label_support(&self) -> HashMap<(Layer, &str), usize> {
        let mut support: HashMap<(Layer, &str), usize> = HashMap::new();
        for sample in &self.samples {
            for (layer, labels) in sample.labels.iter() {
                let distinct: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
                for label in distinct {
                    *support.entry((layer, label)).or_insert(0) += 1;
                }
            }
        }
        support
    }

    /// Hierarchy implied by the label triples of this dataset.
    pub fn derive_hierarchy(&self) -> Result<HierarchyGraph, HierarchyError> {
        HierarchyGraph::from_label_triples(self.samples.iter().flat_map(|s| s.label_triples()))
    }

    /// Gather one feature set for the given sample indices.
    pub fn feature_matrix(
        &self,
        feature_set: &str,
        indices: &[usize],
    ) -> Result<FeatureMatrix, DatasetError> {
        let mut rows = Vec::with_capacity(indices.len());
        let mut dimension: Option<usize> = None;
        for &idx in indices {
            let sample = self.samples.get(idx).ok_or_else(|| {
                DatasetError::Invalid(format!("sample index {idx} out of range"))
            })?;
            let values = sample.features.get(feature_set).ok_or_else(|| {
                DatasetError::Invalid(format!(
                    "sample '{}' has no feature set '{feature_set}'",
                    sample.id
                ))
            })?;
            match dimension {
                None => dimension = Some(values.len()),
                Some(d) if d != values.len() => {
                    return Err(DatasetError::Invalid(format!(
                        "feature set '{feature_set}' has dimension {} for sample '{}' (expected {d})",
                        values.len(),
                        sample.id
                    )))
                }
                Some(_) => {}
            }
            rows.push(values.clone());
        }
        Ok(FeatureMatrix {
            feature_set: feature_set.to_string(),
            dimension: dimension.unwrap_or(0),
            rows,
        })
    }

    /// Multi-hot encode labels against the hierarchy's node indices.
    ///
    /// Labels that are not nodes of the graph are dropped; the count of
    /// dropped labels is returned alongside the matrix.
    pub fn label_matrix(&self, graph: &HierarchyGraph, indices: &[usize]) -> (LabelMatrix, usize) {
        let mut dropped = 0usize;
        let rows = indices
            .iter()
            .filter_map(|&idx| self.samples.get(idx))
            .map(|sample| {
                PerLayer::from_fn(|layer| {
                    let mut row = vec![false; graph.layer_len(layer)];
                    for label in &sample.labels[layer] {
                        match graph.node_id(layer, label) {
                            Some(node) => row[node.index] = true,
                            None => dropped += 1,
                        }
                    }
                    row
                })
            })
            .collect();
        (LabelMatrix { rows }, dropped)
    }

    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.samples.is_empty() {
            return Err(DatasetError::Invalid(format!(
                "dataset '{}' has no samples",
                self.name
            )));
        }
        let mut ids: BTreeSet<&str> = BTreeSet::new();
        for sample in &self.samples {
            if !ids.insert(sample.id.as_str()) {
                return Err(DatasetError::Invalid(format!(
                    "duplicate sample id: {}",
                    sample.id
                )));
            }
            for (name, values) in &sample.features {
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(DatasetError::Invalid(format!(
                        "sample '{}' has non-finite values in feature set '{name}'",
                        sample.id
                    )));
                }
            }
        }
        Ok(())
    }
}

pub fn load_dataset_from_path(path: impl AsRef<Path>) -> Result<Dataset, DatasetError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let dataset: Dataset = serde_json::from_str(&raw)?;
    dataset.validate()?;
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(p: &[&str], s: &[&str], c: &[&str]) -> PerLayer<Vec<String>> {
        let own = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        PerLayer::new(own(p), own(s), own(c))
    }

    #[test]
    fn label_triples_are_cartesian() {
        let sample = LabeledSample::new("m1", labels(&["P"], &["S1", "S2"], &["C"]));
        let triples: Vec<_> = sample.label_triples().collect();
        assert_eq!(triples, vec![("P", "S1", "C"), ("P", "S2", "C")]);
    }

    #[test]
    fn feature_matrix_rejects_ragged_rows() {
        let dataset = Dataset::new(
            "d",
            vec![
                LabeledSample::new("a", labels(&["P"], &[], &[])).with_feature("maccs", vec![1.0]),
                LabeledSample::new("b", labels(&["P"], &[], &[]))
                    .with_feature("maccs", vec![1.0, 0.0]),
            ],
        );
        assert!(dataset.feature_matrix("maccs", &[0]).is_ok());
        assert!(matches!(
            dataset.feature_matrix("maccs", &[0, 1]),
            Err(DatasetError::Invalid(_))
        ));
    }

    #[test]
    fn label_support_counts_samples_not_occurrences() {
        let dataset = Dataset::new(
            "d",
            vec![
                LabeledSample::new("a", labels(&["P", "P"], &[], &[])),
                LabeledSample::new("b", labels(&["P"], &[], &[])),
            ],
        );
        let support = dataset.label_support();
        assert_eq!(support[&(Layer::Pathway, "P")], 2);
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let dataset = Dataset::new(
            "d",
            vec![
                LabeledSample::new("a", labels(&["P"], &[], &[])),
                LabeledSample::new("a", labels(&["P"], &[], &[])),
            ],
        );
        assert!(dataset.validate().is_err());
    }
}
