//! Nearest-centroid reference model.
//!
//! Each hierarchy node gets the mean feature vector of the training rows
//! carrying its label; a row's score for a node is `1 / (1 + d)` where `d`
//! is the Euclidean distance to that centroid. Nodes never seen in training
//! stay unscored (`NaN`). Useful as a smoke-test baseline, not as a model.

use crate::dataset::{FeatureMatrix, LabelMatrix};
use crate::hierarchy::{Layer, PerLayer};

use super::adapter::{AdapterError, ModelAdapter};

#[derive(Debug, Clone, Copy, Default)]
pub struct CentroidAdapter;

#[derive(Debug, Clone)]
pub struct CentroidModel {
    dimension: usize,
    centroids: PerLayer<Vec<Option<Vec<f64>>>>,
}

impl CentroidModel {
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of nodes per layer that received a centroid.
    pub fn trained_nodes(&self, layer: Layer) -> usize {
        self.centroids[layer].iter().filter(|c| c.is_some()).count()
    }
}

impl ModelAdapter for CentroidAdapter {
    type Handle = CentroidModel;

    fn name(&self) -> &str {
        "nearest_centroid"
    }

    fn train(
        &self,
        features: &FeatureMatrix,
        labels: &LabelMatrix,
    ) -> Result<CentroidModel, AdapterError> {
        if features.is_empty() {
            return Err(AdapterError::Training("empty training set".to_string()));
        }
        if features.len() != labels.len() {
            return Err(AdapterError::Training(format!(
                "{} feature rows but {} label rows",
                features.len(),
                labels.len()
            )));
        }

        let dimension = features.dimension;
        let width = |layer: Layer| labels.rows.first().map_or(0, |row| row[layer].len());
        let mut sums: PerLayer<Vec<(Vec<f64>, usize)>> =
            PerLayer::from_fn(|layer| vec![(vec![0.0; dimension], 0); width(layer)]);

        for (values, row) in features.rows.iter().zip(&labels.rows) {
            for layer in Layer::ALL {
                for (node, _) in row[layer].iter().enumerate().filter(|(_, hot)| **hot) {
                    let Some((sum, count)) = sums[layer].get_mut(node) else {
                        continue;
                    };
                    for (acc, v) in sum.iter_mut().zip(values) {
                        *acc += v;
                    }
                    *count += 1;
                }
            }
        }

        let centroids: PerLayer<Vec<Option<Vec<f64>>>> = sums.map(|_, nodes| {
            nodes
                .into_iter()
                .map(|(sum, count)| {
                    (count > 0).then(|| {
                        sum.into_iter()
                            .map(|v| v / count as f64)
                            .collect::<Vec<f64>>()
                    })
                })
                .collect()
        });

        Ok(CentroidModel {
            dimension,
            centroids,
        })
    }

    fn predict(
        &self,
        handle: &CentroidModel,
        features: &FeatureMatrix,
    ) -> Result<Vec<PerLayer<Vec<f64>>>, AdapterError> {
        if !features.is_empty() && features.dimension != handle.dimension {
            return Err(AdapterError::Prediction(format!(
                "model expects dimension {}, got {}",
                handle.dimension, features.dimension
            )));
        }
        Ok(features
            .rows
            .iter()
            .map(|values| {
                PerLayer::from_fn(|layer| {
                    handle.centroids[layer]
                        .iter()
                        .map(|centroid| match centroid {
                            Some(c) => 1.0 / (1.0 + euclidean(values, c)),
                            None => f64::NAN,
                        })
                        .collect()
                })
            })
            .collect())
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
