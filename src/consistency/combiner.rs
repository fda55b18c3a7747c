//! Pluggable functions that fold three per-layer scores into a path score.

use std::collections::HashMap;
use std::sync::Arc;

/// Combines the raw scores of a path's three nodes into one comparable value.
///
/// Implementations should be non-decreasing in each argument; otherwise the
/// argmax fast path in the enforcer may disagree with the exhaustive scan.
pub trait ScoreCombiner: Send + Sync {
    fn combine(&self, pathway: f64, superclass: f64, class: f64) -> f64;

    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> ScoreCombiner for F
where
    F: Fn(f64, f64, f64) -> f64 + Send + Sync,
{
    fn combine(&self, pathway: f64, superclass: f64, class: f64) -> f64 {
        self(pathway, superclass, class)
    }
}

/// Product of the three scores. Expects probabilities in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductCombiner;

impl ScoreCombiner for ProductCombiner {
    fn combine(&self, pathway: f64, superclass: f64, class: f64) -> f64 {
        pathway * superclass * class
    }

    fn name(&self) -> &str {
        "product"
    }
}

/// Cube root of the product; same ordering as the product, friendlier scale.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometricMeanCombiner;

impl ScoreCombiner for GeometricMeanCombiner {
    fn combine(&self, pathway: f64, superclass: f64, class: f64) -> f64 {
        (pathway * superclass * class).max(0.0).cbrt()
    }

    fn name(&self) -> &str {
        "geometric_mean"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArithmeticMeanCombiner;

impl ScoreCombiner for ArithmeticMeanCombiner {
    fn combine(&self, pathway: f64, superclass: f64, class: f64) -> f64 {
        (pathway + superclass + class) / 3.0
    }

    fn name(&self) -> &str {
        "arithmetic_mean"
    }
}

/// Weakest link: a path is only as plausible as its least plausible node.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimumCombiner;

impl ScoreCombiner for MinimumCombiner {
    fn combine(&self, pathway: f64, superclass: f64, class: f64) -> f64 {
        pathway.min(superclass).min(class)
    }

    fn name(&self) -> &str {
        "minimum"
    }
}

pub struct CombinerRegistry {
    combiners: HashMap<String, Arc<dyn ScoreCombiner>>,
}

impl Default for CombinerRegistry {
    fn default() -> Self {
        let mut combiners: HashMap<String, Arc<dyn ScoreCombiner>> = HashMap::new();
        combiners.insert("product".to_string(), Arc::new(ProductCombiner));
        combiners.insert("geometric_mean".to_string(), Arc::new(GeometricMeanCombiner));
        combiners.insert("arithmetic_mean".to_string(), Arc::new(ArithmeticMeanCombiner));
        combiners.insert("minimum".to_string(), Arc::new(MinimumCombiner));
        Self { combiners }
    }
}

impl CombinerRegistry {
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.combiners.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ScoreCombiner>> {
        self.combiners.get(name).cloned()
    }

    pub fn insert(&mut self, name: impl Into<String>, combiner: Arc<dyn ScoreCombiner>) {
        self.combiners.insert(name.into(), combiner);
    }
}
