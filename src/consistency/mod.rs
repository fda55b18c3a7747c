//! Hierarchy-consistent joint prediction.

pub mod combiner;
pub mod enforcer;

pub use combiner::{
    ArithmeticMeanCombiner, CombinerRegistry, GeometricMeanCombiner, MinimumCombiner,
    ProductCombiner, ScoreCombiner,
};
pub use enforcer::{
    ConsistencyEnforcer, ConsistencyError, ConsistentPrediction, DEFAULT_TIE_EPSILON,
};
