//! Pathway → superclass → class hierarchy.
//!
//! The hierarchy is a layered DAG: every edge goes from one layer to the
//! layer immediately below it, a superclass may belong to several pathways
//! and a class to several superclasses. A *legal path* is a triple connected
//! by two edges; the set of legal paths is what "hierarchy-consistent" means
//! everywhere else in the crate.

mod graph;
mod supports;
mod types;

pub use graph::{
    load_hierarchy_from_path, write_hierarchy_to_path, HierarchyError, HierarchyFile,
    HierarchyGraph, LegalPaths,
};
pub use types::{HierarchyEdge, Layer, LegalPath, NodeId, NodeRef, PerLayer};
