//! Dense graph supports (adjacency and Laplacians) over all hierarchy nodes.
//!
//! Nodes are laid out in global order: every pathway, then every superclass,
//! then every class, each block in its per-layer index order. Model adapters
//! that harmonize their outputs with graph convolutions consume these; the
//! consistency enforcer does not.

use nalgebra::DMatrix;

use super::graph::HierarchyGraph;
use super::types::{Layer, NodeId};

impl HierarchyGraph {
    /// Row/column of `node` in the global node ordering.
    pub fn global_index(&self, node: NodeId) -> usize {
        let offset: usize = Layer::ALL
            .iter()
            .take_while(|&&layer| layer != node.layer)
            .map(|&layer| self.layer_len(layer))
            .sum();
        offset + node.index
    }

    /// Directed adjacency, `A[parent][child] = 1`.
    pub fn adjacency_matrix(&self) -> DMatrix<f64> {
        let n = self.node_count();
        let mut a = DMatrix::<f64>::zeros(n, n);
        for layer in [Layer::Pathway, Layer::Superclass] {
            for index in 0..self.layer_len(layer) {
                let parent = NodeId::new(layer, index);
                let row = self.global_index(parent);
                for child in self.children_of(parent) {
                    a[(row, self.global_index(child))] = 1.0;
                }
            }
        }
        a
    }

    /// Out-degree Laplacian `D_out - A`.
    pub fn laplacian(&self) -> DMatrix<f64> {
        let a = self.adjacency_matrix();
        let degrees: Vec<f64> = a.row_iter().map(|row| row.sum()).collect();
        DMatrix::from_diagonal(&nalgebra::DVector::from_vec(degrees)) - a
    }

    /// In-degree Laplacian of the reversed graph, `D_in - Aᵀ`.
    pub fn transposed_laplacian(&self) -> DMatrix<f64> {
        let at = self.adjacency_matrix().transpose();
        let degrees: Vec<f64> = at.row_iter().map(|row| row.sum()).collect();
        DMatrix::from_diagonal(&nalgebra::DVector::from_vec(degrees)) - at
    }

    /// Normalized Laplacian of the undirected graph, `I - D^{-1/2} (A + Aᵀ) D^{-1/2}`.
    ///
    /// Nodes with zero degree keep an all-zero row and column.
    ///
    /// One smoothing step over node scores laid out in global order:
    ///
    /// ```
    /// use nalgebra::{DMatrix, DVector};
    /// use npc_harness::hierarchy::{HierarchyGraph, Layer};
    ///
    /// let graph = HierarchyGraph::from_label_triples([
    ///     ("Alkaloids", "Indole alkaloids", "Carbazoles"),
    ///     ("Alkaloids", "Indole alkaloids", "Simple indoles"),
    /// ])
    /// .unwrap();
    /// let n = graph.node_count();
    /// let mut scores = DVector::<f64>::zeros(n);
    /// let carbazoles = graph.node_id(Layer::Class, "Carbazoles").unwrap();
    /// scores[graph.global_index(carbazoles)] = 1.0;
    ///
    /// let step = DMatrix::<f64>::identity(n, n) - graph.symmetric_laplacian() * 0.5;
    /// let smoothed = &step * &scores;
    /// let parent = graph.node_id(Layer::Superclass, "Indole alkaloids").unwrap();
    /// assert!(smoothed[graph.global_index(parent)] > 0.0);
    /// ```
    pub fn symmetric_laplacian(&self) -> DMatrix<f64> {
        let a = self.adjacency_matrix();
        let undirected = &a + a.transpose();
        let n = undirected.nrows();
        let inv_sqrt: Vec<f64> = undirected
            .row_iter()
            .map(|row| {
                let degree = row.sum();
                if degree > 0.0 {
                    1.0 / degree.sqrt()
                } else {
                    0.0
                }
            })
            .collect();

        let mut out = DMatrix::<f64>::zeros(n, n);
        for i in 0..n {
            if inv_sqrt[i] > 0.0 {
                out[(i, i)] = 1.0;
            }
            for j in 0..n {
                if undirected[(i, j)] != 0.0 {
                    out[(i, j)] -= inv_sqrt[i] * undirected[(i, j)] * inv_sqrt[j];
                }
            }
        }
        out
    }
}
