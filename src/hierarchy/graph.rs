//! Immutable layered DAG of legal pathway → superclass → class combinations.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::types::{HierarchyEdge, Layer, LegalPath, NodeId, NodeRef, PerLayer};

#[derive(Debug, thiserror::Error)]
pub enum HierarchyError {
    #[error("malformed hierarchy: {0}")]
    Malformed(String),
    #[error("failed to read hierarchy: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse hierarchy: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk edge list format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyFile {
    pub edges: Vec<HierarchyEdge>,
}

/// Hierarchy graph with dense per-layer indices.
///
/// Node indices are assigned by sorting names within each layer, so two
/// graphs built from the same edges (in any order) index identically.
/// Adjacency lists are sorted, which keeps path enumeration deterministic
/// and lets membership checks binary-search.
#[derive(Debug, Clone)]
pub struct HierarchyGraph {
    names: PerLayer<Vec<String>>,
    lookup: PerLayer<HashMap<String, usize>>,
    children: PerLayer<Vec<Vec<usize>>>,
    parents: PerLayer<Vec<Vec<usize>>>,
    edge_count: usize,
}

impl HierarchyGraph {
    /// Build and validate a graph from an edge list.
    ///
    /// Rejects self-loops, cycles, edges that do not go from one layer to the
    /// layer immediately below it, and superclass/class nodes without parents.
    /// Duplicate edges are collapsed.
    pub fn build<I>(edges: I) -> Result<Self, HierarchyError>
    where
        I: IntoIterator<Item = HierarchyEdge>,
    {
        let mut unique: BTreeSet<(NodeRef, NodeRef)> = BTreeSet::new();
        for edge in edges {
            if edge.parent.name.trim().is_empty() || edge.child.name.trim().is_empty() {
                return Err(HierarchyError::Malformed(format!(
                    "edge {edge} has an empty node name"
                )));
            }
            if edge.parent == edge.child {
                return Err(HierarchyError::Malformed(format!(
                    "self-loop on {}",
                    edge.parent
                )));
            }
            unique.insert((edge.parent, edge.child));
        }

        if unique.is_empty() {
            return Err(HierarchyError::Malformed("hierarchy has no edges".into()));
        }

        // Cycles are checked before layer adjacency so that a backward edge
        // closing a loop is reported as the cycle it creates.
        check_acyclic(&unique)?;

        for (parent, child) in &unique {
            match parent.layer.next() {
                Some(expected) if expected == child.layer => {}
                Some(expected) => {
                    return Err(HierarchyError::Malformed(format!(
                        "edge {parent} -> {child} does not connect adjacent layers \
                         (a {} node may only have {} children)",
                        parent.layer, expected
                    )))
                }
                None => {
                    return Err(HierarchyError::Malformed(format!(
                        "edge {parent} -> {child} leaves the finest layer"
                    )))
                }
            }
        }

        let mut layer_names: PerLayer<BTreeSet<&str>> = PerLayer::default();
        for (parent, child) in &unique {
            layer_names[parent.layer].insert(parent.name.as_str());
            layer_names[child.layer].insert(child.name.as_str());
        }

        let names: PerLayer<Vec<String>> = PerLayer::from_fn(|layer| {
            layer_names[layer].iter().map(|name| name.to_string()).collect()
        });
        let lookup: PerLayer<HashMap<String, usize>> = PerLayer::from_fn(|layer| {
            names[layer]
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.clone(), idx))
                .collect()
        });

        let mut children: PerLayer<Vec<Vec<usize>>> =
            PerLayer::from_fn(|layer| vec![Vec::new(); names[layer].len()]);
        let mut parents: PerLayer<Vec<Vec<usize>>> =
            PerLayer::from_fn(|layer| vec![Vec::new(); names[layer].len()]);

        for (parent, child) in &unique {
            let p = lookup[parent.layer][&parent.name];
            let c = lookup[child.layer][&child.name];
            children[parent.layer][p].push(c);
            parents[child.layer][c].push(p);
        }
        for layer in Layer::ALL {
            for list in children[layer].iter_mut().chain(parents[layer].iter_mut()) {
                list.sort_unstable();
            }
        }

        for layer in [Layer::Superclass, Layer::Class] {
            for (idx, list) in parents[layer].iter().enumerate() {
                if list.is_empty() {
                    return Err(HierarchyError::Malformed(format!(
                        "{layer} node '{}' has no parent in the {} layer",
                        names[layer][idx],
                        layer.previous().unwrap_or(Layer::Pathway)
                    )));
                }
            }
        }

        Ok(Self {
            names,
            lookup,
            children,
            parents,
            edge_count: unique.len(),
        })
    }

    /// Build the hierarchy implied by observed (pathway, superclass, class) triples.
    pub fn from_label_triples<I, S>(triples: I) -> Result<Self, HierarchyError>
    where
        I: IntoIterator<Item = (S, S, S)>,
        S: AsRef<str>,
    {
        let mut edges = Vec::new();
        for (pathway, superclass, class) in triples {
            let pathway = NodeRef::new(Layer::Pathway, pathway.as_ref());
            let superclass = NodeRef::new(Layer::Superclass, superclass.as_ref());
            let class = NodeRef::new(Layer::Class, class.as_ref());
            edges.push(HierarchyEdge::new(pathway, superclass.clone()));
            edges.push(HierarchyEdge::new(superclass, class));
        }
        Self::build(edges)
    }

    pub fn layer_len(&self, layer: Layer) -> usize {
        self.names[layer].len()
    }

    pub fn layer_names(&self, layer: Layer) -> &[String] {
        &self.names[layer]
    }

    pub fn node_count(&self) -> usize {
        Layer::ALL.iter().map(|&layer| self.layer_len(layer)).sum()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn node_id(&self, layer: Layer, name: &str) -> Option<NodeId> {
        self.lookup[layer]
            .get(name)
            .map(|&index| NodeId::new(layer, index))
    }

    pub fn node_name(&self, node: NodeId) -> Option<&str> {
        self.names[node.layer].get(node.index).map(String::as_str)
    }

    pub fn children_of(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let child_layer = node.layer.next().unwrap_or(node.layer);
        adjacency(&self.children[node.layer], node.index)
            .iter()
            .map(move |&index| NodeId::new(child_layer, index))
    }

    pub fn parents_of(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let parent_layer = node.layer.previous().unwrap_or(node.layer);
        adjacency(&self.parents[node.layer], node.index)
            .iter()
            .map(move |&index| NodeId::new(parent_layer, index))
    }

    /// Whether the named triple is connected through the graph.
    pub fn is_legal_path(&self, pathway: &str, superclass: &str, class: &str) -> bool {
        match (
            self.lookup.pathway.get(pathway),
            self.lookup.superclass.get(superclass),
            self.lookup.class.get(class),
        ) {
            (Some(&p), Some(&s), Some(&c)) => self.is_legal(LegalPath::new(p, s, c)),
            _ => false,
        }
    }

    /// Index-based variant of [`is_legal_path`](Self::is_legal_path).
    pub fn is_legal(&self, path: LegalPath) -> bool {
        adjacency(&self.parents.superclass, path.superclass)
            .binary_search(&path.pathway)
            .is_ok()
            && adjacency(&self.children.superclass, path.superclass)
                .binary_search(&path.class)
                .is_ok()
    }

    /// Lazily enumerate every legal path, pathway-major.
    ///
    /// Nothing is materialized; call again to restart.
    pub fn all_legal_paths(&self) -> LegalPaths<'_> {
        LegalPaths {
            graph: self,
            pathway: 0,
            superclass_pos: 0,
            class_pos: 0,
        }
    }

    /// Number of legal paths, computed from degrees without enumerating them.
    pub fn legal_path_count(&self) -> usize {
        (0..self.layer_len(Layer::Superclass))
            .map(|s| self.parents.superclass[s].len() * self.children.superclass[s].len())
            .sum()
    }

    /// Resolve a path back to its names.
    pub fn path_names(&self, path: LegalPath) -> Option<(&str, &str, &str)> {
        Some((
            self.names.pathway.get(path.pathway)?.as_str(),
            self.names.superclass.get(path.superclass)?.as_str(),
            self.names.class.get(path.class)?.as_str(),
        ))
    }

    /// Edge list in a stable order, suitable for writing back to disk.
    pub fn to_edges(&self) -> Vec<HierarchyEdge> {
        let mut edges = Vec::with_capacity(self.edge_count);
        for layer in [Layer::Pathway, Layer::Superclass] {
            let child_layer = layer.next().unwrap_or(layer);
            for (parent_idx, list) in self.children[layer].iter().enumerate() {
                for &child_idx in list {
                    edges.push(HierarchyEdge::new(
                        NodeRef::new(layer, self.names[layer][parent_idx].clone()),
                        NodeRef::new(child_layer, self.names[child_layer][child_idx].clone()),
                    ));
                }
            }
        }
        edges
    }
}

fn adjacency(lists: &[Vec<usize>], index: usize) -> &[usize] {
    lists.get(index).map(Vec::as_slice).unwrap_or(&[])
}

/// Restartable iterator over legal paths. See [`HierarchyGraph::all_legal_paths`].
#[derive(Debug, Clone)]
pub struct LegalPaths<'a> {
    graph: &'a HierarchyGraph,
    pathway: usize,
    superclass_pos: usize,
    class_pos: usize,
}

impl Iterator for LegalPaths<'_> {
    type Item = LegalPath;

    fn next(&mut self) -> Option<LegalPath> {
        let pathways = &self.graph.children.pathway;
        while self.pathway < pathways.len() {
            let superclasses = &pathways[self.pathway];
            while self.superclass_pos < superclasses.len() {
                let superclass = superclasses[self.superclass_pos];
                let classes = adjacency(&self.graph.children.superclass, superclass);
                if self.class_pos < classes.len() {
                    let class = classes[self.class_pos];
                    self.class_pos += 1;
                    return Some(LegalPath::new(self.pathway, superclass, class));
                }
                self.superclass_pos += 1;
                self.class_pos = 0;
            }
            self.pathway += 1;
            self.superclass_pos = 0;
        }
        None
    }
}

/// Kahn's algorithm over the named nodes of the edge set.
fn check_acyclic(edges: &BTreeSet<(NodeRef, NodeRef)>) -> Result<(), HierarchyError> {
    let mut index: HashMap<&NodeRef, usize> = HashMap::new();
    let mut nodes: Vec<&NodeRef> = Vec::new();
    for (parent, child) in edges {
        for node in [parent, child] {
            index.entry(node).or_insert_with(|| {
                nodes.push(node);
                nodes.len() - 1
            });
        }
    }

    let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];
    for (parent, child) in edges {
        let p = index[parent];
        let c = index[child];
        out_edges[p].push(c);
        in_degree[c] += 1;
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in &out_edges[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited == nodes.len() {
        return Ok(());
    }
    let stuck = (0..nodes.len())
        .find(|&i| in_degree[i] > 0)
        .map(|i| nodes[i].to_string())
        .unwrap_or_default();
    Err(HierarchyError::Malformed(format!(
        "cycle detected through {stuck}"
    )))
}

pub fn load_hierarchy_from_path(path: impl AsRef<Path>) -> Result<HierarchyGraph, HierarchyError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let file: HierarchyFile = serde_json::from_str(&raw)?;
    HierarchyGraph::build(file.edges)
}

pub fn write_hierarchy_to_path(
    graph: &HierarchyGraph,
    path: impl AsRef<Path>,
) -> Result<(), HierarchyError> {
    let file = HierarchyFile {
        edges: graph.to_edges(),
    };
    let json = serde_json::to_string_pretty(&file)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(pl: Layer, p: &str, cl: Layer, c: &str) -> HierarchyEdge {
        HierarchyEdge::new(NodeRef::new(pl, p), NodeRef::new(cl, c))
    }

    #[test]
    fn indices_follow_sorted_names() {
        let graph = HierarchyGraph::from_label_triples([
            ("Terpenoids", "Monoterpenoids", "Iridoids"),
            ("Alkaloids", "Tropane alkaloids", "Tropanes"),
        ])
        .unwrap();
        assert_eq!(graph.layer_names(Layer::Pathway), ["Alkaloids", "Terpenoids"]);
        assert_eq!(
            graph.node_id(Layer::Pathway, "Terpenoids"),
            Some(NodeId::new(Layer::Pathway, 1))
        );
        assert_eq!(graph.edge_count(), 4);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let graph = HierarchyGraph::build(vec![
            edge(Layer::Pathway, "P", Layer::Superclass, "S"),
            edge(Layer::Pathway, "P", Layer::Superclass, "S"),
            edge(Layer::Superclass, "S", Layer::Class, "C"),
        ])
        .unwrap();
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.legal_path_count(), 1);
    }

    #[test]
    fn to_edges_round_trips_through_build() {
        let graph = HierarchyGraph::from_label_triples([
            ("P1", "S1", "C1"),
            ("P2", "S1", "C2"),
            ("P2", "S2", "C3"),
        ])
        .unwrap();
        let rebuilt = HierarchyGraph::build(graph.to_edges()).unwrap();
        let a: Vec<_> = graph.all_legal_paths().collect();
        let b: Vec<_> = rebuilt.all_legal_paths().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = HierarchyGraph::build(vec![edge(Layer::Pathway, " ", Layer::Superclass, "S")])
            .unwrap_err();
        assert!(matches!(err, HierarchyError::Malformed(_)));
    }
}
