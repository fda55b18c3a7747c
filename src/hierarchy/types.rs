//! Core value types shared by the hierarchy, coverage and consistency code.

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// One of the three nested taxonomic layers, ordered coarse to fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Pathway,
    Superclass,
    Class,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Pathway, Layer::Superclass, Layer::Class];

    /// The layer immediately below this one, if any.
    pub fn next(self) -> Option<Layer> {
        match self {
            Layer::Pathway => Some(Layer::Superclass),
            Layer::Superclass => Some(Layer::Class),
            Layer::Class => None,
        }
    }

    /// The layer immediately above this one, if any.
    pub fn previous(self) -> Option<Layer> {
        match self {
            Layer::Pathway => None,
            Layer::Superclass => Some(Layer::Pathway),
            Layer::Class => Some(Layer::Superclass),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Pathway => "pathway",
            Layer::Superclass => "superclass",
            Layer::Class => "class",
        }
    }

    /// Name used as a row key in coverage and performance tables.
    pub fn plural(self) -> &'static str {
        match self {
            Layer::Pathway => "pathways",
            Layer::Superclass => "superclasses",
            Layer::Class => "classes",
        }
    }

    /// Accepts both singular and plural spellings, case-insensitively.
    pub fn parse(raw: &str) -> Option<Layer> {
        let lowered = raw.trim().to_ascii_lowercase();
        Layer::ALL
            .into_iter()
            .find(|layer| lowered == layer.as_str() || lowered == layer.plural())
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three values, one per layer, addressable by [`Layer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerLayer<T> {
    #[serde(default)]
    pub pathway: T,
    #[serde(default)]
    pub superclass: T,
    #[serde(default)]
    pub class: T,
}

impl<T> PerLayer<T> {
    pub fn new(pathway: T, superclass: T, class: T) -> Self {
        Self {
            pathway,
            superclass,
            class,
        }
    }

    pub fn from_fn(mut f: impl FnMut(Layer) -> T) -> Self {
        Self {
            pathway: f(Layer::Pathway),
            superclass: f(Layer::Superclass),
            class: f(Layer::Class),
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(Layer, T) -> U) -> PerLayer<U> {
        PerLayer {
            pathway: f(Layer::Pathway, self.pathway),
            superclass: f(Layer::Superclass, self.superclass),
            class: f(Layer::Class, self.class),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Layer, &T)> + '_ {
        Layer::ALL.into_iter().map(move |layer| (layer, &self[layer]))
    }
}

impl<T> Index<Layer> for PerLayer<T> {
    type Output = T;

    fn index(&self, layer: Layer) -> &T {
        match layer {
            Layer::Pathway => &self.pathway,
            Layer::Superclass => &self.superclass,
            Layer::Class => &self.class,
        }
    }
}

impl<T> IndexMut<Layer> for PerLayer<T> {
    fn index_mut(&mut self, layer: Layer) -> &mut T {
        match layer {
            Layer::Pathway => &mut self.pathway,
            Layer::Superclass => &mut self.superclass,
            Layer::Class => &mut self.class,
        }
    }
}

/// Dense handle to a node: its layer plus its index within that layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub layer: Layer,
    pub index: usize,
}

impl NodeId {
    pub fn new(layer: Layer, index: usize) -> Self {
        Self { layer, index }
    }
}

/// Node reference by name, as it appears in hierarchy input data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub layer: Layer,
    pub name: String,
}

impl NodeRef {
    pub fn new(layer: Layer, name: impl Into<String>) -> Self {
        Self {
            layer,
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HierarchyEdge {
    pub parent: NodeRef,
    pub child: NodeRef,
}

impl HierarchyEdge {
    pub fn new(parent: NodeRef, child: NodeRef) -> Self {
        Self { parent, child }
    }
}

impl fmt::Display for HierarchyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.parent, self.child)
    }
}

/// A connected (pathway, superclass, class) triple, stored as layer indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LegalPath {
    pub pathway: usize,
    pub superclass: usize,
    pub class: usize,
}

impl LegalPath {
    pub fn new(pathway: usize, superclass: usize, class: usize) -> Self {
        Self {
            pathway,
            superclass,
            class,
        }
    }

    pub fn index(&self, layer: Layer) -> usize {
        match layer {
            Layer::Pathway => self.pathway,
            Layer::Superclass => self.superclass,
            Layer::Class => self.class,
        }
    }

    pub fn nodes(&self) -> [NodeId; 3] {
        Layer::ALL.map(|layer| NodeId::new(layer, self.index(layer)))
    }
}
