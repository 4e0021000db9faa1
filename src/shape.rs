//! Read-side view over inferred output shapes.
//!
//! Shape inference itself lives outside this crate; the estimator only probes
//! ranks and dimension values through [`ShapeContext`], tolerating partial
//! information at every level.

use crate::graph::NodeDef;

/// A single dimension extent, possibly unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Known(u64),
    Unknown,
}

impl Dim {
    pub fn value_known(&self) -> bool {
        matches!(self, Dim::Known(_))
    }

    pub fn value(&self) -> Option<u64> {
        match self {
            Dim::Known(v) => Some(*v),
            Dim::Unknown => None,
        }
    }
}

/// Inferred shape of one output; `dims: None` means the rank itself is
/// unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputShape {
    dims: Option<Vec<Dim>>,
}

impl OutputShape {
    pub fn unknown_rank() -> Self {
        Self { dims: None }
    }

    pub fn with_dims(dims: Vec<Dim>) -> Self {
        Self { dims: Some(dims) }
    }

    /// Fully-known shape from concrete extents.
    pub fn known(extents: &[u64]) -> Self {
        Self::with_dims(extents.iter().map(|e| Dim::Known(*e)).collect())
    }

    pub fn rank_known(&self) -> bool {
        self.dims.is_some()
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    pub fn dim(&self, j: usize) -> Option<Dim> {
        self.dims.as_ref().and_then(|d| d.get(j).copied())
    }

    pub fn dims(&self) -> Option<&[Dim]> {
        self.dims.as_deref()
    }
}

/// Inferred shapes for every output of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeContext {
    outputs: Vec<OutputShape>,
}

impl ShapeContext {
    pub fn new(outputs: Vec<OutputShape>) -> Self {
        Self { outputs }
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn output(&self, i: usize) -> Option<&OutputShape> {
        self.outputs.get(i)
    }
}

/// Shape-inference lookup, provided by the host graph pipeline. `None` means
/// no shape information is available for the node at all.
pub trait ShapeSource: Send + Sync {
    fn shape_for_node(&self, node: &NodeDef) -> Option<ShapeContext>;
}
