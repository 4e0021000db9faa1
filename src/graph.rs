//! Graph-side vocabulary the engine executes against: node definitions,
//! frame/iteration tagging for loop support, and materialized tensor values.

use std::fmt;
use std::sync::Arc;

pub type NodeId = usize;
pub type GraphId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    I32,
    F32,
    BF16,
    F16,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::I32 => "i32",
            DType::F32 => "f32",
            DType::BF16 => "bf16",
            DType::F16 => "f16",
        }
    }

    /// Element width in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::I32 | DType::F32 => 4,
            DType::BF16 | DType::F16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an input slot carries a value or a mutable reference to state.
/// Reference inputs block the OOM rollback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Value,
    Ref,
}

/// Static definition of one graph node: the operator it runs plus the typed
/// input/output slots the executor wires up.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub id: NodeId,
    pub name: String,
    pub op: String,
    /// Value kind per input slot.
    pub inputs: Vec<ValueKind>,
    /// Output dtype per output slot.
    pub output_dtypes: Vec<DType>,
    /// Stateful nodes pin their kernel to the device it was created on.
    pub stateful: bool,
    /// Send/Recv transfer nodes run even when dead so the dead bit can
    /// propagate across devices.
    pub is_transfer: bool,
}

impl NodeDef {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.output_dtypes.len()
    }

    pub fn has_ref_input(&self) -> bool {
        self.inputs.iter().any(|k| *k == ValueKind::Ref)
    }
}

/// Graph node annotated with its frame/iteration coordinates for loop
/// support, plus the dead bit from predecessor propagation.
#[derive(Debug, Clone)]
pub struct TaggedNode {
    pub node: Arc<NodeDef>,
    pub frame_id: u64,
    pub iter: u64,
    pub is_dead: bool,
}

impl TaggedNode {
    pub fn live(node: Arc<NodeDef>) -> Self {
        Self {
            node,
            frame_id: 0,
            iter: 0,
            is_dead: false,
        }
    }

    pub fn dead(node: Arc<NodeDef>) -> Self {
        Self {
            is_dead: true,
            ..Self::live(node)
        }
    }
}

/// Materialized tensor value flowing between tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorVal {
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Optional constant fill value for all elements.
    pub fill: Option<f64>,
}

impl TensorVal {
    pub fn new(dtype: DType, shape: Vec<usize>, fill: Option<f64>) -> Self {
        Self { dtype, shape, fill }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }
}

/// Output/input slot vector; `None` marks an empty (dead) entry.
pub type EntryVec = Vec<Option<TensorVal>>;

/// Reference to a tensor touched during kernel execution, recorded when the
/// device requires access tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorRef(pub u64);
