// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Boundary to the host dataflow executor.
//!
//! The engine never owns the graph walk: it asks the executor to prepare
//! inputs, hands processed outputs back for propagation into the ready-set,
//! and reports completion through `node_done`. Everything here is a consumed
//! interface; tests drive the engine with stubs.

use std::sync::Arc;
use std::time::Instant;

use crate::device::{DeviceRegistry, PerTaskDevice};
use crate::error::{OpError, OpStatus};
use crate::graph::{EntryVec, GraphId, TaggedNode};
use crate::kernel::{
    FunctionLibrary, KernelContext, KernelRegistry, MemoryTypeRegistry, OpKernel,
};
use crate::rendezvous::Rendezvous;
use crate::resources::SessionTracker;
use crate::shape::ShapeSource;
use crate::sync::Semaphore;

/// Nodes that became ready after an output propagation, in dataflow order.
pub type ReadySeq = Vec<TaggedNode>;

/// Inputs materialized for one kernel invocation.
#[derive(Debug, Default)]
pub struct PreparedInputs {
    pub inputs: EntryVec,
    /// True when some input carries the dead bit (relevant for transfers).
    pub is_input_dead: bool,
}

/// Per-node execution statistics, collected only when the executor asks.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub node_name: String,
    pub scheduled_at: Option<Instant>,
    pub all_start: Option<Instant>,
    pub op_start: Option<Instant>,
    pub op_end: Option<Instant>,
    pub referenced_tensors: usize,
}

impl NodeStats {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            scheduled_at: None,
            all_start: None,
            op_start: None,
            op_end: None,
            referenced_tensors: 0,
        }
    }

    pub fn set_scheduled(&mut self, at: Option<Instant>) {
        self.scheduled_at = at;
    }

    pub fn set_all_start(&mut self) {
        self.all_start = Some(Instant::now());
    }

    pub fn set_op_start(&mut self) {
        self.op_start = Some(Instant::now());
    }

    pub fn set_op_end(&mut self) {
        self.op_end = Some(Instant::now());
    }

    pub fn set_referenced_tensors(&mut self, count: usize) {
        self.referenced_tensors = count;
    }

    /// Kernel wall time, when both ends were recorded.
    pub fn op_elapsed(&self) -> Option<std::time::Duration> {
        match (self.op_start, self.op_end) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }
}

/// Host executor state driving one graph execution.
///
/// The accessor half hands the engine its collaborators (registries, shape
/// source, session tracker); the verb half is the node lifecycle the original
/// dataflow loop exposes.
pub trait ExecutorContext: Send + Sync {
    fn graph_id(&self) -> GraphId;
    fn step_id(&self) -> u64;
    fn session_handle(&self) -> &str;

    fn devices(&self) -> &DeviceRegistry;
    fn kernels(&self) -> &dyn KernelRegistry;
    fn memory_types(&self) -> &dyn MemoryTypeRegistry;
    fn shapes(&self) -> &dyn ShapeSource;
    fn session_tracker(&self) -> &dyn SessionTracker;
    fn rendezvous(&self) -> Arc<dyn Rendezvous>;

    /// Function-library instance scoped to one per-task device view.
    fn create_function_library(&self, device: &Arc<dyn PerTaskDevice>) -> Arc<dyn FunctionLibrary>;

    /// Counting semaphore the executor waits on for in-flight tasks.
    fn num_finished_ops(&self) -> &Semaphore;

    /// Whether tasks should collect `NodeStats` this step.
    fn collects_stats(&self) -> bool;

    /// Materializes the node's inputs for the kernel.
    fn prepare_inputs(
        &self,
        node: &TaggedNode,
        kernel: &OpKernel,
        device: &Arc<dyn PerTaskDevice>,
    ) -> Result<PreparedInputs, OpError>;

    /// Validates and extracts the kernel's outputs from its context.
    fn process_outputs(
        &self,
        node: &TaggedNode,
        ctx: &mut KernelContext,
        stats: Option<&mut NodeStats>,
    ) -> Result<EntryVec, OpError>;

    /// Feeds outputs to downstream nodes; returns the newly-ready set.
    fn propagate_outputs(&self, node: &TaggedNode, outputs: EntryVec) -> ReadySeq;

    /// Marks the node completed in the graph view (loop bookkeeping).
    fn maybe_mark_completed(&self, node: &TaggedNode);

    /// Reports node completion. `inline` permits the executor to run chained
    /// ready nodes on the calling thread for locality (sync path only).
    /// Returns true when the whole executor just completed.
    fn node_done(&self, status: &OpStatus, node: &TaggedNode, ready: ReadySeq, inline: bool)
        -> bool;

    /// Final teardown once `node_done` reported completion.
    fn finish(&self);
}
