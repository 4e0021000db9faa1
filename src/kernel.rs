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

//! Kernel execution surface: sync/async kernel traits, the per-invocation
//! context kernels compute against, and the registry interfaces the engine
//! consumes from its host.

use std::fmt;
use std::sync::Arc;

use crate::device::{DeviceItem, DeviceKind, PerTaskDevice};
use crate::error::{OpError, OpStatus};
use crate::graph::{DType, EntryVec, NodeDef, NodeId, TensorRef, TensorVal};
use crate::rendezvous::MultiDeviceRendezvous;

/// Synchronous kernel: computes in place on the calling thread and records
/// its status in the context.
pub trait SyncKernel: Send + Sync {
    fn name(&self) -> &str;
    fn compute(&self, ctx: &mut KernelContext);
}

/// Completion callback for asynchronous kernels. Receives the context back
/// so the launching task can inspect status and outputs.
pub type KernelDone = Box<dyn FnOnce(KernelContext) + Send>;

/// Asynchronous kernel: takes ownership of the context, returns promptly and
/// calls `done` (possibly from another thread) when the computation ends.
pub trait AsyncKernel: Send + Sync {
    fn name(&self) -> &str;
    fn compute_async(&self, ctx: KernelContext, done: KernelDone);
}

/// A kernel bound to a node, classified at creation time.
#[derive(Clone)]
pub enum OpKernel {
    Sync(Arc<dyn SyncKernel>),
    Async(Arc<dyn AsyncKernel>),
}

impl OpKernel {
    pub fn name(&self) -> &str {
        match self {
            OpKernel::Sync(k) => k.name(),
            OpKernel::Async(k) => k.name(),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, OpKernel::Async(_))
    }
}

impl fmt::Debug for OpKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_async() { "async" } else { "sync" };
        write!(f, "OpKernel({}, {kind})", self.name())
    }
}

/// Opaque per-device function-library instance, created by the host when a
/// per-task device view is built and handed back at kernel deletion.
pub trait FunctionLibrary: Send + Sync {
    fn name(&self) -> &str;
}

/// Result of probing the process-wide kernel cache.
#[derive(Debug, Clone)]
pub struct CachedKernel {
    /// Device the kernel was first created on. `None` means the cache lost
    /// track, which fails `prepare` (stateful kernels may not migrate).
    pub device_name: Option<String>,
    pub kernel: OpKernel,
}

/// Process-wide kernel cache and factory, provided by the host. A kernel is
/// created at most once per (node, device) pair.
pub trait KernelRegistry: Send + Sync {
    /// Device kinds on which the node's operator has a registered kernel.
    fn supported_device_types(&self, node: &NodeDef) -> Result<Vec<DeviceKind>, OpError>;

    /// Probes the cache. `Ok(None)` means no kernel exists yet.
    fn find_kernel(&self, node: &NodeDef) -> Result<Option<CachedKernel>, OpError>;

    /// Creates (and caches) the kernel for `node` on the item's device.
    fn create_kernel(&self, node: &NodeDef, item: &DeviceItem) -> Result<OpKernel, OpError>;

    /// Releases the cached kernel when its owning task is destroyed.
    fn delete_kernel(&self, node: &NodeDef, kernel: &OpKernel, library: &Arc<dyn FunctionLibrary>);
}

/// Where an input or output tensor lives relative to the executing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    HostMemory,
    DeviceMemory,
}

/// Per-node memory-type lookup from the kernel registry, provided by the
/// host. Used by the estimator to charge host-memory outputs to the CPU.
pub trait MemoryTypeRegistry: Send + Sync {
    /// Memory type per input and per output slot of `node` on `device`.
    fn memory_types_for_node(
        &self,
        node: &NodeDef,
        device: DeviceKind,
    ) -> Result<(Vec<MemoryType>, Vec<MemoryType>), OpError>;
}

/// Parameters assembled by the task before compute.
#[derive(Debug, Clone)]
pub struct KernelParams {
    pub node: NodeId,
    pub step_id: u64,
    pub frame_iter: (u64, u64),
    pub is_input_dead: bool,
    pub record_tensor_accesses: bool,
    pub track_allocations: bool,
}

/// RAII scratch charge: refunds the device on drop, keeping allocate and
/// free paired even when a kernel bails early.
pub struct ScratchAllocation {
    device: Arc<dyn PerTaskDevice>,
    bytes: usize,
}

impl ScratchAllocation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for ScratchAllocation {
    fn drop(&mut self) {
        self.device.refund(self.bytes);
    }
}

/// Everything a kernel sees during one invocation: the per-task device view,
/// prepared inputs, output slots, status and the access-recording sink.
pub struct KernelContext {
    device: Arc<dyn PerTaskDevice>,
    function_library: Arc<dyn FunctionLibrary>,
    rendezvous: Option<Arc<MultiDeviceRendezvous>>,
    params: KernelParams,
    inputs: EntryVec,
    outputs: EntryVec,
    status: OpStatus,
    accessed: Vec<TensorRef>,
}

impl KernelContext {
    pub fn new(
        device: Arc<dyn PerTaskDevice>,
        function_library: Arc<dyn FunctionLibrary>,
        rendezvous: Option<Arc<MultiDeviceRendezvous>>,
        params: KernelParams,
        inputs: EntryVec,
        num_outputs: usize,
    ) -> Self {
        Self {
            device,
            function_library,
            rendezvous,
            params,
            inputs,
            outputs: vec![None; num_outputs],
            status: Ok(()),
            accessed: Vec::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn PerTaskDevice> {
        &self.device
    }

    pub fn function_library(&self) -> &Arc<dyn FunctionLibrary> {
        &self.function_library
    }

    pub fn rendezvous(&self) -> Option<&Arc<MultiDeviceRendezvous>> {
        self.rendezvous.as_ref()
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    pub fn node_id(&self) -> NodeId {
        self.params.node
    }

    pub fn is_input_dead(&self) -> bool {
        self.params.is_input_dead
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, i: usize) -> Option<&TensorVal> {
        self.inputs.get(i).and_then(Option::as_ref)
    }

    pub fn clear_inputs(&mut self) {
        for slot in &mut self.inputs {
            *slot = None;
        }
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn set_output(&mut self, i: usize, val: TensorVal) -> Result<(), OpError> {
        match self.outputs.get_mut(i) {
            Some(slot) => {
                *slot = Some(val);
                Ok(())
            }
            None => Err(OpError::InvalidArgument(format!(
                "output index {i} out of range ({} outputs)",
                self.outputs.len()
            ))),
        }
    }

    /// Allocates backing memory for output `i` through the task's ticket and
    /// fills the slot. Over-draw surfaces as `ResourceExhausted`.
    pub fn allocate_output(
        &mut self,
        i: usize,
        dtype: DType,
        shape: Vec<usize>,
    ) -> Result<(), OpError> {
        let val = TensorVal::new(dtype, shape, None);
        self.device.allocate(val.byte_size())?;
        self.set_output(i, val)
    }

    /// Charges scratch memory; the returned guard refunds on drop.
    pub fn allocate_scratch(&self, bytes: usize) -> Result<ScratchAllocation, OpError> {
        self.device.allocate(bytes)?;
        Ok(ScratchAllocation {
            device: Arc::clone(&self.device),
            bytes,
        })
    }

    pub fn record_tensor_access(&mut self, tensor: TensorRef) {
        if self.params.record_tensor_accesses {
            self.accessed.push(tensor);
        }
    }

    pub fn take_accessed_tensors(&mut self) -> Vec<TensorRef> {
        std::mem::take(&mut self.accessed)
    }

    /// Records a failure. The first error wins; later ones are dropped so
    /// the root cause survives to the task.
    pub fn set_status(&mut self, err: OpError) {
        if self.status.is_ok() {
            self.status = Err(err);
        }
    }

    pub fn status(&self) -> &OpStatus {
        &self.status
    }

    pub fn take_outputs(&mut self) -> EntryVec {
        std::mem::take(&mut self.outputs)
    }
}

impl fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelContext")
            .field("node", &self.params.node)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("status", &self.status)
            .finish()
    }
}
