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

//! `ExecTask` binds one graph node to a kernel and drives the whole
//! estimate → prepare → run → finish pipeline.
//!
//! The task estimates what the kernel will consume before it runs (from
//! inferred output shapes on the first attempt, from observed session usage
//! on retries), executes on a per-task device view that charges every
//! allocation against the reservation, and hands outputs back to the host
//! executor for propagation. A kernel that reports `ResourceExhausted` bumps
//! the failure counter and signals the scheduler instead of completing; the
//! next estimate shrinks by half per remaining retry, so a task that first
//! reserved too pessimistically eventually fits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::device::{DeviceError, DeviceItem, DeviceKind, DeviceSpec};
use crate::error::{OpError, OpStatus};
use crate::executor::{ExecutorContext, NodeStats, ReadySeq};
use crate::graph::{EntryVec, TaggedNode};
use crate::kernel::{KernelContext, KernelDone, KernelParams, MemoryType, OpKernel};
use crate::options::EngineOptions;
use crate::rendezvous::MultiDeviceRendezvous;
use crate::resources::monitor::ResourceContext;
use crate::resources::{ResourceMap, ResourceTag};
use crate::task::{Callbacks, OperationTask};

/// Builds an [`ExecTask`] for one tagged node, boxed behind the scheduler's
/// task contract.
pub fn make_exec_task(
    exec: Arc<dyn ExecutorContext>,
    node: TaggedNode,
    opts: &EngineOptions,
) -> Box<dyn OperationTask> {
    Box::new(ExecTask::new(exec, node, opts.max_failures))
}

pub struct ExecTask {
    exec: Arc<dyn ExecutorContext>,
    node: TaggedNode,
    max_failures: u32,
    /// Shared with the async completion closure, which records OOMs after
    /// `run` has already returned.
    failures: Arc<AtomicU32>,
    supported: Vec<DeviceKind>,
    cached_usage: HashMap<DeviceSpec, ResourceMap>,
    rctx: Option<Arc<ResourceContext>>,
    ditem: Option<DeviceItem>,
    op_kernel: Option<OpKernel>,
    kernel_is_async: bool,
    has_ref_input: bool,
    scheduled_at: Option<Instant>,
}

impl ExecTask {
    pub fn new(exec: Arc<dyn ExecutorContext>, node: TaggedNode, max_failures: u32) -> Self {
        let supported = match exec.kernels().supported_device_types(&node.node) {
            Ok(kinds) => kinds,
            Err(e) => {
                warn!(
                    node = %node.node.name,
                    error = %e,
                    "error while querying supported devices for node"
                );
                Vec::new()
            }
        };

        let mut task = Self {
            exec,
            node,
            max_failures,
            failures: Arc::new(AtomicU32::new(0)),
            supported,
            cached_usage: HashMap::new(),
            rctx: None,
            ditem: None,
            op_kernel: None,
            kernel_is_async: false,
            has_ref_input: false,
            scheduled_at: None,
        };

        // Pre-compute estimates so the scheduler's first probe is cheap.
        for kind in task.supported.clone() {
            task.estimated_usage(DeviceSpec::new(kind, 0));
        }
        task
    }

    /// Whether the most recent run classified the kernel as asynchronous.
    pub fn kernel_is_async(&self) -> bool {
        self.kernel_is_async
    }

    fn lookup_device(&self, rctx: &Arc<ResourceContext>) -> Result<DeviceItem, DeviceError> {
        let device = self.exec.devices().lookup(rctx.spec())?;
        let per_task = device.create_per_task_device(self.exec.graph_id(), Arc::clone(rctx))?;
        let function_library = self.exec.create_function_library(&per_task);
        let device_record_tensor_access = per_task.requires_recording_accessed_tensors();
        Ok(DeviceItem {
            device: per_task,
            function_library,
            device_record_tensor_access,
        })
    }

    /// Shape-inference estimate: per output, `product(dims) × sizeof(dtype)`,
    /// charged to the device or (for host-memory outputs) to the host CPU.
    /// Outputs with unknown rank or any unknown dimension contribute zero.
    fn estimate_from_shapes(&self, dev: DeviceSpec) -> ResourceMap {
        let node = &self.node.node;
        let mut res = ResourceMap::new();

        let Some(shape_ctx) = self.exec.shapes().shape_for_node(node) else {
            warn!(node = %node.name, "shape information not available for node");
            return res;
        };

        let output_mtypes = match self
            .exec
            .memory_types()
            .memory_types_for_node(node, dev.kind)
        {
            Ok((_input_mtypes, output_mtypes)) => Some(output_mtypes),
            Err(e) => {
                warn!(
                    device = %dev,
                    error = %e,
                    "kernel not found on device, resource estimation may be inaccurate"
                );
                None
            }
        };

        let dev_tag = ResourceTag::memory(dev);
        let cpu_tag = ResourceTag::memory(DeviceSpec::cpu(0));

        for i in 0..shape_ctx.num_outputs() {
            let Some(shape) = shape_ctx.output(i) else {
                continue;
            };
            let Some(dims) = shape.dims() else {
                warn!(output = i, node = %node.name, "output of node has unknown rank");
                continue;
            };
            let mut count: u64 = 1;
            let mut complete = true;
            for dim in dims {
                match dim.value() {
                    Some(v) => count = count.saturating_mul(v),
                    None => {
                        warn!(output = i, node = %node.name, "output of node has unknown dim");
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }
            let Some(dtype) = node.output_dtypes.get(i) else {
                warn!(output = i, node = %node.name, "output has no dtype recorded");
                continue;
            };
            let subtotal = count as f64 * dtype.size_in_bytes() as f64;
            trace!(output = i, node = %node.name, dtype = %dtype, subtotal, "estimated output");

            let on_host = output_mtypes
                .as_ref()
                .and_then(|m| m.get(i))
                .is_some_and(|m| *m == MemoryType::HostMemory);
            if on_host {
                res.add(cpu_tag, subtotal);
            } else {
                res.add(dev_tag, subtotal);
            }
        }
        res
    }

    /// Handles a `ResourceExhausted` status from the kernel: bumps the
    /// failure counter and signals the scheduler. Returns the callbacks when
    /// the status was anything else.
    fn maybe_memory_failure(
        status: &OpStatus,
        has_ref_input: bool,
        failures: &AtomicU32,
        cbs: Callbacks,
    ) -> Option<Callbacks> {
        let Err(e) = status else {
            return Some(cbs);
        };
        if !e.is_resource_exhausted() {
            return Some(cbs);
        }
        // No rollback is implemented, so OOM must never reach an op that
        // wrote through a reference input.
        assert!(
            !has_ref_input,
            "kernel with reference inputs reported resource exhaustion"
        );
        failures.fetch_add(1, Ordering::AcqRel);
        match cbs.mem_failure {
            Some(mem_failure) => mem_failure(),
            // Legacy callers treat OOM as fatal; give them the status.
            None => (cbs.done)(Err(e.clone())),
        }
        None
    }

    fn finish(&mut self, status: OpStatus, cbs: Callbacks, ready: ReadySeq) {
        self.exec.maybe_mark_completed(&self.node);
        let completed = self.exec.node_done(&status, &self.node, ready, true);
        if completed {
            self.exec.finish();
        }
        if let Some(launched) = cbs.launched {
            launched();
        }
        if let Some(rctx) = &self.rctx {
            rctx.release();
        }
        self.exec.num_finished_ops().notify(1);
        // Last act: `done` may drop this task.
        (cbs.done)(status);
    }
}

impl OperationTask for ExecTask {
    fn debug_string(&self) -> String {
        format!(
            "ExecTask(name={}, session={}, failures={})",
            self.node.node.name,
            self.exec.session_handle(),
            self.failures.load(Ordering::Acquire)
        )
    }

    fn estimated_usage(&mut self, dev: DeviceSpec) -> ResourceMap {
        // Short-cut if this task has failed before: observed session usage,
        // shrunk by half per retry already spent, beats shape guesses.
        let failures = self.failures.load(Ordering::Acquire);
        if failures > 0 {
            match self
                .exec
                .session_tracker()
                .usage(self.exec.session_handle())
            {
                Some(usage) => {
                    let mut merged = usage.merged();
                    let mut f = failures;
                    if f > self.max_failures {
                        warn!(
                            failures = f,
                            max = self.max_failures,
                            "failure count exceeds maximum failures"
                        );
                        f = self.max_failures;
                    }
                    let scale = 1u64 << (self.max_failures + 1 - f);
                    merged.scale(1.0 / scale as f64);
                    self.cached_usage.insert(dev, merged);
                }
                None => {
                    // Fall back to the shape-based estimation below.
                    error!(
                        node = %self.node.node.name,
                        session = self.exec.session_handle(),
                        "no session usage found for exec task"
                    );
                }
            }
        }

        // Fast path from cache.
        if let Some(cached) = self.cached_usage.get(&dev) {
            return cached.clone();
        }

        let res = self.estimate_from_shapes(dev);
        self.cached_usage.insert(dev, res.clone());
        res
    }

    fn supported_device_types(&self) -> &[DeviceKind] {
        &self.supported
    }

    fn failed_times(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    fn prepare(&mut self, rctx: ResourceContext) -> bool {
        let rctx = Arc::new(rctx);
        self.rctx = Some(Arc::clone(&rctx));

        let spec = rctx.spec();
        if !self.supported.contains(&spec.kind) {
            return false;
        }

        let ditem = match self.lookup_device(&rctx) {
            Ok(item) => item,
            Err(e) => {
                error!(device = %spec, error = %e, "cannot bind task to device");
                return false;
            }
        };
        ditem.device.set_resource_context(Arc::clone(&rctx));
        let device_name = ditem.device.name().to_string();
        self.ditem = Some(ditem);

        // First check whether the kernel already exists on some device.
        self.op_kernel = None;
        match self.exec.kernels().find_kernel(&self.node.node) {
            Ok(Some(cached)) => match cached.device_name {
                None => {
                    warn!(
                        node = %self.node.node.name,
                        "kernel was created before, but its device is not recorded"
                    );
                    false
                }
                Some(name) if name == device_name => {
                    self.op_kernel = Some(cached.kernel);
                    true
                }
                Some(name) => {
                    trace!(
                        previous = %name,
                        requested = %device_name,
                        "stateful kernel can not be moved"
                    );
                    false
                }
            },
            Ok(None) => true,
            Err(e) => {
                error!(
                    node = %self.node.node.name,
                    error = %e,
                    "failed to find kernel for node"
                );
                // It is okay; the kernel gets created inside run.
                true
            }
        }
    }

    fn run(&mut self, cbs: Callbacks) {
        let node = self.node.clone();

        let Some(ditem) = self.ditem.clone() else {
            self.finish(
                Err(OpError::FailedPrecondition(
                    "run called before a successful prepare".into(),
                )),
                cbs,
                Vec::new(),
            );
            return;
        };

        // Instantiate the kernel if prepare did not adopt a cached one.
        // Failures here surface as task failures, not prepare failures.
        let kernel = match self.op_kernel.clone() {
            Some(kernel) => kernel,
            None => match self.exec.kernels().create_kernel(&node.node, &ditem) {
                Ok(kernel) => {
                    self.op_kernel = Some(kernel.clone());
                    kernel
                }
                Err(e) => {
                    error!(node = %node.node.name, error = %e, "error when creating kernel for node");
                    self.finish(Err(e), cbs, Vec::new());
                    return;
                }
            },
        };

        self.kernel_is_async = kernel.is_async();
        self.has_ref_input = node.node.has_ref_input();

        // Track allocations if and only if we are collecting statistics.
        let mut stats = if self.exec.collects_stats() && !node.is_dead {
            let mut s = NodeStats::new(node.node.name.clone());
            s.set_scheduled(self.scheduled_at);
            s.set_all_start();
            Some(s)
        } else {
            None
        };
        let track_allocations = stats.is_some();

        debug!(
            node = node.node.id,
            step = self.exec.step_id(),
            op = %node.node.op,
            is_dead = node.is_dead,
            device = ditem.device.name(),
            "process node"
        );

        // Only execute this node if it is not dead or it is a transfer node:
        // transfers must run so the dead bit can propagate across devices.
        if node.is_dead && !node.node.is_transfer {
            let outputs: EntryVec = vec![None; node.node.num_outputs()];
            let ready = self.exec.propagate_outputs(&node, outputs);
            self.finish(Ok(()), cbs, ready);
            return;
        }

        let prepared = match self.exec.prepare_inputs(&node, &kernel, &ditem.device) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.finish(Err(e), cbs, Vec::new());
                return;
            }
        };

        let local_rendez = Arc::new(MultiDeviceRendezvous::new(
            Arc::clone(&ditem.device),
            self.exec.rendezvous(),
        ));
        let params = KernelParams {
            node: node.node.id,
            step_id: self.exec.step_id(),
            frame_iter: (node.frame_id, node.iter),
            is_input_dead: prepared.is_input_dead,
            record_tensor_accesses: ditem.device_record_tensor_access,
            track_allocations,
        };
        let mut ctx = KernelContext::new(
            Arc::clone(&ditem.device),
            Arc::clone(&ditem.function_library),
            Some(local_rendez),
            params,
            prepared.inputs,
            node.node.num_outputs(),
        );

        match kernel {
            OpKernel::Async(async_kernel) => {
                trace!("launch async kernel");
                let Callbacks {
                    launched,
                    done,
                    mem_failure,
                } = cbs;

                // The closure captures only what it needs, never the task:
                // `done` may be the last owner of this task and drop it.
                let exec = Arc::clone(&self.exec);
                let device = Arc::clone(&ditem.device);
                let record_access = ditem.device_record_tensor_access;
                let failures = Arc::clone(&self.failures);
                let has_ref_input = self.has_ref_input;
                let rctx = self.rctx.clone();
                let async_node = node.clone();
                let mut stats = stats;
                if let Some(st) = stats.as_mut() {
                    st.set_op_start();
                }

                let async_done: KernelDone = Box::new(move |mut ctx: KernelContext| {
                    // Inspect return state for retrying on memory failure.
                    let cbs = Callbacks {
                        launched: None,
                        done,
                        mem_failure,
                    };
                    let kernel_status = ctx.status().clone();
                    let Some(cbs) =
                        Self::maybe_memory_failure(&kernel_status, has_ref_input, &failures, cbs)
                    else {
                        return;
                    };

                    trace!(node = %async_node.node.name, "async kernel done");
                    if let Some(st) = stats.as_mut() {
                        st.set_op_end();
                    }
                    let result = exec.process_outputs(&async_node, &mut ctx, stats.as_mut());
                    ctx.clear_inputs();

                    let mut status: OpStatus = Ok(());
                    let mut ready = ReadySeq::new();
                    match result {
                        Ok(outputs) => {
                            ready = exec.propagate_outputs(&async_node, outputs);
                        }
                        Err(e) => status = Err(e),
                    }
                    if status.is_ok() && record_access {
                        let accessed = ctx.take_accessed_tensors();
                        if let Some(st) = stats.as_mut() {
                            st.set_referenced_tensors(accessed.len());
                        }
                        device.consume_accessed_tensors(accessed);
                    }

                    exec.maybe_mark_completed(&async_node);
                    let completed = exec.node_done(&status, &async_node, ready, false);
                    if completed {
                        exec.finish();
                    }
                    if let Some(rctx) = &rctx {
                        rctx.release();
                    }
                    exec.num_finished_ops().notify(1);
                    // Last act: `done` may drop the task.
                    (cbs.done)(status);
                });

                ditem.device.compute_async(async_kernel, ctx, async_done);
                // The enqueue has released this thread; completion arrives on
                // a device-callback thread.
                if let Some(launched) = launched {
                    launched();
                }
            }
            OpKernel::Sync(sync_kernel) => {
                trace!("launch sync kernel");
                if let Some(st) = stats.as_mut() {
                    st.set_op_start();
                }
                ditem.device.compute(sync_kernel.as_ref(), &mut ctx);
                if let Some(st) = stats.as_mut() {
                    st.set_op_end();
                }

                // Inspect return state for retrying on memory failure.
                let kernel_status = ctx.status().clone();
                let Some(cbs) = Self::maybe_memory_failure(
                    &kernel_status,
                    self.has_ref_input,
                    &self.failures,
                    cbs,
                ) else {
                    return;
                };

                let result = self.exec.process_outputs(&node, &mut ctx, stats.as_mut());
                ctx.clear_inputs();

                let mut status: OpStatus = Ok(());
                let mut ready = ReadySeq::new();
                match result {
                    Ok(outputs) => {
                        trace!("propagate outputs");
                        ready = self.exec.propagate_outputs(&node, outputs);
                    }
                    Err(e) => status = Err(e),
                }
                if status.is_ok() && ditem.device_record_tensor_access {
                    let accessed = ctx.take_accessed_tensors();
                    if let Some(st) = stats.as_mut() {
                        st.set_referenced_tensors(accessed.len());
                    }
                    ditem.device.consume_accessed_tensors(accessed);
                }
                if stats.is_some() {
                    self.scheduled_at = Some(Instant::now());
                }
                self.finish(status, cbs, ready);
            }
        }
    }

    fn last_usage(&self, dev: DeviceSpec) -> Option<ResourceMap> {
        self.cached_usage.get(&dev).cloned()
    }

    fn release_pre_allocation(&self) {
        if let Some(rctx) = &self.rctx {
            rctx.release();
        }
    }
}

impl Drop for ExecTask {
    fn drop(&mut self) {
        // The kernel cache owns the kernel; tell it this binding is gone.
        if let (Some(kernel), Some(ditem)) = (&self.op_kernel, &self.ditem) {
            self.exec
                .kernels()
                .delete_kernel(&self.node.node, kernel, &ditem.function_library);
        }
    }
}
