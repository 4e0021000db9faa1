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

//! Stream-multiplexed GPU device.
//!
//! The device owns a fixed pool of logical compute streams. Each task pins a
//! small set of streams through its per-task view, and a per-graph cache of
//! node-to-stream assignments keeps stream affinity across re-executions of
//! the same subgraph. Stateful ops require it, everything else just runs
//! faster with it.

pub mod lane;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::device::{Device, DeviceError, DeviceSpec, PerTaskDevice};
use crate::error::OpError;
use crate::graph::{GraphId, NodeId, TensorRef};
use crate::kernel::{AsyncKernel, KernelContext, KernelDone, SyncKernel};
use crate::resources::monitor::ResourceContext;

pub const DEFAULT_MAX_STREAMS: usize = 128;

pub type StreamId = usize;

type NodeStreamMap = HashMap<NodeId, StreamId>;

fn lock<T>(mu: &Mutex<T>) -> MutexGuard<'_, T> {
    match mu.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fixed-size pool of logical compute streams. Selection is deterministic:
/// smallest free indices first.
#[derive(Debug)]
pub struct StreamPool {
    used: Mutex<Vec<bool>>,
}

impl StreamPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            used: Mutex::new(vec![false; capacity]),
        }
    }

    /// Takes up to `n` free streams; may return fewer (including none) when
    /// the pool runs dry. Never blocks.
    pub fn allocate(&self, n: usize) -> Vec<StreamId> {
        let mut used = lock(&self.used);
        let mut out = Vec::with_capacity(n);
        for (id, in_use) in used.iter_mut().enumerate() {
            if out.len() == n {
                break;
            }
            if !*in_use {
                *in_use = true;
                out.push(id);
            }
        }
        out
    }

    /// Takes one specific stream if it is free.
    pub fn try_allocate_specific(&self, id: StreamId) -> bool {
        let mut used = lock(&self.used);
        match used.get_mut(id) {
            Some(in_use) if !*in_use => {
                *in_use = true;
                true
            }
            _ => false,
        }
    }

    /// Returns streams to the pool.
    pub fn free(&self, streams: &[StreamId]) {
        let mut used = lock(&self.used);
        for id in streams {
            if let Some(in_use) = used.get_mut(*id) {
                *in_use = false;
            }
        }
    }

    pub fn available(&self) -> usize {
        lock(&self.used).iter().filter(|u| !**u).count()
    }

    pub fn capacity(&self) -> usize {
        lock(&self.used).len()
    }
}

struct GpuShared {
    name: String,
    spec: DeviceSpec,
    streams: StreamPool,
    // Lock order when both are needed: stream pool before this cache.
    stream_assignments: Mutex<HashMap<GraphId, NodeStreamMap>>,
    deferred_releases: Mutex<Vec<TensorRef>>,
}

/// GPU device multiplexing a finite stream pool across tasks.
pub struct GpuDevice {
    shared: Arc<GpuShared>,
    streams_per_task: usize,
}

impl GpuDevice {
    pub fn new(ordinal: u32, max_streams: usize, streams_per_task: usize) -> Self {
        let spec = DeviceSpec::gpu(ordinal);
        Self {
            shared: Arc::new(GpuShared {
                name: spec.to_string(),
                spec,
                streams: StreamPool::new(max_streams),
                stream_assignments: Mutex::new(HashMap::new()),
                deferred_releases: Mutex::new(Vec::new()),
            }),
            streams_per_task: streams_per_task.max(1),
        }
    }

    pub fn stream_pool(&self) -> &StreamPool {
        &self.shared.streams
    }

    /// Tensors whose reclamation was deferred until the device's streams
    /// quiesce; the maintenance pass drains them here.
    pub fn take_deferred_releases(&self) -> Vec<TensorRef> {
        std::mem::take(&mut lock(&self.shared.deferred_releases))
    }

    /// Cached stream assignment for a node, if any. Affinity survives task
    /// teardown until the graph is flushed.
    pub fn cached_stream(&self, graph: GraphId, node: NodeId) -> Option<StreamId> {
        lock(&self.shared.stream_assignments)
            .get(&graph)
            .and_then(|m| m.get(&node))
            .copied()
    }
}

impl Device for GpuDevice {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn spec(&self) -> DeviceSpec {
        self.shared.spec
    }

    fn create_per_task_device(
        &self,
        graph: GraphId,
        rctx: Arc<ResourceContext>,
    ) -> Result<Arc<dyn PerTaskDevice>, DeviceError> {
        let held = self.shared.streams.allocate(self.streams_per_task);
        if held.is_empty() {
            // Fail fast instead of blocking; the scheduler retries later.
            return Err(DeviceError::StreamsExhausted(self.shared.spec));
        }
        trace!(device = %self.shared.spec, streams = ?held, "per-task view pinned");
        Ok(Arc::new(PerTaskGpuDevice {
            shared: Arc::clone(&self.shared),
            graph,
            held: Mutex::new(held),
            rctx: Mutex::new(Some(rctx)),
        }))
    }

    fn flush_cache_for(&self, graph: GraphId) {
        lock(&self.shared.stream_assignments).remove(&graph);
    }
}

/// Task-scoped GPU view holding the task's pinned streams.
pub struct PerTaskGpuDevice {
    shared: Arc<GpuShared>,
    graph: GraphId,
    held: Mutex<Vec<StreamId>>,
    rctx: Mutex<Option<Arc<ResourceContext>>>,
}

impl PerTaskGpuDevice {
    /// Stream a node computes on. Prefers the cached assignment (grabbing it
    /// from the pool when it is free), otherwise settles on one of the held
    /// streams and records the choice for the next execution.
    fn stream_for_node(&self, node: NodeId) -> StreamId {
        let mut held = lock(&self.held);

        let cached = {
            lock(&self.shared.stream_assignments)
                .get(&self.graph)
                .and_then(|m| m.get(&node))
                .copied()
        };
        if let Some(id) = cached {
            if held.contains(&id) {
                return id;
            }
            if self.shared.streams.try_allocate_specific(id) {
                held.push(id);
                return id;
            }
        }

        let id = held[node % held.len()];
        lock(&self.shared.stream_assignments)
            .entry(self.graph)
            .or_default()
            .insert(node, id);
        id
    }
}

impl PerTaskDevice for PerTaskGpuDevice {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn spec(&self) -> DeviceSpec {
        self.shared.spec
    }

    fn requires_recording_accessed_tensors(&self) -> bool {
        true
    }

    fn set_resource_context(&self, rctx: Arc<ResourceContext>) {
        *lock(&self.rctx) = Some(rctx);
    }

    fn resource_context(&self) -> Option<Arc<ResourceContext>> {
        lock(&self.rctx).clone()
    }

    fn allocate(&self, bytes: usize) -> Result<(), OpError> {
        match self.resource_context() {
            Some(rctx) => rctx.charge_memory(bytes).map_err(OpError::from),
            None => Err(OpError::FailedPrecondition(format!(
                "no resource context installed on {}",
                self.shared.name
            ))),
        }
    }

    fn refund(&self, bytes: usize) {
        if let Some(rctx) = self.resource_context() {
            rctx.refund_memory(bytes);
        }
    }

    fn compute(&self, kernel: &dyn SyncKernel, ctx: &mut KernelContext) {
        let stream = self.stream_for_node(ctx.node_id());
        trace!(node = ctx.node_id(), stream, "launch sync kernel");
        kernel.compute(ctx);
    }

    fn compute_async(&self, kernel: Arc<dyn AsyncKernel>, ctx: KernelContext, done: KernelDone) {
        let stream = self.stream_for_node(ctx.node_id());
        trace!(node = ctx.node_id(), stream, "launch async kernel");
        kernel.compute_async(ctx, done);
    }

    fn consume_accessed_tensors(&self, tensors: Vec<TensorRef>) {
        lock(&self.shared.deferred_releases).extend(tensors);
    }
}

impl Drop for PerTaskGpuDevice {
    fn drop(&mut self) {
        let held = std::mem::take(&mut *lock(&self.held));
        self.shared.streams.free(&held);
    }
}
