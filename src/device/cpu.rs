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

//! Host CPU device. Compute delegates straight to the kernel; the per-task
//! view only adds ticket-scoped accounting.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::device::{Device, DeviceError, DeviceSpec, PerTaskDevice};
use crate::error::OpError;
use crate::graph::{GraphId, TensorRef};
use crate::kernel::{AsyncKernel, KernelContext, KernelDone, SyncKernel};
use crate::resources::monitor::ResourceContext;

pub struct CpuDevice {
    name: String,
    spec: DeviceSpec,
}

impl CpuDevice {
    pub fn new(ordinal: u32) -> Self {
        let spec = DeviceSpec::cpu(ordinal);
        Self {
            name: spec.to_string(),
            spec,
        }
    }
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> DeviceSpec {
        self.spec
    }

    fn create_per_task_device(
        &self,
        _graph: GraphId,
        rctx: Arc<ResourceContext>,
    ) -> Result<Arc<dyn PerTaskDevice>, DeviceError> {
        Ok(Arc::new(PerTaskCpuDevice {
            name: self.name.clone(),
            spec: self.spec,
            rctx: Mutex::new(Some(rctx)),
        }))
    }

    fn flush_cache_for(&self, _graph: GraphId) {}
}

pub struct PerTaskCpuDevice {
    name: String,
    spec: DeviceSpec,
    rctx: Mutex<Option<Arc<ResourceContext>>>,
}

impl PerTaskDevice for PerTaskCpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> DeviceSpec {
        self.spec
    }

    fn requires_recording_accessed_tensors(&self) -> bool {
        false
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
                self.name
            ))),
        }
    }

    fn refund(&self, bytes: usize) {
        if let Some(rctx) = self.resource_context() {
            rctx.refund_memory(bytes);
        }
    }

    fn compute(&self, kernel: &dyn SyncKernel, ctx: &mut KernelContext) {
        kernel.compute(ctx);
    }

    fn compute_async(&self, kernel: Arc<dyn AsyncKernel>, ctx: KernelContext, done: KernelDone) {
        kernel.compute_async(ctx, done);
    }

    fn consume_accessed_tensors(&self, tensors: Vec<TensorRef>) {
        // CPU memory reclaims eagerly; nothing to defer.
        trace!(count = tensors.len(), "accessed tensors dropped");
    }
}

fn lock<T>(mu: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mu.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
