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

//! Devices and per-task device views.
//!
//! A [`Device`] is a physical execution resource registered once per process.
//! A [`PerTaskDevice`] is the thin façade a single task computes through: it
//! routes every allocation through the task's ticket, records which tensors
//! were touched when the device demands it, and on the GPU pins the task to a
//! small set of compute streams.

pub mod cpu;
pub mod gpu;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::OpError;
use crate::graph::{GraphId, TensorRef};
use crate::kernel::{AsyncKernel, FunctionLibrary, KernelContext, KernelDone, SyncKernel};
use crate::resources::monitor::ResourceContext;

/// Kind of execution device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Gpu => write!(f, "GPU"),
        }
    }
}

/// A concrete device: kind plus ordinal. Value type, usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub ordinal: u32,
}

impl DeviceSpec {
    pub fn new(kind: DeviceKind, ordinal: u32) -> Self {
        Self { kind, ordinal }
    }

    pub fn cpu(ordinal: u32) -> Self {
        Self::new(DeviceKind::Cpu, ordinal)
    }

    pub fn gpu(ordinal: u32) -> Self {
        Self::new(DeviceKind::Gpu, ordinal)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.ordinal)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("cannot find device for {0}")]
    NotFound(DeviceSpec),
    #[error("no free compute streams on {0}")]
    StreamsExhausted(DeviceSpec),
    #[error("device {0} already registered")]
    AlreadyRegistered(DeviceSpec),
}

/// Physical device registered with the engine.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> DeviceSpec;

    /// Builds the per-task view that scopes allocations to `rctx`'s ticket.
    /// GPU devices draw the task's compute streams here and may fail fast
    /// when the pool is dry.
    fn create_per_task_device(
        &self,
        graph: GraphId,
        rctx: Arc<ResourceContext>,
    ) -> Result<Arc<dyn PerTaskDevice>, DeviceError>;

    /// Drops cached per-graph state when the graph is torn down.
    fn flush_cache_for(&self, graph: GraphId);
}

/// Task-scoped device view. All kernel computation goes through one of
/// these; the physical device is never handed to a kernel directly.
pub trait PerTaskDevice: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> DeviceSpec;

    fn kind(&self) -> DeviceKind {
        self.spec().kind
    }

    /// Whether the device needs the list of tensors a kernel touched (GPU
    /// defers reclamation until its streams quiesce).
    fn requires_recording_accessed_tensors(&self) -> bool;

    /// Installs the ticket used for subsequent allocations.
    fn set_resource_context(&self, rctx: Arc<ResourceContext>);

    fn resource_context(&self) -> Option<Arc<ResourceContext>>;

    /// Charges `bytes` of device memory against the installed ticket.
    fn allocate(&self, bytes: usize) -> Result<(), OpError>;

    /// Returns `bytes` to the ticket.
    fn refund(&self, bytes: usize);

    /// Runs a synchronous kernel on the calling thread.
    fn compute(&self, kernel: &dyn SyncKernel, ctx: &mut KernelContext);

    /// Enqueues an asynchronous kernel; `done` fires when it completes,
    /// possibly on a device-callback thread.
    fn compute_async(&self, kernel: Arc<dyn AsyncKernel>, ctx: KernelContext, done: KernelDone);

    /// Takes ownership of the tensors a finished kernel touched.
    fn consume_accessed_tensors(&self, tensors: Vec<TensorRef>);
}

/// Per-task device plus the host resources that must stay alive for the
/// whole run. Dropped when the owning task is destroyed.
#[derive(Clone)]
pub struct DeviceItem {
    pub device: Arc<dyn PerTaskDevice>,
    pub function_library: Arc<dyn FunctionLibrary>,
    /// Cached `requires_recording_accessed_tensors` of the view.
    pub device_record_tensor_access: bool,
}

impl fmt::Debug for DeviceItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceItem")
            .field("device", &self.device.name())
            .field("record_access", &self.device_record_tensor_access)
            .finish()
    }
}

/// Process-wide device lookup.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceSpec, Arc<dyn Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, device: Arc<dyn Device>) -> Result<(), DeviceError> {
        let spec = device.spec();
        if self.devices.contains_key(&spec) {
            return Err(DeviceError::AlreadyRegistered(spec));
        }
        self.devices.insert(spec, device);
        Ok(())
    }

    pub fn lookup(&self, spec: DeviceSpec) -> Result<Arc<dyn Device>, DeviceError> {
        self.devices
            .get(&spec)
            .cloned()
            .ok_or(DeviceError::NotFound(spec))
    }

    pub fn specs(&self) -> impl Iterator<Item = DeviceSpec> + '_ {
        self.devices.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.devices.keys()).finish()
    }
}
