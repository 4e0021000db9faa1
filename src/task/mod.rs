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

//! The uniform task contract the scheduler drives.

pub mod exec;

pub use exec::{make_exec_task, ExecTask};

use crate::device::DeviceKind;
use crate::error::OpStatus;
use crate::resources::monitor::ResourceContext;
use crate::resources::ResourceMap;

/// Completion callbacks for one run cycle.
///
/// Exactly one of `done`/`mem_failure` fires per cycle; `launched` fires when
/// the task has released the scheduler thread and always strictly precedes
/// `done`. `done` is the last observable effect and may drop the task.
pub struct Callbacks {
    pub launched: Option<Box<dyn FnOnce() + Send>>,
    pub done: Box<dyn FnOnce(OpStatus) + Send>,
    /// OOM signal; when absent, OOM surfaces through `done` instead.
    pub mem_failure: Option<Box<dyn FnOnce() + Send>>,
}

impl Callbacks {
    pub fn on_done(done: impl FnOnce(OpStatus) + Send + 'static) -> Self {
        Self {
            launched: None,
            done: Box::new(done),
            mem_failure: None,
        }
    }

    pub fn with_launched(mut self, launched: impl FnOnce() + Send + 'static) -> Self {
        self.launched = Some(Box::new(launched));
        self
    }

    pub fn with_mem_failure(mut self, mem_failure: impl FnOnce() + Send + 'static) -> Self {
        self.mem_failure = Some(Box::new(mem_failure));
        self
    }
}

/// A schedulable unit binding one graph node to a kernel invocation.
///
/// The scheduler's protocol: probe `supported_device_types` and
/// `estimated_usage` per candidate device, reserve through the monitor,
/// `prepare` with the resulting context, then `run`. On `mem_failure` it
/// releases the pre-allocation and re-submits; `estimated_usage` shrinks with
/// each recorded failure.
pub trait OperationTask: Send {
    fn debug_string(&self) -> String;

    /// Conservative upper bound on peak concurrent usage for running on
    /// `dev`; memoized per device within a failure epoch.
    fn estimated_usage(&mut self, dev: crate::device::DeviceSpec) -> ResourceMap;

    /// Device kinds the underlying operator has kernels for. Never empty for
    /// a runnable task.
    fn supported_device_types(&self) -> &[DeviceKind];

    /// Monotone count of OOM retries so far.
    fn failed_times(&self) -> u32;

    /// Binds the task to the context's device. `false` means the scheduler
    /// must pick another device (unsupported kind, kernel pinned elsewhere,
    /// or device lookup failure); no reservation is consumed either way.
    fn prepare(&mut self, rctx: ResourceContext) -> bool;

    /// Executes the kernel. Never panics out; every outcome arrives through
    /// `cbs` in the documented order.
    fn run(&mut self, cbs: Callbacks);

    /// The estimate backing the most recent (or pending) reservation.
    fn last_usage(&self, dev: crate::device::DeviceSpec) -> Option<ResourceMap>;

    /// Frees the task's reservation. Idempotent, safe after finish.
    fn release_pre_allocation(&self);
}
