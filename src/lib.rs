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

//! MIND operator-execution engine for the shared serving runtime.
//!
//! The engine multiplexes many concurrent deep-learning sessions on the same
//! hardware by executing one graph node at a time under explicit resource
//! control:
//!
//! * **Estimate**: before a kernel runs, [`task::ExecTask`] bounds its peak
//!   usage, from inferred output shapes on the first attempt and from
//!   observed session usage on OOM retries.
//! * **Reserve**: the scheduler books that estimate with the process-wide
//!   [`resources::monitor::ResourceMonitor`] and hands the resulting ticket
//!   to the task.
//! * **Execute**: the kernel runs on a per-task device view
//!   ([`device::PerTaskDevice`]) that charges every allocation against the
//!   ticket; the GPU view additionally pins the task to compute streams from
//!   a shared pool.
//! * **Propagate**: outputs feed the host executor's ready-set before the
//!   task's `done` callback fires.
//! * **Retry**: a kernel reporting resource exhaustion signals the
//!   scheduler instead of completing; each retry shrinks the estimate by
//!   half until the task fits.
//!
//! The host dataflow executor, kernel registry, shape inference and session
//! tracking stay outside the crate and are consumed through the traits in
//! [`executor`], [`kernel`], [`shape`] and [`resources`].

pub mod device;
pub mod error;
pub mod executor;
pub mod graph;
pub mod kernel;
pub mod options;
pub mod rendezvous;
pub mod resources;
pub mod shape;
pub mod sync;
pub mod task;

pub use device::{DeviceKind, DeviceRegistry, DeviceSpec};
pub use error::{OpError, OpStatus};
pub use options::EngineOptions;
pub use resources::monitor::{ResourceContext, ResourceMonitor, Ticket};
pub use resources::{ResourceKind, ResourceMap, ResourceTag};
pub use task::{make_exec_task, Callbacks, ExecTask, OperationTask};
