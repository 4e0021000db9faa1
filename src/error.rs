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

//! Status codes shared by kernels, devices and the execution task.
//!
//! `OpError` is the engine-wide status surface: kernels record it in their
//! context, devices return it from allocations, and the task forwards it to
//! the `done` callback. `ResourceExhausted` is special-cased by the OOM-retry
//! path and must stay distinguishable from every other kind.

use thiserror::Error;

/// Structured error for operator execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    /// An allocation overdrew the task's reservation, or a reservation was
    /// denied. Recoverable by scaled retry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// A kernel, device or shape lookup came back empty.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// Device-internal failure. Fatal for the current task.
    #[error("internal: {0}")]
    Internal(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl OpError {
    /// True for the one error kind the task recovers from by retrying.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, OpError::ResourceExhausted(_))
    }
}

/// Result alias used wherever a kernel-style status is carried around.
pub type OpStatus = Result<(), OpError>;
