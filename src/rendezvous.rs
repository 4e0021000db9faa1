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

//! Cross-device tensor mailbox used by Send/Recv pairs.
//!
//! The mailbox implementation is the host's; the engine only wraps it so
//! transfers launched from a task route through that task's device view.

use std::sync::Arc;

use tracing::trace;

use crate::device::PerTaskDevice;
use crate::error::OpError;
use crate::graph::TensorVal;

/// Completion callback for an asynchronous receive. The `bool` is the dead
/// bit travelling with the tensor.
pub type RecvDone = Box<dyn FnOnce(Result<(TensorVal, bool), OpError>) + Send>;

/// Host-provided tensor mailbox.
pub trait Rendezvous: Send + Sync {
    fn send(&self, key: &str, val: TensorVal, is_dead: bool) -> Result<(), OpError>;
    fn recv_async(&self, key: &str, done: RecvDone);
}

/// Per-run wrapper pairing the host mailbox with the task's device view, so
/// a Send/Recv kernel launched by this task resolves the right device for
/// its transfers.
pub struct MultiDeviceRendezvous {
    device: Arc<dyn PerTaskDevice>,
    inner: Arc<dyn Rendezvous>,
}

impl MultiDeviceRendezvous {
    pub fn new(device: Arc<dyn PerTaskDevice>, inner: Arc<dyn Rendezvous>) -> Self {
        Self { device, inner }
    }

    pub fn device(&self) -> &Arc<dyn PerTaskDevice> {
        &self.device
    }
}

impl Rendezvous for MultiDeviceRendezvous {
    fn send(&self, key: &str, val: TensorVal, is_dead: bool) -> Result<(), OpError> {
        trace!(key, device = self.device.name(), is_dead, "rendezvous send");
        self.inner.send(key, val, is_dead)
    }

    fn recv_async(&self, key: &str, done: RecvDone) {
        trace!(key, device = self.device.name(), "rendezvous recv");
        self.inner.recv_async(key, done);
    }
}
