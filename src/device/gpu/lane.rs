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

//! GPU lanes: best-fit partitions of a GPU's memory.
//!
//! A lane is a memory slice with its own [`GpuDevice`] and base stream
//! index. Sessions request lanes sized to their memory limit and persistent
//! occupation; requests that do not fit wait in a FIFO queue and are
//! re-driven every time a holder releases its lane.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::device::gpu::GpuDevice;

/// Requested layout: one entry per lane, memory limit paired with the part
/// the session occupies persistently. Only single-lane layouts are accepted
/// for now; multi-GPU placement needs a global lock over all control blocks.
#[derive(Debug, Clone)]
pub struct LaneLayout {
    pub memory_limits: Vec<usize>,
    pub persistent_occupation: Vec<usize>,
}

pub type RequestLaneCallback = Box<dyn FnOnce(Vec<LaneHolder>) + Send>;

/// One memory slice of a GPU, owning its device instance.
pub struct GpuLane {
    gpu_index: u32,
    total_memory: usize,
    base_stream: usize,
    device: Arc<GpuDevice>,
    // Guards available memory and the holder count together.
    state: Mutex<LaneState>,
}

#[derive(Debug)]
struct LaneState {
    available_memory: usize,
    holders: usize,
}

impl GpuLane {
    /// Opens a lane that already carries its first hold.
    fn new_held(
        gpu_index: u32,
        total_memory: usize,
        base_stream: usize,
        max_streams: usize,
        persistent: usize,
    ) -> Self {
        Self {
            gpu_index,
            total_memory,
            base_stream,
            device: Arc::new(GpuDevice::new(gpu_index, max_streams, 1)),
            state: Mutex::new(LaneState {
                available_memory: total_memory - persistent,
                holders: 1,
            }),
        }
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    pub fn available_memory(&self) -> usize {
        lock(&self.state).available_memory
    }

    pub fn base_stream(&self) -> usize {
        self.base_stream
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.device
    }

    fn try_hold(&self, persistent: usize) -> bool {
        let mut state = lock(&self.state);
        if state.available_memory < persistent {
            return false;
        }
        state.available_memory -= persistent;
        state.holders += 1;
        true
    }

    /// Returns true when the last holder left.
    fn release_hold(&self, persistent: usize) -> bool {
        let mut state = lock(&self.state);
        state.available_memory += persistent;
        state.holders -= 1;
        state.holders == 0
    }
}

/// RAII grant of a lane. Dropping it releases the hold and re-drives the
/// pending queue.
pub struct LaneHolder {
    lane: Arc<GpuLane>,
    hold: usize,
    mgr: Arc<LaneMgrInner>,
}

impl LaneHolder {
    pub fn lane(&self) -> &Arc<GpuLane> {
        &self.lane
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        self.lane.device()
    }
}

impl Drop for LaneHolder {
    fn drop(&mut self) {
        let empty = self.lane.release_hold(self.hold);
        if empty {
            self.mgr.maybe_remove_lane(&self.lane);
        }
        LaneMgrInner::process_requests(&self.mgr);
    }
}

struct GpuControlBlock {
    index: u32,
    total_memory: usize,
    available_memory: usize,
    /// Kept ordered by available memory, small to large, so best-fit reuse
    /// picks the snuggest lane first.
    lanes: Vec<Arc<GpuLane>>,
    next_base_stream: usize,
}

struct PendingRequest {
    layout: LaneLayout,
    cb: RequestLaneCallback,
}

struct LaneMgrInner {
    state: Mutex<MgrState>,
    max_streams_per_lane: usize,
}

struct MgrState {
    gpus: Vec<GpuControlBlock>,
    pending: VecDeque<PendingRequest>,
}

/// Partitions each GPU's memory into lanes on demand.
pub struct LaneMgr {
    inner: Arc<LaneMgrInner>,
}

impl LaneMgr {
    /// One control block per GPU, sized by total memory.
    pub fn new(gpu_memories: &[usize], max_streams_per_lane: usize) -> Self {
        let gpus = gpu_memories
            .iter()
            .enumerate()
            .map(|(i, total)| GpuControlBlock {
                index: i as u32,
                total_memory: *total,
                available_memory: *total,
                lanes: Vec::new(),
                next_base_stream: 0,
            })
            .collect();
        Self {
            inner: Arc::new(LaneMgrInner {
                state: Mutex::new(MgrState {
                    gpus,
                    pending: VecDeque::new(),
                }),
                max_streams_per_lane,
            }),
        }
    }

    /// Queues a lane request; `cb` fires (possibly immediately, on the
    /// calling thread) once a best-fit lane is found.
    pub fn request_lanes(&self, layout: LaneLayout, cb: RequestLaneCallback) {
        assert_eq!(
            layout.memory_limits.len(),
            layout.persistent_occupation.len(),
            "layout vectors must pair up"
        );
        assert_eq!(
            layout.memory_limits.len(),
            1,
            "only single-lane layouts are supported"
        );
        for (limit, persistent) in layout
            .memory_limits
            .iter()
            .zip(&layout.persistent_occupation)
        {
            assert!(persistent <= limit, "persistent occupation exceeds limit");
        }

        {
            let mut state = lock(&self.inner.state);
            state.pending.push_back(PendingRequest { layout, cb });
        }
        LaneMgrInner::process_requests(&self.inner);
    }

    /// Memory not yet committed to any lane on `gpu`.
    pub fn available_memory(&self, gpu: u32) -> usize {
        lock(&self.inner.state)
            .gpus
            .get(gpu as usize)
            .map(|g| g.available_memory)
            .unwrap_or(0)
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }
}

impl LaneMgrInner {
    /// Serves the queue FIFO; stops at the first request that does not fit
    /// so later arrivals cannot starve an earlier, larger request.
    fn process_requests(this: &Arc<Self>) {
        loop {
            // The callback runs outside the lock: it may drop a holder and
            // re-enter here.
            let served = {
                let mut state = lock(&this.state);
                let Some(req) = state.pending.pop_front() else {
                    break;
                };
                let memory = req.layout.memory_limits[0];
                let persistent = req.layout.persistent_occupation[0];
                let gcb = &mut state.gpus[0];
                match best_fit(gcb, memory, persistent, this.max_streams_per_lane) {
                    Some(lane) => Some((
                        req.cb,
                        LaneHolder {
                            lane,
                            hold: persistent,
                            mgr: Arc::clone(this),
                        },
                    )),
                    None => {
                        state.pending.push_front(req);
                        None
                    }
                }
            };
            match served {
                Some((cb, holder)) => cb(vec![holder]),
                None => break,
            }
        }
    }

    fn maybe_remove_lane(&self, lane: &Arc<GpuLane>) {
        let mut state = lock(&self.state);
        let gcb = &mut state.gpus[lane.gpu_index as usize];
        let before = gcb.lanes.len();
        gcb.lanes.retain(|l| !Arc::ptr_eq(l, lane));
        if gcb.lanes.len() < before {
            gcb.available_memory += lane.total_memory();
            debug!(
                gpu = gcb.index,
                reclaimed = lane.total_memory(),
                "lane removed"
            );
        }
    }
}

/// Best fit for `(memory, persistent)`: open a fresh lane when the GPU still
/// has headroom, otherwise reuse the smallest existing lane that is big
/// enough and has room for the persistent part.
fn best_fit(
    gcb: &mut GpuControlBlock,
    memory: usize,
    persistent: usize,
    max_streams: usize,
) -> Option<Arc<GpuLane>> {
    if gcb.available_memory >= memory {
        gcb.available_memory -= memory;
        let lane = Arc::new(GpuLane::new_held(
            gcb.index,
            memory,
            gcb.next_base_stream,
            max_streams,
            persistent,
        ));
        gcb.next_base_stream += max_streams;
        let pos = gcb
            .lanes
            .iter()
            .position(|l| l.available_memory() > lane.available_memory())
            .unwrap_or(gcb.lanes.len());
        gcb.lanes.insert(pos, Arc::clone(&lane));
        trace!(gpu = gcb.index, memory, "opened new lane");
        return Some(lane);
    }

    for lane in &gcb.lanes {
        if lane.total_memory() >= memory && lane.try_hold(persistent) {
            trace!(gpu = gcb.index, memory, "reusing lane");
            return Some(Arc::clone(lane));
        }
    }
    None
}

fn lock<T>(mu: &Mutex<T>) -> MutexGuard<'_, T> {
    match mu.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
