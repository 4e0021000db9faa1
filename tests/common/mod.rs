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

//! Shared stub environment for engine integration tests: an in-memory
//! executor, kernel registry, shape source and session tracker wired around
//! real devices and a real resource monitor.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use mind_exec::device::cpu::CpuDevice;
use mind_exec::device::gpu::GpuDevice;
use mind_exec::device::{DeviceKind, DeviceRegistry, DeviceSpec, PerTaskDevice};
use mind_exec::error::{OpError, OpStatus};
use mind_exec::executor::{ExecutorContext, NodeStats, PreparedInputs, ReadySeq};
use mind_exec::graph::{DType, EntryVec, GraphId, NodeDef, NodeId, TaggedNode, TensorVal, ValueKind};
use mind_exec::kernel::{
    AsyncKernel, CachedKernel, FunctionLibrary, KernelContext, KernelDone, KernelRegistry,
    MemoryType, MemoryTypeRegistry, OpKernel, SyncKernel,
};
use mind_exec::rendezvous::{RecvDone, Rendezvous};
use mind_exec::resources::monitor::{ResourceContext, ResourceMonitor};
use mind_exec::resources::{ResourceMap, ResourceTag, SessionTracker, SessionUsage};
use mind_exec::shape::{ShapeContext, ShapeSource};
use mind_exec::sync::Semaphore;
use mind_exec::task::{Callbacks, OperationTask};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Graph builders

pub fn node(id: NodeId, name: &str, op: &str, num_inputs: usize, outputs: Vec<DType>) -> NodeDef {
    NodeDef {
        id,
        name: name.into(),
        op: op.into(),
        inputs: vec![ValueKind::Value; num_inputs],
        output_dtypes: outputs,
        stateful: false,
        is_transfer: false,
    }
}

pub fn add_node() -> NodeDef {
    node(1, "add0", "tensor.add", 2, vec![DType::I32])
}

// ---------------------------------------------------------------------------
// Kernels

/// Sync kernel that allocates one `[2,3]` i32 output through the ticket.
pub struct AddKernel;

impl SyncKernel for AddKernel {
    fn name(&self) -> &str {
        "add"
    }

    fn compute(&self, ctx: &mut KernelContext) {
        if let Err(e) = ctx.allocate_output(0, DType::I32, vec![2, 3]) {
            ctx.set_status(e);
        }
    }
}

/// Sync kernel that charges a fixed byte count; over-drawing the reservation
/// produces the natural OOM path.
pub struct AllocKernel {
    pub bytes: usize,
}

impl SyncKernel for AllocKernel {
    fn name(&self) -> &str {
        "alloc"
    }

    fn compute(&self, ctx: &mut KernelContext) {
        match ctx.device().allocate(self.bytes) {
            Ok(()) => {
                let elements = self.bytes / DType::F32.size_in_bytes();
                if let Err(e) = ctx.set_output(0, TensorVal::new(DType::F32, vec![elements], None))
                {
                    ctx.set_status(e);
                }
            }
            Err(e) => ctx.set_status(e),
        }
    }
}

/// Sync kernel that fails with a non-OOM error.
pub struct FailingKernel;

impl SyncKernel for FailingKernel {
    fn name(&self) -> &str {
        "failing"
    }

    fn compute(&self, ctx: &mut KernelContext) {
        ctx.set_status(OpError::Internal("kernel exploded".into()));
    }
}

/// Async kernel completing on a separate thread.
pub struct AsyncAddKernel;

impl AsyncKernel for AsyncAddKernel {
    fn name(&self) -> &str {
        "async_add"
    }

    fn compute_async(&self, mut ctx: KernelContext, done: KernelDone) {
        thread::spawn(move || {
            if let Err(e) = ctx.allocate_output(0, DType::I32, vec![2, 3]) {
                ctx.set_status(e);
            }
            ctx.record_tensor_access(mind_exec::graph::TensorRef(1));
            done(ctx);
        });
    }
}

/// Async kernel that parks on a gate before computing, so tests can order
/// scheduler-side events against the completion thread deterministically.
pub struct GatedAsyncAddKernel {
    pub gate: Arc<mind_exec::sync::Notification>,
}

impl AsyncKernel for GatedAsyncAddKernel {
    fn name(&self) -> &str {
        "gated_async_add"
    }

    fn compute_async(&self, mut ctx: KernelContext, done: KernelDone) {
        let gate = Arc::clone(&self.gate);
        thread::spawn(move || {
            gate.wait();
            if let Err(e) = ctx.allocate_output(0, DType::I32, vec![2, 3]) {
                ctx.set_status(e);
            }
            ctx.record_tensor_access(mind_exec::graph::TensorRef(1));
            done(ctx);
        });
    }
}

/// Async kernel reporting OOM from its completion thread.
pub struct AsyncOomKernel {
    pub bytes: usize,
}

impl AsyncKernel for AsyncOomKernel {
    fn name(&self) -> &str {
        "async_oom"
    }

    fn compute_async(&self, mut ctx: KernelContext, done: KernelDone) {
        let bytes = self.bytes;
        thread::spawn(move || {
            if let Err(e) = ctx.device().allocate(bytes) {
                ctx.set_status(e);
            }
            done(ctx);
        });
    }
}

/// Transfer-style kernel that forwards the dead bit into its output.
pub struct RecvKernel;

impl SyncKernel for RecvKernel {
    fn name(&self) -> &str {
        "recv"
    }

    fn compute(&self, ctx: &mut KernelContext) {
        if ctx.is_input_dead() {
            // Leave the output slot empty: the dead bit travels on.
            return;
        }
        if let Err(e) = ctx.set_output(0, TensorVal::new(DType::F32, vec![1], Some(0.0))) {
            ctx.set_status(e);
        }
    }
}

// ---------------------------------------------------------------------------
// Stub collaborators

pub struct StubLibrary;

impl FunctionLibrary for StubLibrary {
    fn name(&self) -> &str {
        "stub"
    }
}

#[derive(Default)]
pub struct StubRendezvous {
    mailbox: Mutex<HashMap<String, (TensorVal, bool)>>,
}

impl Rendezvous for StubRendezvous {
    fn send(&self, key: &str, val: TensorVal, is_dead: bool) -> Result<(), OpError> {
        self.mailbox
            .lock()
            .unwrap()
            .insert(key.to_string(), (val, is_dead));
        Ok(())
    }

    fn recv_async(&self, key: &str, done: RecvDone) {
        let entry = self.mailbox.lock().unwrap().remove(key);
        match entry {
            Some((val, is_dead)) => done(Ok((val, is_dead))),
            None => done(Err(OpError::NotFound(format!("no tensor for key {key}")))),
        }
    }
}

#[derive(Default)]
pub struct StubShapes {
    pub by_node: Mutex<HashMap<NodeId, ShapeContext>>,
}

impl StubShapes {
    pub fn set(&self, node: NodeId, ctx: ShapeContext) {
        self.by_node.lock().unwrap().insert(node, ctx);
    }
}

impl ShapeSource for StubShapes {
    fn shape_for_node(&self, node: &NodeDef) -> Option<ShapeContext> {
        self.by_node.lock().unwrap().get(&node.id).cloned()
    }
}

#[derive(Default)]
pub struct StubMemoryTypes {
    /// Per-node output memory types; nodes not listed default to device
    /// memory for every output.
    pub outputs_by_node: Mutex<HashMap<NodeId, Vec<MemoryType>>>,
    pub fail_lookup: AtomicBool,
}

impl StubMemoryTypes {
    pub fn set_outputs(&self, node: NodeId, types: Vec<MemoryType>) {
        self.outputs_by_node.lock().unwrap().insert(node, types);
    }
}

impl MemoryTypeRegistry for StubMemoryTypes {
    fn memory_types_for_node(
        &self,
        node: &NodeDef,
        _device: DeviceKind,
    ) -> Result<(Vec<MemoryType>, Vec<MemoryType>), OpError> {
        if self.fail_lookup.load(Ordering::Relaxed) {
            return Err(OpError::NotFound("memory types unavailable".into()));
        }
        let outputs = self
            .outputs_by_node
            .lock()
            .unwrap()
            .get(&node.id)
            .cloned()
            .unwrap_or_else(|| vec![MemoryType::DeviceMemory; node.num_outputs()]);
        Ok((vec![MemoryType::DeviceMemory; node.num_inputs()], outputs))
    }
}

#[derive(Default)]
pub struct StubSessions {
    pub usage: Mutex<Option<SessionUsage>>,
}

impl StubSessions {
    pub fn set_usage(&self, usage: SessionUsage) {
        *self.usage.lock().unwrap() = Some(usage);
    }
}

impl SessionTracker for StubSessions {
    fn usage(&self, _session: &str) -> Option<SessionUsage> {
        self.usage.lock().unwrap().clone()
    }
}

type KernelFactory = Box<dyn Fn() -> OpKernel + Send + Sync>;

/// Kernel cache keyed by node id, mirroring the process-wide registry: a
/// kernel is created once and pinned to the device it was created on.
pub struct StubKernels {
    factories: Mutex<HashMap<NodeId, KernelFactory>>,
    cache: Mutex<HashMap<NodeId, (Option<String>, OpKernel)>>,
    supported: Mutex<HashMap<NodeId, Vec<DeviceKind>>>,
    pub deleted: AtomicUsize,
    pub create_calls: AtomicUsize,
}

impl Default for StubKernels {
    fn default() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            supported: Mutex::new(HashMap::new()),
            deleted: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
        }
    }
}

impl StubKernels {
    pub fn register(
        &self,
        node: NodeId,
        kinds: Vec<DeviceKind>,
        factory: impl Fn() -> OpKernel + Send + Sync + 'static,
    ) {
        self.factories.lock().unwrap().insert(node, Box::new(factory));
        self.supported.lock().unwrap().insert(node, kinds);
    }

    /// Seeds the cache as if the kernel had been created on `device` before.
    pub fn seed_cached(&self, node: NodeId, device: Option<&str>, kernel: OpKernel) {
        self.cache
            .lock()
            .unwrap()
            .insert(node, (device.map(str::to_string), kernel));
    }

    pub fn cached_device(&self, node: NodeId) -> Option<String> {
        self.cache
            .lock()
            .unwrap()
            .get(&node)
            .and_then(|(d, _)| d.clone())
    }
}

impl KernelRegistry for StubKernels {
    fn supported_device_types(&self, node: &NodeDef) -> Result<Vec<DeviceKind>, OpError> {
        Ok(self
            .supported
            .lock()
            .unwrap()
            .get(&node.id)
            .cloned()
            .unwrap_or_else(|| vec![DeviceKind::Cpu, DeviceKind::Gpu]))
    }

    fn find_kernel(&self, node: &NodeDef) -> Result<Option<CachedKernel>, OpError> {
        Ok(self
            .cache
            .lock()
            .unwrap()
            .get(&node.id)
            .map(|(device_name, kernel)| CachedKernel {
                device_name: device_name.clone(),
                kernel: kernel.clone(),
            }))
    }

    fn create_kernel(
        &self,
        node: &NodeDef,
        item: &mind_exec::device::DeviceItem,
    ) -> Result<OpKernel, OpError> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        let factories = self.factories.lock().unwrap();
        let factory = factories
            .get(&node.id)
            .ok_or_else(|| OpError::NotFound(format!("no kernel for op {}", node.op)))?;
        let kernel = factory();
        self.cache.lock().unwrap().insert(
            node.id,
            (Some(item.device.name().to_string()), kernel.clone()),
        );
        Ok(kernel)
    }

    fn delete_kernel(
        &self,
        _node: &NodeDef,
        _kernel: &OpKernel,
        _library: &Arc<dyn FunctionLibrary>,
    ) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Stub executor

pub struct StubExecutor {
    pub graph: GraphId,
    pub session: String,
    pub devices: DeviceRegistry,
    pub kernels: Arc<StubKernels>,
    pub memory_types: Arc<StubMemoryTypes>,
    pub shapes: Arc<StubShapes>,
    pub sessions: Arc<StubSessions>,
    pub rendezvous: Arc<StubRendezvous>,
    pub num_finished_ops: Semaphore,
    pub collect_stats: AtomicBool,
    /// Inputs handed to the next `prepare_inputs` call.
    pub next_inputs: Mutex<PreparedInputs>,
    pub fail_prepare_inputs: AtomicBool,
    /// Ready set returned from `propagate_outputs`.
    pub next_ready: Mutex<ReadySeq>,
    pub report_completed: AtomicBool,
    /// Ordered record of every observable executor-side event.
    pub events: Arc<Mutex<Vec<String>>>,
    /// Outputs captured by the last `propagate_outputs`.
    pub propagated: Mutex<Vec<EntryVec>>,
}

impl StubExecutor {
    pub fn event(&self, name: &str) {
        self.events.lock().unwrap().push(name.to_string());
    }

    pub fn event_log(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_inputs(&self, inputs: EntryVec, is_input_dead: bool) {
        *self.next_inputs.lock().unwrap() = PreparedInputs {
            inputs,
            is_input_dead,
        };
    }
}

impl ExecutorContext for StubExecutor {
    fn graph_id(&self) -> GraphId {
        self.graph
    }

    fn step_id(&self) -> u64 {
        7
    }

    fn session_handle(&self) -> &str {
        &self.session
    }

    fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    fn kernels(&self) -> &dyn KernelRegistry {
        self.kernels.as_ref()
    }

    fn memory_types(&self) -> &dyn MemoryTypeRegistry {
        self.memory_types.as_ref()
    }

    fn shapes(&self) -> &dyn ShapeSource {
        self.shapes.as_ref()
    }

    fn session_tracker(&self) -> &dyn SessionTracker {
        self.sessions.as_ref()
    }

    fn rendezvous(&self) -> Arc<dyn Rendezvous> {
        Arc::clone(&self.rendezvous) as Arc<dyn Rendezvous>
    }

    fn create_function_library(
        &self,
        _device: &Arc<dyn PerTaskDevice>,
    ) -> Arc<dyn FunctionLibrary> {
        Arc::new(StubLibrary)
    }

    fn num_finished_ops(&self) -> &Semaphore {
        &self.num_finished_ops
    }

    fn collects_stats(&self) -> bool {
        self.collect_stats.load(Ordering::Relaxed)
    }

    fn prepare_inputs(
        &self,
        _node: &TaggedNode,
        _kernel: &OpKernel,
        _device: &Arc<dyn PerTaskDevice>,
    ) -> Result<PreparedInputs, OpError> {
        self.event("prepare_inputs");
        if self.fail_prepare_inputs.load(Ordering::Relaxed) {
            return Err(OpError::InvalidArgument("bad input".into()));
        }
        Ok(std::mem::take(&mut *self.next_inputs.lock().unwrap()))
    }

    fn process_outputs(
        &self,
        _node: &TaggedNode,
        ctx: &mut KernelContext,
        _stats: Option<&mut NodeStats>,
    ) -> Result<EntryVec, OpError> {
        self.event("process_outputs");
        match ctx.status() {
            Ok(()) => Ok(ctx.take_outputs()),
            Err(e) => Err(e.clone()),
        }
    }

    fn propagate_outputs(&self, _node: &TaggedNode, outputs: EntryVec) -> ReadySeq {
        self.event("propagate_outputs");
        self.propagated.lock().unwrap().push(outputs);
        std::mem::take(&mut *self.next_ready.lock().unwrap())
    }

    fn maybe_mark_completed(&self, _node: &TaggedNode) {
        self.event("mark_completed");
    }

    fn node_done(
        &self,
        status: &OpStatus,
        _node: &TaggedNode,
        _ready: ReadySeq,
        inline: bool,
    ) -> bool {
        self.event(&format!(
            "node_done({}, inline={inline})",
            if status.is_ok() { "ok" } else { "err" }
        ));
        self.report_completed.load(Ordering::Relaxed)
    }

    fn finish(&self) {
        self.event("executor_finish");
    }
}

// ---------------------------------------------------------------------------
// Test environment

pub struct TestEnv {
    pub monitor: Arc<ResourceMonitor>,
    pub exec: Arc<StubExecutor>,
    /// Concrete handle to the registered GPU, for stream/deferral asserts.
    pub gpu: Arc<GpuDevice>,
}

impl TestEnv {
    /// CPU:0 and GPU:0 registered, generous CPU memory, `gpu_memory` bytes of
    /// GPU headroom in the monitor.
    pub fn new(gpu_memory: f64) -> Self {
        init_tracing();

        let mut capacity = ResourceMap::new();
        capacity.set(ResourceTag::memory(DeviceSpec::cpu(0)), (1u64 << 30) as f64);
        capacity.set(ResourceTag::memory(DeviceSpec::gpu(0)), gpu_memory);
        let monitor = Arc::new(ResourceMonitor::new(capacity));

        let gpu = Arc::new(GpuDevice::new(0, 8, 1));
        let mut devices = DeviceRegistry::new();
        devices
            .register(Arc::new(CpuDevice::new(0)))
            .expect("register cpu");
        devices
            .register(Arc::clone(&gpu) as Arc<dyn mind_exec::device::Device>)
            .expect("register gpu");

        let exec = Arc::new(StubExecutor {
            graph: 42,
            session: "sess0".into(),
            devices,
            kernels: Arc::new(StubKernels::default()),
            memory_types: Arc::new(StubMemoryTypes::default()),
            shapes: Arc::new(StubShapes::default()),
            sessions: Arc::new(StubSessions::default()),
            rendezvous: Arc::new(StubRendezvous::default()),
            num_finished_ops: Semaphore::new(0),
            collect_stats: AtomicBool::new(false),
            next_inputs: Mutex::new(PreparedInputs::default()),
            fail_prepare_inputs: AtomicBool::new(false),
            next_ready: Mutex::new(Vec::new()),
            report_completed: AtomicBool::new(false),
            events: Arc::new(Mutex::new(Vec::new())),
            propagated: Mutex::new(Vec::new()),
        });
        Self { monitor, exec, gpu }
    }

    /// Reserves `request` and binds the task to `dev`. Panics on a denied
    /// reservation; tests exercise denial through the monitor directly.
    pub fn reserve_and_prepare(
        &self,
        task: &mut dyn OperationTask,
        dev: DeviceSpec,
        request: &ResourceMap,
    ) -> bool {
        let ticket = self.monitor.reserve(request).expect("reservation fits");
        let rctx = ResourceContext::new(dev, ticket, Arc::clone(&self.monitor));
        task.prepare(rctx)
    }

    /// Starts the task with instrumented callbacks and returns without
    /// waiting; the handle's `wait` blocks until `done` or `mem_failure`.
    pub fn start_run(&self, task: &mut dyn OperationTask) -> PendingRun {
        let finished = Arc::new(Semaphore::new(0));
        let events = Arc::clone(&self.exec.events);
        let status: Arc<Mutex<Option<OpStatus>>> = Arc::new(Mutex::new(None));
        let mem_failed = Arc::new(AtomicBool::new(false));
        let launched = Arc::new(AtomicBool::new(false));

        let cbs = Callbacks::on_done({
            let finished = Arc::clone(&finished);
            let events = Arc::clone(&events);
            let status = Arc::clone(&status);
            move |s| {
                events.lock().unwrap().push("done".into());
                *status.lock().unwrap() = Some(s);
                finished.notify(1);
            }
        })
        .with_launched({
            let events = Arc::clone(&events);
            let launched = Arc::clone(&launched);
            move || {
                events.lock().unwrap().push("launched".into());
                launched.store(true, Ordering::SeqCst);
            }
        })
        .with_mem_failure({
            let finished = Arc::clone(&finished);
            let events = Arc::clone(&events);
            let mem_failed = Arc::clone(&mem_failed);
            move || {
                events.lock().unwrap().push("mem_failure".into());
                mem_failed.store(true, Ordering::SeqCst);
                finished.notify(1);
            }
        });

        task.run(cbs);
        PendingRun {
            finished,
            status,
            mem_failed,
            launched,
        }
    }

    /// Runs the task and blocks until `done` or `mem_failure` fired,
    /// returning the status and callback flags.
    pub fn run_to_completion(&self, task: &mut dyn OperationTask) -> RunOutcome {
        self.start_run(task).wait()
    }
}

/// In-flight run started by [`TestEnv::start_run`].
pub struct PendingRun {
    finished: Arc<Semaphore>,
    status: Arc<Mutex<Option<OpStatus>>>,
    mem_failed: Arc<AtomicBool>,
    launched: Arc<AtomicBool>,
}

impl PendingRun {
    pub fn wait(self) -> RunOutcome {
        self.finished.wait(1);
        RunOutcome {
            status: self.status.lock().unwrap().clone(),
            mem_failed: self.mem_failed.load(Ordering::SeqCst),
            launched: self.launched.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    /// `None` when the cycle ended in `mem_failure`.
    pub status: Option<OpStatus>,
    pub mem_failed: bool,
    pub launched: bool,
}

/// Index of `needle` in the event log; panics with the log when absent.
pub fn event_index(log: &[String], needle: &str) -> usize {
    log.iter()
        .position(|e| e.starts_with(needle))
        .unwrap_or_else(|| panic!("event {needle:?} not found in {log:?}"))
}
