//! Per-device mining worker
//!
//! Each worker runs a dedicated OS thread: wait for work, switch epochs
//! (with memory admission control), keep two adjacent period kernels warm
//! in a double-buffered slot pair, and drive stream search batches until
//! new work or shutdown. Pausing is a set of reasons; the worker mines
//! only while the set is empty.

use crate::backend::{BufferHandle, DeviceBackend, KernelHandle, ScheduleHint, SearchArgs};
use crate::ethash;
use crate::miner::FarmServices;
use crate::progpow::{self, kernel_source};
use crate::types::{Solution, WorkPackage};
use crate::utils::format_bytes;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Reasons a worker can be paused; any active reason pauses the worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseReason {
    /// Device temperature above the stop threshold
    Overheating,
    /// Operator request through the management surface
    ApiRequest,
    /// The whole farm is paused (e.g. no pool connection)
    FarmPaused,
    /// The current epoch does not fit into device memory
    InsufficientMemory,
    /// Device or epoch initialization failed
    InitEpochError,
}

impl PauseReason {
    fn bit(self) -> u8 {
        match self {
            PauseReason::Overheating => 1 << 0,
            PauseReason::ApiRequest => 1 << 1,
            PauseReason::FarmPaused => 1 << 2,
            PauseReason::InsufficientMemory => 1 << 3,
            PauseReason::InitEpochError => 1 << 4,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            PauseReason::Overheating => "temperature too high",
            PauseReason::ApiRequest => "api request",
            PauseReason::FarmPaused => "farm paused",
            PauseReason::InsufficientMemory => "insufficient device memory",
            PauseReason::InitEpochError => "epoch initialization error",
        }
    }

    const ALL: [PauseReason; 5] = [
        PauseReason::Overheating,
        PauseReason::ApiRequest,
        PauseReason::FarmPaused,
        PauseReason::InsufficientMemory,
        PauseReason::InitEpochError,
    ];
}

/// Tunables of one worker's search pipeline
#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    /// Concurrent device streams
    pub streams: usize,
    /// Grid size of one launch
    pub grid_size: u32,
    /// Block size of one launch
    pub block_size: u32,
    /// Context scheduling hint
    pub schedule: ScheduleHint,
    /// Hashes computed per thread by the kernel
    pub parallel_hash: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            streams: 2,
            grid_size: 256,
            block_size: 512,
            schedule: ScheduleHint::Blocking,
            parallel_hash: 4,
        }
    }
}

impl WorkerSettings {
    /// Nonces covered by one launch
    pub fn batch_size(&self) -> u64 {
        self.grid_size as u64 * self.block_size as u64
    }
}

/// State shared between a worker thread and its farm
pub(crate) struct WorkerShared {
    index: usize,
    work: Mutex<WorkPackage>,
    new_work: AtomicBool,
    new_work_signal: Condvar,
    stop: AtomicBool,
    pause_flags: AtomicU8,
    hash_rate_bits: AtomicU64,
    group_count: AtomicU64,
    rate_update: AtomicBool,
    hash_time: Mutex<Instant>,
}

impl WorkerShared {
    fn new(index: usize) -> Self {
        Self {
            index,
            work: Mutex::new(WorkPackage::default()),
            new_work: AtomicBool::new(false),
            new_work_signal: Condvar::new(),
            stop: AtomicBool::new(false),
            pause_flags: AtomicU8::new(0),
            hash_rate_bits: AtomicU64::new(0f64.to_bits()),
            group_count: AtomicU64::new(0),
            rate_update: AtomicBool::new(false),
            hash_time: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn set_work(&self, work: WorkPackage) {
        *self.work.lock() = work;
        self.kick();
    }

    /// Wake the worker out of its bounded new-work wait
    pub(crate) fn kick(&self) {
        self.new_work.store(true, Ordering::Relaxed);
        self.new_work_signal.notify_all();
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.new_work_signal.notify_all();
    }

    pub(crate) fn pause(&self, reason: PauseReason) {
        self.pause_flags.fetch_or(reason.bit(), Ordering::Relaxed);
    }

    pub(crate) fn resume(&self, reason: PauseReason) {
        self.pause_flags.fetch_and(!reason.bit(), Ordering::Relaxed);
    }

    pub(crate) fn paused(&self) -> bool {
        self.pause_flags.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn pause_test(&self, reason: PauseReason) -> bool {
        self.pause_flags.load(Ordering::Relaxed) & reason.bit() != 0
    }

    pub(crate) fn paused_string(&self) -> String {
        let flags = self.pause_flags.load(Ordering::Relaxed);
        PauseReason::ALL
            .iter()
            .filter(|r| flags & r.bit() != 0)
            .map(|r| r.describe())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Rolling hash rate in hashes per second
    pub(crate) fn hash_rate(&self) -> f64 {
        f64::from_bits(self.hash_rate_bits.load(Ordering::Relaxed))
    }

    /// Ask the worker to fold its group counter into the rate at the next
    /// batch boundary
    pub(crate) fn trigger_hash_rate_update(&self) {
        self.rate_update.store(true, Ordering::Relaxed);
    }

    fn update_hash_rate(&self, group_size: u64, increment: u64) {
        self.group_count
            .fetch_add(group_size * increment, Ordering::Relaxed);
        if self.rate_update.swap(false, Ordering::Relaxed) {
            let mut hash_time = self.hash_time.lock();
            let elapsed = hash_time.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                let count = self.group_count.swap(0, Ordering::Relaxed);
                self.hash_rate_bits
                    .store((count as f64 / elapsed).to_bits(), Ordering::Relaxed);
                *hash_time = Instant::now();
            }
        }
    }
}

/// Handle to one spawned worker
pub struct MinerWorker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl MinerWorker {
    /// Spawn a worker thread over a device backend
    pub fn spawn(
        index: usize,
        backend: Arc<dyn DeviceBackend>,
        settings: WorkerSettings,
        farm: Arc<dyn FarmServices>,
    ) -> Self {
        let shared = Arc::new(WorkerShared::new(index));
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("miner-{}", index))
            .spawn(move || {
                let mut work_loop = WorkLoop::new(thread_shared, backend, settings, farm);
                work_loop.run();
            })
            .expect("worker thread spawn");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Worker index within the farm
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Assign a work snapshot and wake the worker
    pub fn set_work(&self, work: WorkPackage) {
        self.shared.set_work(work);
    }

    /// Wake the worker without changing its work
    pub fn kick(&self) {
        self.shared.kick();
    }

    /// Set a pause reason
    pub fn pause(&self, reason: PauseReason) {
        self.shared.pause(reason);
        self.shared.kick();
    }

    /// Clear a pause reason
    pub fn resume(&self, reason: PauseReason) {
        self.shared.resume(reason);
        self.shared.kick();
    }

    /// Whether any pause reason is active
    pub fn paused(&self) -> bool {
        self.shared.paused()
    }

    /// Whether a specific pause reason is active
    pub fn pause_test(&self, reason: PauseReason) -> bool {
        self.shared.pause_test(reason)
    }

    /// Human-readable active pause reasons
    pub fn paused_string(&self) -> String {
        self.shared.paused_string()
    }

    /// Rolling hash rate of this worker
    pub fn hash_rate(&self) -> f64 {
        self.shared.hash_rate()
    }

    /// Ask for a hash rate refresh at the next batch boundary
    pub fn trigger_hash_rate_update(&self) {
        self.shared.trigger_hash_rate_update();
    }

    /// Stop the worker and join its thread
    pub fn stop_join(mut self) {
        self.shared.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct CompileTask {
    period: u64,
    handle: JoinHandle<Result<KernelHandle>>,
}

struct WorkLoop {
    shared: Arc<WorkerShared>,
    backend: Arc<dyn DeviceBackend>,
    settings: WorkerSettings,
    farm: Arc<dyn FarmServices>,

    device_initialized: bool,
    current_epoch: Option<u32>,
    current_period: Option<u64>,
    allocated_light: usize,
    allocated_dag: usize,
    light_buffer: Option<BufferHandle>,
    dag_buffer: Option<BufferHandle>,
    dag_elements: u32,
    // Two-slot kernel buffer: launches read only `current`, compiles write
    // only `standby`, transitions are a single swap
    kernel_current: Option<KernelHandle>,
    kernel_standby: Option<KernelHandle>,
    pending_compile: Option<CompileTask>,
}

impl WorkLoop {
    fn new(
        shared: Arc<WorkerShared>,
        backend: Arc<dyn DeviceBackend>,
        settings: WorkerSettings,
        farm: Arc<dyn FarmServices>,
    ) -> Self {
        Self {
            shared,
            backend,
            settings,
            farm,
            device_initialized: false,
            current_epoch: None,
            current_period: None,
            allocated_light: 0,
            allocated_dag: 0,
            light_buffer: None,
            dag_buffer: None,
            dag_elements: 0,
            kernel_current: None,
            kernel_standby: None,
            pending_compile: None,
        }
    }

    fn index(&self) -> usize {
        self.shared.index
    }

    fn should_stop(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed)
    }

    fn run(&mut self) {
        debug!(miner = self.index(), "worker thread started");
        while !self.should_stop() {
            if !self.take_new_work() {
                continue;
            }

            let work = self.shared.work.lock().clone();
            if !work.is_present() {
                continue;
            }
            let block = match work.block {
                Some(block) => block,
                None => continue,
            };

            if !self.device_initialized && !self.init_device() {
                continue;
            }

            let epoch = work
                .epoch
                .unwrap_or_else(|| ethash::epoch_from_block(block));
            if self.current_epoch != Some(epoch) {
                if !self.init_epoch(epoch) {
                    continue;
                }
                self.current_epoch = Some(epoch);
                // A package may have arrived while the DAG was building
                if self.shared.new_work.load(Ordering::Relaxed) {
                    continue;
                }
            }

            let period = progpow::period_from_block(block);
            if !self.ensure_kernel(period) {
                continue;
            }

            if self.shared.paused() {
                continue;
            }

            let target = work.effective_boundary().upper64();
            if target == u64::MAX {
                warn!(
                    miner = self.index(),
                    "difficulty too low for device search, skipping job"
                );
                continue;
            }

            if let Err(err) = self.search(&work, target) {
                error!(miner = self.index(), %err, "search aborted");
                self.farm.report_fatal(self.index(), err.to_string());
                break;
            }
        }

        if let Some(task) = self.pending_compile.take() {
            let _ = task.handle.join();
        }
        self.backend.release_context();
        debug!(miner = self.index(), "worker thread exiting");
    }

    /// Consume the new-work flag, or wait a bounded 50 ms for the signal.
    /// Returns whether work should be (re)examined.
    fn take_new_work(&self) -> bool {
        if self
            .shared
            .new_work
            .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
        let mut guard = self.shared.work.lock();
        self.shared
            .new_work_signal
            .wait_for(&mut guard, Duration::from_millis(50));
        false
    }

    fn init_device(&mut self) -> bool {
        let descriptor = self.backend.descriptor();
        info!(
            miner = self.index(),
            device = %descriptor.unique_id,
            name = %descriptor.name,
            memory = %format_bytes(descriptor.total_memory),
            "initializing device"
        );
        let result = self
            .backend
            .acquire_context(self.settings.schedule)
            .and_then(|_| self.backend.create_streams(self.settings.streams));
        match result {
            Ok(()) => {
                self.device_initialized = true;
                self.shared.resume(PauseReason::InitEpochError);
                true
            }
            Err(err) => {
                warn!(miner = self.index(), %err, "device init failed, mining suspended");
                self.shared.pause(PauseReason::InitEpochError);
                false
            }
        }
    }

    /// Bring the device onto `epoch`. Returns false when the worker got
    /// paused instead; it stays alive and retries on a later package.
    fn init_epoch(&mut self, epoch: u32) -> bool {
        // Epoch switches clear memory/init pauses before re-evaluating
        self.shared.resume(PauseReason::InsufficientMemory);
        self.shared.resume(PauseReason::InitEpochError);

        let required = ethash::light_cache_size(epoch) + ethash::full_dataset_size(epoch);
        let descriptor = self.backend.descriptor();
        let available = descriptor.free_memory + self.allocated_light + self.allocated_dag;
        if available < required {
            warn!(
                miner = self.index(),
                epoch,
                required = %format_bytes(required),
                available = %format_bytes(available),
                "insufficient device memory, mining suspended"
            );
            self.shared.pause(PauseReason::InsufficientMemory);
            return false;
        }

        // Sequential DAG load mode admits one worker at a time
        while !self.farm.dag_load_allowed(self.index()) {
            if self.should_stop() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let started = Instant::now();
        let outcome = self.init_epoch_inner(epoch, required);
        self.farm.dag_load_done(self.index());
        match outcome {
            Ok(()) => {
                info!(
                    miner = self.index(),
                    epoch,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generated DAG and light cache"
                );
                true
            }
            Err(err) => {
                warn!(miner = self.index(), epoch, %err, "epoch init failed, mining suspended");
                match err {
                    Error::OutOfMemory { .. } => {
                        self.shared.pause(PauseReason::InsufficientMemory)
                    }
                    _ => self.shared.pause(PauseReason::InitEpochError),
                }
                false
            }
        }
    }

    fn init_epoch_inner(&mut self, epoch: u32, required: usize) -> Result<()> {
        let context = self.farm.context_cache().get(epoch, false)?;
        let light_size = context.light_cache_size();
        let dag_size = context.full_dataset_size();

        // Reuse buffers when they are already large enough
        if self.allocated_light < light_size || self.allocated_dag < dag_size {
            if let Some(light) = self.light_buffer.take() {
                self.backend.free_device(light)?;
                self.allocated_light = 0;
            }
            if let Some(dag) = self.dag_buffer.take() {
                self.backend.free_device(dag)?;
                self.allocated_dag = 0;
            }
            debug!(
                miner = self.index(),
                epoch,
                total = %format_bytes(required),
                "allocating DAG and light buffers"
            );
            self.light_buffer = Some(self.backend.alloc_device(light_size)?);
            self.allocated_light = light_size;
            self.dag_buffer = Some(self.backend.alloc_device(dag_size)?);
            self.allocated_dag = dag_size;
        } else {
            debug!(miner = self.index(), epoch, "reusing existing DAG buffers");
        }

        let (light, dag) = match (self.light_buffer, self.dag_buffer) {
            (Some(light), Some(dag)) => (light, dag),
            _ => return Err(Error::backend_fatal("epoch buffers missing after allocation")),
        };

        let mut light_bytes = Vec::with_capacity(light_size);
        for item in context.light_cache() {
            light_bytes.extend_from_slice(item.as_bytes());
        }
        self.backend.copy_to_device(light, &light_bytes)?;
        self.backend.build_dag(
            dag,
            dag_size,
            light,
            context.light_cache_num_items(),
            self.settings.grid_size,
            self.settings.block_size,
            0,
        )?;

        self.dag_elements = context.num_dataset_entries();
        // Old contexts die with their last worker reference
        self.farm.context_cache().evict_older_than(epoch);
        Ok(())
    }

    /// Make sure the current slot holds the kernel for `period` and a
    /// compile of `period + 1` is in flight for the standby slot.
    fn ensure_kernel(&mut self, period: u64) -> bool {
        if self.current_period == Some(period) && self.kernel_current.is_some() {
            return true;
        }

        // Harvest the standby compile if one is pending
        let mut harvested: Option<u64> = None;
        if let Some(task) = self.pending_compile.take() {
            let task_period = task.period;
            match task.handle.join() {
                Ok(Ok(kernel)) => {
                    self.kernel_standby = Some(kernel);
                    harvested = Some(task_period);
                }
                Ok(Err(err)) => {
                    warn!(miner = self.index(), period = task_period, %err, "kernel compile failed")
                }
                Err(_) => warn!(
                    miner = self.index(),
                    period = task_period,
                    "kernel compile thread panicked"
                ),
            }
        }

        let mut installed = false;
        if harvested == Some(period) && self.kernel_standby.is_some() {
            std::mem::swap(&mut self.kernel_current, &mut self.kernel_standby);
            installed = true;
        }

        if !installed {
            // First package of a session, or the prepared period does not
            // match what arrived; compile synchronously and recover.
            match self.compile_kernel(period) {
                Ok(kernel) => {
                    self.kernel_standby = Some(kernel);
                    std::mem::swap(&mut self.kernel_current, &mut self.kernel_standby);
                }
                Err(err) => {
                    warn!(miner = self.index(), period, %err, "kernel compile failed");
                    if self.kernel_current.is_none() {
                        self.shared.pause(PauseReason::InitEpochError);
                        return false;
                    }
                    // Degrade: keep searching on the previous period kernel
                }
            }
        }

        info!(miner = self.index(), period, "launching period kernel");
        self.current_period = Some(period);
        self.spawn_compile(period + 1);
        true
    }

    fn compile_options(&self) -> Vec<String> {
        vec![format!("-DPROGPOW_DAG_ELEMENTS={}", self.dag_elements)]
    }

    fn compile_kernel(&self, period: u64) -> Result<KernelHandle> {
        let descriptor = self.backend.descriptor();
        let source = kernel_source(period, self.backend.kernel_dialect());
        self.backend.compile_kernel(
            &source,
            &self.compile_options(),
            (descriptor.compute_major, descriptor.compute_minor),
        )
    }

    fn spawn_compile(&mut self, period: u64) {
        let backend = self.backend.clone();
        let options = self.compile_options();
        let dialect = backend.kernel_dialect();
        let descriptor = backend.descriptor();
        let index = self.index();
        let handle = std::thread::Builder::new()
            .name(format!("compile-{}", index))
            .spawn(move || {
                let source = kernel_source(period, dialect);
                let kernel = backend.compile_kernel(
                    &source,
                    &options,
                    (descriptor.compute_major, descriptor.compute_minor),
                )?;
                debug!(miner = index, period, "pre-compiled period kernel");
                Ok(kernel)
            })
            .expect("compile thread spawn");
        self.pending_compile = Some(CompileTask { period, handle });
    }

    /// Stream search over the work package. The nonce cursor only ever
    /// moves forward; a work package is never re-scanned.
    fn search(&mut self, work: &WorkPackage, target: u64) -> Result<()> {
        let kernel = self
            .kernel_current
            .ok_or_else(|| Error::backend_fatal("search without an execution kernel"))?;
        let batch = self.settings.batch_size();
        let streams = self.settings.streams;
        let search_start = Instant::now();

        let mut cursor = work.start_nonce;
        let mut stream_base = vec![0u64; streams];

        // Prime every stream with its first batch
        for (stream, base) in stream_base.iter_mut().enumerate() {
            *base = cursor;
            self.launch(kernel, stream, cursor, work, target)?;
            cursor = cursor.wrapping_add(batch);
        }

        let mut done = false;
        while !done {
            // Exit at the next batch boundary on new work or pause
            done = self.shared.new_work.load(Ordering::Relaxed) || self.shared.paused();

            for stream in 0..streams {
                self.backend.stream_sync(stream)?;

                if self.should_stop() {
                    self.shared.new_work.store(false, Ordering::Relaxed);
                    done = true;
                }

                let found = self.backend.read_results(stream);

                // Restart the stream on the next batch unless winding down
                let batch_base = stream_base[stream];
                if !done {
                    stream_base[stream] = cursor;
                    self.launch(kernel, stream, cursor, work, target)?;
                    cursor = cursor.wrapping_add(batch);
                }

                for result in found.results.iter().take(found.count as usize) {
                    let nonce = batch_base.wrapping_add(result.gid as u64);
                    info!(
                        miner = self.index(),
                        job = %work.header.abridged(),
                        nonce = format!("0x{:016x}", nonce),
                        elapsed_ms = search_start.elapsed().as_millis() as u64,
                        "solution found"
                    );
                    self.farm.submit_proof(Solution {
                        nonce,
                        mix_hash: result.mix,
                        work: work.clone(),
                        found_at: Instant::now(),
                        miner_index: self.index(),
                    });
                }
            }

            self.shared.update_hash_rate(batch, streams as u64);

            if self.should_stop() {
                self.shared.new_work.store(false, Ordering::Relaxed);
                break;
            }
        }
        Ok(())
    }

    fn launch(
        &self,
        kernel: KernelHandle,
        stream: usize,
        start_nonce: u64,
        work: &WorkPackage,
        target: u64,
    ) -> Result<()> {
        self.backend.launch(
            kernel,
            self.settings.grid_size,
            self.settings.block_size,
            stream,
            &SearchArgs {
                start_nonce,
                header: work.header,
                target,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SearchResult, SearchResults, MAX_SEARCH_RESULTS};
    use crate::ethash::{EpochContext, EpochContextCache};
    use crate::progpow::kernel::period_of_source;
    use crate::types::{DeviceDescriptor, DeviceKind, Hash256};
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct MockBackend {
        free_memory: AtomicU64,
        launches: PlMutex<Vec<u64>>,
        pending_results: PlMutex<VecDeque<SearchResults>>,
        allocs: AtomicUsize,
        next_handle: AtomicU64,
    }

    impl MockBackend {
        fn new(free_memory: usize) -> Self {
            Self {
                free_memory: AtomicU64::new(free_memory as u64),
                launches: PlMutex::new(Vec::new()),
                pending_results: PlMutex::new(VecDeque::new()),
                allocs: AtomicUsize::new(0),
                next_handle: AtomicU64::new(1),
            }
        }
    }

    impl DeviceBackend for MockBackend {
        fn descriptor(&self) -> DeviceDescriptor {
            DeviceDescriptor {
                unique_id: "00:00.0".into(),
                name: "mock".into(),
                kind: DeviceKind::Cuda,
                total_memory: 8 << 30,
                free_memory: self.free_memory.load(Ordering::Relaxed) as usize,
                compute_major: 8,
                compute_minor: 6,
                max_workgroup_size: 1024,
            }
        }

        fn kernel_dialect(&self) -> crate::progpow::KernelDialect {
            crate::progpow::KernelDialect::Cuda
        }

        fn acquire_context(&self, _hint: ScheduleHint) -> Result<()> {
            Ok(())
        }

        fn release_context(&self) {}

        fn create_streams(&self, _count: usize) -> Result<()> {
            Ok(())
        }

        fn alloc_device(&self, _bytes: usize) -> Result<BufferHandle> {
            self.allocs.fetch_add(1, Ordering::Relaxed);
            Ok(BufferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
        }

        fn free_device(&self, _handle: BufferHandle) -> Result<()> {
            Ok(())
        }

        fn copy_to_device(&self, _handle: BufferHandle, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        fn build_dag(
            &self,
            _dag: BufferHandle,
            _dag_bytes: usize,
            _light: BufferHandle,
            _light_items: u32,
            _grid: u32,
            _block: u32,
            _stream: usize,
        ) -> Result<()> {
            Ok(())
        }

        fn compile_kernel(
            &self,
            source: &str,
            _options: &[String],
            _target_compute: (u32, u32),
        ) -> Result<KernelHandle> {
            // Kernels are tagged with their period for later inspection
            let period = period_of_source(source).unwrap_or(0);
            Ok(KernelHandle(period))
        }

        fn launch(
            &self,
            _kernel: KernelHandle,
            _grid: u32,
            _block: u32,
            _stream: usize,
            args: &SearchArgs,
        ) -> Result<()> {
            self.launches.lock().push(args.start_nonce);
            Ok(())
        }

        fn stream_sync(&self, _stream: usize) -> Result<()> {
            // Slow the loop to a testable pace
            std::thread::sleep(Duration::from_millis(1));
            Ok(())
        }

        fn read_results(&self, _stream: usize) -> SearchResults {
            self.pending_results.lock().pop_front().unwrap_or_default()
        }
    }

    struct TestFarm {
        cache: EpochContextCache,
        solutions: PlMutex<Vec<Solution>>,
        fatal: PlMutex<Option<String>>,
    }

    impl TestFarm {
        fn new() -> Self {
            let cache = EpochContextCache::new();
            cache.insert(Arc::new(EpochContext::build_for_tests(0, 61, 512)));
            Self {
                cache,
                solutions: PlMutex::new(Vec::new()),
                fatal: PlMutex::new(None),
            }
        }
    }

    impl FarmServices for TestFarm {
        fn submit_proof(&self, solution: Solution) {
            self.solutions.lock().push(solution);
        }

        fn report_fatal(&self, _miner_index: usize, message: String) {
            *self.fatal.lock() = Some(message);
        }

        fn context_cache(&self) -> &EpochContextCache {
            &self.cache
        }

        fn dag_load_allowed(&self, _index: usize) -> bool {
            true
        }

        fn dag_load_done(&self, _index: usize) {}
    }

    fn test_settings() -> WorkerSettings {
        WorkerSettings {
            streams: 1,
            grid_size: 2,
            block_size: 4,
            schedule: ScheduleHint::Auto,
            parallel_hash: 4,
        }
    }

    fn work_for_epoch_zero() -> WorkPackage {
        let mut work = WorkPackage::default();
        work.job_id = "job-1".into();
        work.header = Hash256([0x55; 32]);
        work.boundary = Hash256([0xff; 32]);
        work.boundary.0[0] = 0x7f; // easy but not the nonsensical all-ones
        work.block = Some(10);
        work.epoch = Some(0);
        work.start_nonce = 4096;
        work
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_insufficient_memory_pauses_without_allocating() {
        let backend = Arc::new(MockBackend::new(1 << 20)); // 1 MiB free
        let farm = Arc::new(TestFarm::new());
        let worker = MinerWorker::spawn(0, backend.clone(), test_settings(), farm.clone());

        worker.set_work(work_for_epoch_zero());
        assert!(wait_until(Duration::from_secs(2), || worker
            .pause_test(PauseReason::InsufficientMemory)));
        assert_eq!(backend.allocs.load(Ordering::Relaxed), 0);
        assert!(backend.launches.lock().is_empty());

        // More memory plus a fresh package recovers the worker
        backend.free_memory.store(8 << 30, Ordering::Relaxed);
        worker.set_work(work_for_epoch_zero());
        assert!(wait_until(Duration::from_secs(2), || !worker.paused()));
        assert!(wait_until(Duration::from_secs(2), || backend
            .allocs
            .load(Ordering::Relaxed)
            > 0));

        worker.stop_join();
    }

    #[test]
    fn test_nonce_cursor_is_strictly_monotonic() {
        let backend = Arc::new(MockBackend::new(8 << 30));
        let farm = Arc::new(TestFarm::new());
        let worker = MinerWorker::spawn(0, backend.clone(), test_settings(), farm.clone());

        worker.set_work(work_for_epoch_zero());
        assert!(wait_until(Duration::from_secs(2), || backend
            .launches
            .lock()
            .len()
            >= 8));
        worker.stop_join();

        let launches = backend.launches.lock();
        assert_eq!(launches[0], 4096);
        let batch = test_settings().batch_size();
        for pair in launches.windows(2) {
            assert_eq!(pair[1], pair[0] + batch, "nonce ranges must never overlap");
        }
    }

    #[test]
    fn test_nonsensical_difficulty_skips_search() {
        let backend = Arc::new(MockBackend::new(8 << 30));
        let farm = Arc::new(TestFarm::new());
        let worker = MinerWorker::spawn(0, backend.clone(), test_settings(), farm.clone());

        let mut work = work_for_epoch_zero();
        work.boundary = Hash256([0xff; 32]); // upper64 == u64::MAX
        worker.set_work(work);

        std::thread::sleep(Duration::from_millis(300));
        assert!(backend.launches.lock().is_empty());
        worker.stop_join();
    }

    #[test]
    fn test_candidates_become_solutions() {
        let backend = Arc::new(MockBackend::new(8 << 30));
        let mix = Hash256([0xaa; 32]);
        {
            let mut results = SearchResults::default();
            results.count = 2;
            results.results[0] = SearchResult { gid: 5, mix };
            results.results[1] = SearchResult { gid: 7, mix };
            backend.pending_results.lock().push_back(results);
        }
        let farm = Arc::new(TestFarm::new());
        let worker = MinerWorker::spawn(0, backend.clone(), test_settings(), farm.clone());

        worker.set_work(work_for_epoch_zero());
        assert!(wait_until(Duration::from_secs(2), || farm
            .solutions
            .lock()
            .len()
            >= 2));
        worker.stop_join();

        let solutions = farm.solutions.lock();
        // First batch base is the package start nonce
        assert_eq!(solutions[0].nonce, 4096 + 5);
        assert_eq!(solutions[1].nonce, 4096 + 7);
        assert_eq!(solutions[0].mix_hash, mix);
        assert_eq!(solutions[0].miner_index, 0);
        assert!(farm.fatal.lock().is_none());
    }

    #[test]
    fn test_pause_reason_set_semantics() {
        let shared = WorkerShared::new(3);
        assert!(!shared.paused());

        shared.pause(PauseReason::Overheating);
        shared.pause(PauseReason::FarmPaused);
        assert!(shared.paused());
        assert!(shared.pause_test(PauseReason::Overheating));
        assert!(!shared.pause_test(PauseReason::ApiRequest));
        assert_eq!(shared.paused_string(), "temperature too high, farm paused");

        // Clearing one reason keeps the worker paused on the other
        shared.resume(PauseReason::Overheating);
        assert!(shared.paused());
        shared.resume(PauseReason::FarmPaused);
        assert!(!shared.paused());
    }

    #[test]
    fn test_kernel_slots_track_adjacent_periods() {
        let backend = Arc::new(MockBackend::new(8 << 30));
        let farm = Arc::new(TestFarm::new());
        let shared = Arc::new(WorkerShared::new(0));
        let mut work_loop = WorkLoop::new(shared, backend, test_settings(), farm);
        work_loop.dag_elements = 256;

        assert!(work_loop.ensure_kernel(4));
        // The current slot holds period 4 (mock kernels carry their period)
        assert_eq!(work_loop.kernel_current, Some(KernelHandle(4)));
        assert_eq!(work_loop.current_period, Some(4));
        assert!(work_loop.pending_compile.is_some());

        // Moving to the prepared period swaps slots without recompiling
        assert!(work_loop.ensure_kernel(5));
        assert_eq!(work_loop.kernel_current, Some(KernelHandle(5)));
        // The standby slot keeps the previous kernel until overwritten
        assert_eq!(work_loop.kernel_standby, Some(KernelHandle(4)));

        if let Some(task) = work_loop.pending_compile.take() {
            let _ = task.handle.join();
        }
    }
}
