//! Device backend abstraction
//!
//! Vendor GPU SDKs are external collaborators; workers drive them through
//! the [`DeviceBackend`] capability below. Implementations wrap their own
//! contexts and are callable from both the worker thread and its transient
//! kernel-compile thread, so every method takes `&self` and synchronizes
//! internally. No lock inside an implementation may be held across a call
//! back into the miner.

use crate::progpow::KernelDialect;
use crate::types::{DeviceDescriptor, Hash256};
use crate::Result;

pub mod cpu;

pub use cpu::CpuBackend;

/// Capacity of the mapped result buffer per stream
pub const MAX_SEARCH_RESULTS: usize = 4;

/// Scheduling hint applied when acquiring a device context
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleHint {
    /// Let the driver decide
    Auto,
    /// Spin-wait for results
    Spin,
    /// Yield the host thread while waiting
    Yield,
    /// Block the host thread on a synchronization primitive
    Blocking,
}

impl ScheduleHint {
    /// Map the numeric CLI flag (0..4) onto a hint
    pub fn from_flag(flag: u32) -> Self {
        match flag {
            1 => ScheduleHint::Spin,
            2 => ScheduleHint::Yield,
            4 => ScheduleHint::Blocking,
            _ => ScheduleHint::Auto,
        }
    }
}

/// One candidate from a search batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchResult {
    /// Global thread id within the batch; nonce = batch base + gid
    pub gid: u32,
    /// Mix hash computed by the kernel for this candidate
    pub mix: Hash256,
}

/// Mapped result buffer of one stream
#[derive(Clone, Copy, Debug, Default)]
pub struct SearchResults {
    /// Number of valid entries in `results`
    pub count: u32,
    /// Candidate slots; entries beyond `count` are stale
    pub results: [SearchResult; MAX_SEARCH_RESULTS],
}

/// Opaque device memory allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque compiled kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Arguments of one search launch
#[derive(Clone, Copy, Debug)]
pub struct SearchArgs {
    /// First nonce of the batch
    pub start_nonce: u64,
    /// Header hash under search
    pub header: Hash256,
    /// Upper 64 bits of the boundary; kernels keep candidates below it
    pub target: u64,
}

/// Abstract compute device consumed by a `MinerWorker`.
pub trait DeviceBackend: Send + Sync {
    /// Identity and capability hints of the underlying device
    fn descriptor(&self) -> DeviceDescriptor;

    /// Kernel source dialect this backend compiles
    fn kernel_dialect(&self) -> KernelDialect;

    /// Acquire the device context with a scheduling hint
    fn acquire_context(&self, hint: ScheduleHint) -> Result<()>;

    /// Release the device context and all its resources
    fn release_context(&self);

    /// Create `count` non-blocking work streams with pinned result buffers
    fn create_streams(&self, count: usize) -> Result<()>;

    /// Allocate device memory
    fn alloc_device(&self, bytes: usize) -> Result<BufferHandle>;

    /// Free a device allocation
    fn free_device(&self, handle: BufferHandle) -> Result<()>;

    /// Copy host bytes into a device allocation
    fn copy_to_device(&self, handle: BufferHandle, bytes: &[u8]) -> Result<()>;

    /// Expand the DAG on-device from an uploaded light cache
    #[allow(clippy::too_many_arguments)]
    fn build_dag(
        &self,
        dag: BufferHandle,
        dag_bytes: usize,
        light: BufferHandle,
        light_items: u32,
        grid: u32,
        block: u32,
        stream: usize,
    ) -> Result<()>;

    /// Compile a period kernel from generated source
    fn compile_kernel(
        &self,
        source: &str,
        options: &[String],
        target_compute: (u32, u32),
    ) -> Result<KernelHandle>;

    /// Launch one search batch of `grid * block` nonces on a stream
    fn launch(
        &self,
        kernel: KernelHandle,
        grid: u32,
        block: u32,
        stream: usize,
        args: &SearchArgs,
    ) -> Result<()>;

    /// Wait for a stream's in-flight work to finish
    fn stream_sync(&self, stream: usize) -> Result<()>;

    /// Drain the mapped result buffer of a stream (resets its count)
    fn read_results(&self, stream: usize) -> SearchResults;
}
