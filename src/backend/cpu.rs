//! CPU reference backend
//!
//! Implements [`DeviceBackend`] on the host: kernels are interpreted rather
//! than compiled, and DAG entries are synthesized from the uploaded light
//! cache on demand instead of being expanded into memory. Useful for pools
//! without GPU hardware, for verification, and as the test double the
//! worker loop is exercised against.

use super::{
    BufferHandle, DeviceBackend, KernelHandle, ScheduleHint, SearchArgs, SearchResult,
    SearchResults, MAX_SEARCH_RESULTS,
};
use crate::ethash::{self, L1_CACHE_SIZE, FULL_DATASET_ITEM_SIZE};
use crate::progpow::{self, kernel::period_of_source, KernelDialect};
use crate::types::{DeviceDescriptor, DeviceKind, Hash512};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Fallback memory size when the host does not expose /proc/meminfo
const DEFAULT_MEMORY: usize = 8 << 30;

struct Allocation {
    size: usize,
    data: Option<Vec<u8>>,
}

#[derive(Default)]
struct DagView {
    light_cache: Vec<Hash512>,
    l1_cache: Vec<u32>,
    num_entries: u32,
}

#[derive(Default)]
struct CpuState {
    context_acquired: bool,
    streams: Vec<SearchResults>,
    allocations: HashMap<u64, Allocation>,
    next_buffer: u64,
    kernels: HashMap<u64, u64>,
    next_kernel: u64,
    dag: Option<DagView>,
}

/// Host-CPU implementation of the device backend
pub struct CpuBackend {
    descriptor: DeviceDescriptor,
    state: Mutex<CpuState>,
}

impl CpuBackend {
    /// Create a backend for an enumerated CPU descriptor
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            state: Mutex::new(CpuState::default()),
        }
    }

    /// Enumerate host CPU devices (always exactly one)
    pub fn enumerate() -> Vec<DeviceDescriptor> {
        let (total, free) = host_memory();
        vec![DeviceDescriptor {
            unique_id: "cpu:0".to_string(),
            name: format!("host cpu ({} threads)", num_cpus::get()),
            kind: DeviceKind::Cpu,
            total_memory: total,
            free_memory: free,
            compute_major: 0,
            compute_minor: 0,
            max_workgroup_size: 1024,
        }]
    }
}

fn host_memory() -> (usize, usize) {
    let meminfo = match std::fs::read_to_string("/proc/meminfo") {
        Ok(contents) => contents,
        Err(_) => return (DEFAULT_MEMORY, DEFAULT_MEMORY),
    };
    let field = |name: &str| -> Option<usize> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse::<usize>()
            .ok()
            .map(|kib| kib * 1024)
    };
    (
        field("MemTotal:").unwrap_or(DEFAULT_MEMORY),
        field("MemAvailable:").unwrap_or(DEFAULT_MEMORY),
    )
}

impl DeviceBackend for CpuBackend {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn kernel_dialect(&self) -> KernelDialect {
        // The interpreter only reads the period define; either dialect works
        KernelDialect::Cuda
    }

    fn acquire_context(&self, hint: ScheduleHint) -> Result<()> {
        let mut state = self.state.lock();
        state.context_acquired = true;
        debug!(device = %self.descriptor.unique_id, ?hint, "acquired cpu context");
        Ok(())
    }

    fn release_context(&self) {
        let mut state = self.state.lock();
        *state = CpuState::default();
    }

    fn create_streams(&self, count: usize) -> Result<()> {
        let mut state = self.state.lock();
        if !state.context_acquired {
            return Err(Error::device_unavailable(
                self.descriptor.unique_id.clone(),
                "streams requested before context acquisition",
            ));
        }
        state.streams = vec![SearchResults::default(); count];
        Ok(())
    }

    fn alloc_device(&self, bytes: usize) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        let handle = state.next_buffer;
        state.next_buffer += 1;
        state.allocations.insert(
            handle,
            Allocation {
                size: bytes,
                data: None,
            },
        );
        Ok(BufferHandle(handle))
    }

    fn free_device(&self, handle: BufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        state
            .allocations
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| Error::backend_fatal(format!("free of unknown buffer {}", handle.0)))
    }

    fn copy_to_device(&self, handle: BufferHandle, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let alloc = state
            .allocations
            .get_mut(&handle.0)
            .ok_or_else(|| Error::backend_fatal(format!("copy to unknown buffer {}", handle.0)))?;
        if bytes.len() > alloc.size {
            return Err(Error::backend_fatal(format!(
                "copy of {} bytes into {}-byte buffer",
                bytes.len(),
                alloc.size
            )));
        }
        alloc.data = Some(bytes.to_vec());
        Ok(())
    }

    fn build_dag(
        &self,
        dag: BufferHandle,
        dag_bytes: usize,
        light: BufferHandle,
        light_items: u32,
        _grid: u32,
        _block: u32,
        _stream: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.allocations.contains_key(&dag.0) {
            return Err(Error::backend_fatal("dag buffer not allocated"));
        }
        let light_bytes = state
            .allocations
            .get(&light.0)
            .and_then(|a| a.data.as_ref())
            .ok_or_else(|| Error::backend_fatal("light cache not uploaded"))?;

        let mut light_cache = Vec::with_capacity(light_items as usize);
        for i in 0..light_items as usize {
            light_cache.push(Hash512::from_bytes(&light_bytes[i * 64..(i + 1) * 64])?);
        }

        // The host interprets; only the L1 head of the dataset is realized
        let l1_items = L1_CACHE_SIZE / FULL_DATASET_ITEM_SIZE;
        let mut l1_cache = Vec::with_capacity(L1_CACHE_SIZE / 4);
        for index in 0..l1_items as u32 {
            let item = ethash::calculate_dataset_item_1024(&light_cache, index);
            for w in 0..FULL_DATASET_ITEM_SIZE / 4 {
                l1_cache.push(item.word32(w));
            }
        }

        state.dag = Some(DagView {
            light_cache,
            l1_cache,
            num_entries: (dag_bytes / 256) as u32,
        });
        Ok(())
    }

    fn compile_kernel(
        &self,
        source: &str,
        _options: &[String],
        _target_compute: (u32, u32),
    ) -> Result<KernelHandle> {
        let period = period_of_source(source)
            .ok_or_else(|| Error::kernel_compile(0, "source carries no period define"))?;
        let mut state = self.state.lock();
        let handle = state.next_kernel;
        state.next_kernel += 1;
        state.kernels.insert(handle, period);
        Ok(KernelHandle(handle))
    }

    fn launch(
        &self,
        kernel: KernelHandle,
        grid: u32,
        block: u32,
        stream: usize,
        args: &SearchArgs,
    ) -> Result<()> {
        // Snapshot what the batch needs, then hash without holding the lock
        let (period, light_cache, l1_cache, num_entries) = {
            let state = self.state.lock();
            let period = *state
                .kernels
                .get(&kernel.0)
                .ok_or_else(|| Error::backend_fatal("launch of unknown kernel"))?;
            let dag = state
                .dag
                .as_ref()
                .ok_or_else(|| Error::backend_fatal("launch before dag build"))?;
            (
                period,
                dag.light_cache.clone(),
                dag.l1_cache.clone(),
                dag.num_entries,
            )
        };

        let mut found = SearchResults::default();
        for gid in 0..grid * block {
            let nonce = args.start_nonce.wrapping_add(gid as u64);
            let seed = progpow::hash_seed(&args.header, nonce);
            let mix = progpow::hash_mix_with(
                &l1_cache,
                num_entries,
                |index| ethash::calculate_dataset_item_2048(&light_cache, index),
                period,
                &seed,
            );
            let final_hash = progpow::hash_final(&seed, &mix);
            if final_hash.upper64() < args.target && (found.count as usize) < MAX_SEARCH_RESULTS {
                found.results[found.count as usize] = SearchResult { gid, mix };
                found.count += 1;
            }
        }

        let mut state = self.state.lock();
        let slot = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Error::backend_fatal("launch on unknown stream"))?;
        *slot = found;
        Ok(())
    }

    fn stream_sync(&self, _stream: usize) -> Result<()> {
        // Launches complete synchronously on the host
        Ok(())
    }

    fn read_results(&self, stream: usize) -> SearchResults {
        let mut state = self.state.lock();
        match state.streams.get_mut(stream) {
            Some(slot) => std::mem::take(slot),
            None => SearchResults::default(),
        }
    }
}
