//! Configuration surface
//!
//! Command line options for the pool manager, the per-backend worker
//! tunables and the farm policies, with conversion into the runtime
//! settings structs. Values mirror the miner's historical defaults.

use crate::backend::ScheduleHint;
use crate::miner::{FarmSettings, WorkerSettings};
use crate::pool::{Connection, PoolSettings};
use crate::{Error, Result};
use clap::{Parser, ValueEnum};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// DAG build scheduling across workers
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DagLoadMode {
    /// All workers build their DAG concurrently
    Parallel,
    /// Workers build one at a time in index order
    Sequential,
}

/// Nonce segment randomization policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ergodicity {
    /// Keep the startup scrambler for the whole process lifetime
    Fixed,
    /// Re-randomize segments whenever a connection comes up
    PerSession,
    /// Re-randomize segments on every job
    PerJob,
}

/// Complete command line configuration
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "meowminer",
    version,
    about = "GPU MeowPoW (ProgPoW family) pool miner"
)]
pub struct Config {
    /// Pool URIs in failover order; the literal `exit` ends rotation
    #[arg(short = 'P', long = "pool", value_name = "URI")]
    pub pools: Vec<String>,

    /// Interval between getwork polls, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub get_work_poll_interval_ms: u64,

    /// Drop the connection when no job arrives within this many seconds
    #[arg(long, default_value_t = 100000)]
    pub no_work_timeout_s: u64,

    /// Drop the connection when a request is unanswered for this many seconds
    #[arg(long, default_value_t = 2)]
    pub no_response_timeout_s: u64,

    /// Minutes on a failover pool before retrying the primary (0 disables)
    #[arg(long, default_value_t = 0)]
    pub pool_failover_timeout_min: u64,

    /// Report the farm hash rate to the pool
    #[arg(long)]
    pub report_hashrate: bool,

    /// Seconds between hash rate submissions
    #[arg(long, default_value_t = 60)]
    pub hash_rate_interval_s: u64,

    /// Identifier for hash rate submissions (random when omitted)
    #[arg(long)]
    pub hash_rate_id: Option<String>,

    /// Connection attempts before rotating to the next pool
    #[arg(long, default_value_t = 9000)]
    pub connection_max_retries: u32,

    /// Block number for the simulation client
    #[arg(long, default_value_t = 0)]
    pub benchmark_block: u64,

    /// Difficulty for the simulation client
    #[arg(long, default_value_t = 1.0)]
    pub benchmark_diff: f64,

    /// CUDA: concurrent streams per device
    #[arg(long, default_value_t = 2)]
    pub cu_streams: usize,

    /// CUDA: context schedule flag (0 auto, 1 spin, 2 yield, 4 blocking)
    #[arg(long, default_value_t = 4)]
    pub cu_schedule: u32,

    /// CUDA: launch grid size
    #[arg(long, default_value_t = 256)]
    pub cu_grid_size: u32,

    /// CUDA: launch block size
    #[arg(long, default_value_t = 512)]
    pub cu_block_size: u32,

    /// CUDA: hashes per kernel thread
    #[arg(long, default_value_t = 4)]
    pub cu_parallel_hash: u32,

    /// OpenCL: explicit global work size (0 = use the multiplier)
    #[arg(long, default_value_t = 0)]
    pub cl_global_work_size: u32,

    /// OpenCL: global work size as a multiple of the local work size
    #[arg(long, default_value_t = 32768)]
    pub cl_global_work_size_multiplier: u32,

    /// OpenCL: local work size
    #[arg(long, default_value_t = 256)]
    pub cl_local_work_size: u32,

    /// DAG build scheduling across devices
    #[arg(long, value_enum, default_value_t = DagLoadMode::Parallel)]
    pub dag_load_mode: DagLoadMode,

    /// Nonce segment randomization policy
    #[arg(long, value_enum, default_value_t = Ergodicity::Fixed)]
    pub ergodicity: Ergodicity,

    /// Resume-mining temperature threshold (0 disables)
    #[arg(long, default_value_t = 0)]
    pub tstart: u32,

    /// Pause-mining temperature threshold (0 disables)
    #[arg(long, default_value_t = 0)]
    pub tstop: u32,

    /// Bit width of one worker's nonce segment
    #[arg(long, default_value_t = 40)]
    pub nonce_segment_width: u32,
}

impl Config {
    /// Build the pool manager settings, parsing and validating pool URIs
    pub fn pool_settings(&self) -> Result<PoolSettings> {
        if self.pools.is_empty() {
            return Err(Error::config(
                "at least one pool URI is required (-P/--pool)",
            ));
        }
        let connections = self
            .pools
            .iter()
            .map(|uri| Connection::parse(uri))
            .collect::<Result<Vec<_>>>()?;

        Ok(PoolSettings {
            connections,
            get_work_poll_interval: Duration::from_millis(self.get_work_poll_interval_ms),
            no_work_timeout: Duration::from_secs(self.no_work_timeout_s),
            no_response_timeout: Duration::from_secs(self.no_response_timeout_s),
            failover_timeout: (self.pool_failover_timeout_min > 0)
                .then(|| Duration::from_secs(self.pool_failover_timeout_min * 60)),
            report_hashrate: self.report_hashrate,
            hash_rate_interval: Duration::from_secs(self.hash_rate_interval_s),
            hash_rate_id: self
                .hash_rate_id
                .clone()
                .unwrap_or_else(random_hash_rate_id),
            connection_max_retries: self.connection_max_retries,
            benchmark_block: self.benchmark_block,
            benchmark_diff: self.benchmark_diff,
        })
    }

    /// Farm settings derived from the CLI surface
    pub fn farm_settings(&self) -> FarmSettings {
        FarmSettings {
            worker: self.cuda_worker_settings(),
            ergodicity: self.ergodicity,
            dag_load_mode: self.dag_load_mode,
            temp_start: self.tstart,
            temp_stop: self.tstop,
            segment_width: self.nonce_segment_width,
        }
    }

    /// Worker settings for CUDA-style backends (also used by the CPU
    /// reference backend)
    pub fn cuda_worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            streams: self.cu_streams,
            grid_size: self.cu_grid_size,
            block_size: self.cu_block_size,
            schedule: ScheduleHint::from_flag(self.cu_schedule),
            parallel_hash: self.cu_parallel_hash,
        }
    }

    /// Worker settings for OpenCL backends: the global work size (explicit
    /// or multiplier-derived) is split into grid and block dimensions
    pub fn opencl_worker_settings(&self) -> WorkerSettings {
        let local = self.cl_local_work_size.max(1);
        let grid = if self.cl_global_work_size > 0 {
            (self.cl_global_work_size / local).max(1)
        } else {
            self.cl_global_work_size_multiplier
        };
        WorkerSettings {
            streams: self.cu_streams,
            grid_size: grid,
            block_size: local,
            schedule: ScheduleHint::Auto,
            parallel_hash: self.cu_parallel_hash,
        }
    }
}

fn random_hash_rate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("0x{}", hex::encode(bytes))
}
