//! Farm: the per-process coordinator of all mining workers
//!
//! Holds the authoritative work package, carves the nonce space into
//! per-worker segments, verifies candidate solutions before they leave the
//! process, and aggregates accounting and hash rates for telemetry and
//! pool submission.

use crate::backend::DeviceBackend;
use crate::config::{DagLoadMode, Ergodicity};
use crate::ethash::{self, EpochContextCache};
use crate::miner::{
    FarmServices, MinerWorker, PauseReason, SolutionAccount, SolutionKind, WorkerSettings,
};
use crate::pool::ManagerEvent;
use crate::progpow::{self, VerificationResult};
use crate::types::{HashRate, Solution, WorkPackage};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Farm-level tunables
#[derive(Clone, Copy, Debug)]
pub struct FarmSettings {
    /// Settings applied to every worker
    pub worker: WorkerSettings,
    /// Nonce segment randomization policy
    pub ergodicity: Ergodicity,
    /// DAG build scheduling across workers
    pub dag_load_mode: DagLoadMode,
    /// Resume-mining temperature threshold (0 disables)
    pub temp_start: u32,
    /// Pause-mining temperature threshold (0 disables)
    pub temp_stop: u32,
    /// Bit width of one worker's nonce segment
    pub segment_width: u32,
}

impl Default for FarmSettings {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            ergodicity: Ergodicity::Fixed,
            dag_load_mode: DagLoadMode::Parallel,
            temp_start: 0,
            temp_stop: 0,
            segment_width: 40,
        }
    }
}

/// Telemetry of one worker
#[derive(Clone, Debug)]
pub struct MinerTelemetry {
    /// Worker index
    pub index: usize,
    /// Rolling hash rate
    pub hash_rate: f64,
    /// Whether the worker is paused
    pub paused: bool,
    /// Active pause reasons, empty when mining
    pub paused_reasons: String,
    /// Per-worker solution counters
    pub solutions: SolutionAccount,
}

/// Point-in-time farm telemetry
#[derive(Clone, Debug)]
pub struct TelemetrySnapshot {
    /// Aggregate hash rate across workers
    pub hash_rate: f64,
    /// Farm-wide solution counters
    pub solutions: SolutionAccount,
    /// Per-worker rows
    pub miners: Vec<MinerTelemetry>,
}

impl TelemetrySnapshot {
    /// One-line display form for the periodic progress log
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} {}",
            self.solutions.summary(),
            HashRate::new(self.hash_rate)
        );
        if !self.miners.is_empty() {
            out.push_str(" -");
            for miner in &self.miners {
                out.push_str(&format!(
                    " gpu{} {}{}",
                    miner.index,
                    HashRate::new(miner.hash_rate),
                    if miner.paused { " (paused)" } else { "" }
                ));
            }
        }
        out
    }
}

struct FarmInner {
    cache: EpochContextCache,
    events: UnboundedSender<ManagerEvent>,
    accounts: Mutex<Vec<SolutionAccount>>,
    farm_account: Mutex<SolutionAccount>,
    dag_load_mode: DagLoadMode,
    dag_next: AtomicUsize,
}

impl FarmServices for FarmInner {
    fn submit_proof(&self, solution: Solution) {
        let block = solution.work.block.unwrap_or(0);
        let epoch = solution
            .work
            .epoch
            .unwrap_or_else(|| ethash::epoch_from_block(block));
        let boundary = solution.work.effective_boundary();

        // Re-verify through the full memory-hard path before anything
        // leaves the process; the context is already cached by the worker.
        let context = match self.cache.get(epoch, false) {
            Ok(context) => context,
            Err(err) => {
                warn!(%err, "no epoch context for solution verification");
                self.account(solution.miner_index, SolutionKind::Failed);
                return;
            }
        };
        match progpow::verify_full(
            &context,
            block,
            &solution.work.header,
            &solution.mix_hash,
            solution.nonce,
            &boundary,
        ) {
            VerificationResult::Ok => {
                let _ = self.events.send(ManagerEvent::SolutionFound(solution));
            }
            outcome => {
                warn!(
                    miner = solution.miner_index,
                    nonce = format!("0x{:016x}", solution.nonce),
                    ?outcome,
                    "solution failed verification, not submitted"
                );
                self.account(solution.miner_index, SolutionKind::Failed);
            }
        }
    }

    fn report_fatal(&self, miner_index: usize, message: String) {
        let _ = self.events.send(ManagerEvent::Fatal {
            miner_index,
            message,
        });
    }

    fn context_cache(&self) -> &EpochContextCache {
        &self.cache
    }

    fn dag_load_allowed(&self, index: usize) -> bool {
        match self.dag_load_mode {
            DagLoadMode::Parallel => true,
            DagLoadMode::Sequential => self.dag_next.load(Ordering::Acquire) == index,
        }
    }

    fn dag_load_done(&self, index: usize) {
        if self.dag_load_mode == DagLoadMode::Sequential
            && self.dag_next.load(Ordering::Acquire) == index
        {
            self.dag_next.store(index + 1, Ordering::Release);
        }
    }
}

impl FarmInner {
    fn account(&self, miner_index: usize, kind: SolutionKind) {
        let mut accounts = self.accounts.lock();
        if let Some(account) = accounts.get_mut(miner_index) {
            account.record(kind);
        }
        self.farm_account.lock().record(kind);
    }
}

/// Coordinator of all [`MinerWorker`]s in the process
pub struct Farm {
    settings: FarmSettings,
    inner: Arc<FarmInner>,
    backends: Vec<Arc<dyn DeviceBackend>>,
    workers: Mutex<Vec<MinerWorker>>,
    work: Mutex<WorkPackage>,
    last_epoch: Mutex<Option<u32>>,
    scrambler: AtomicU64,
    paused: AtomicBool,
}

impl Farm {
    /// Create a farm over the enumerated device backends. Solutions and
    /// fatal errors flow out through `events`.
    pub fn new(
        settings: FarmSettings,
        backends: Vec<Arc<dyn DeviceBackend>>,
        events: UnboundedSender<ManagerEvent>,
    ) -> Arc<Self> {
        let inner = Arc::new(FarmInner {
            cache: EpochContextCache::new(),
            events,
            accounts: Mutex::new(vec![SolutionAccount::default(); backends.len()]),
            farm_account: Mutex::new(SolutionAccount::default()),
            dag_load_mode: settings.dag_load_mode,
            dag_next: AtomicUsize::new(0),
        });
        Arc::new(Self {
            settings,
            inner,
            backends,
            workers: Mutex::new(Vec::new()),
            work: Mutex::new(WorkPackage::default()),
            last_epoch: Mutex::new(None),
            scrambler: AtomicU64::new(rand::thread_rng().gen()),
            paused: AtomicBool::new(false),
        })
    }

    /// Number of devices this farm drives
    pub fn device_count(&self) -> usize {
        self.backends.len()
    }

    /// Spin up one worker per backend. No-op while already mining.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        info!(devices = self.backends.len(), "spinning up miners");
        self.inner.dag_next.store(0, Ordering::Release);
        self.paused.store(false, Ordering::Relaxed);
        for (index, backend) in self.backends.iter().enumerate() {
            workers.push(MinerWorker::spawn(
                index,
                backend.clone(),
                self.settings.worker,
                self.inner.clone(),
            ));
        }
    }

    /// Stop every worker and join their threads
    pub fn stop(&self) {
        let drained: Vec<MinerWorker> = self.workers.lock().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        info!("shutting down miners");
        for worker in &drained {
            worker.kick();
        }
        for worker in drained {
            worker.stop_join();
        }
    }

    /// Whether workers are currently spawned
    pub fn is_mining(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Pause all workers (farm-level reason)
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        for worker in self.workers.lock().iter() {
            worker.pause(PauseReason::FarmPaused);
        }
    }

    /// Resume all workers from the farm-level pause
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        for worker in self.workers.lock().iter() {
            worker.resume(PauseReason::FarmPaused);
        }
    }

    /// Whether the farm-level pause is active
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Full miner restart: stop (if mining) and start again
    pub fn restart(&self) {
        info!("restarting miners");
        if self.is_mining() {
            self.stop();
        }
        self.start();
    }

    /// Publish a work package to every worker, assigning each its nonce
    /// segment. Workers see it no later than their next new-work check.
    pub fn set_work(&self, package: &WorkPackage) {
        if self.settings.ergodicity == Ergodicity::PerJob {
            self.shuffle();
        }

        // Epoch transitions restart the sequential DAG load cursor
        if let Some(block) = package.block {
            let epoch = package
                .epoch
                .unwrap_or_else(|| ethash::epoch_from_block(block));
            let mut last_epoch = self.last_epoch.lock();
            if *last_epoch != Some(epoch) {
                *last_epoch = Some(epoch);
                self.inner.dag_next.store(0, Ordering::Release);
            }
        }

        *self.work.lock() = package.clone();
        for (index, worker) in self.workers.lock().iter().enumerate() {
            let mut assigned = package.clone();
            assigned.start_nonce = self.start_nonce_for(package, index);
            worker.set_work(assigned);
        }
    }

    /// The worker's segment base within the 64-bit nonce space. Jobs with a
    /// pool-assigned extra nonce keep the pool's prefix; otherwise the
    /// scrambler decides where the farm lands.
    fn start_nonce_for(&self, package: &WorkPackage, index: usize) -> u64 {
        let base = if package.extra_nonce_size == 0 {
            self.scrambler.load(Ordering::Relaxed)
        } else {
            package.start_nonce
        };
        base.wrapping_add((index as u64) << self.settings.segment_width)
    }

    /// Re-randomize the nonce scrambler
    pub fn shuffle(&self) {
        self.scrambler
            .store(rand::thread_rng().gen(), Ordering::Relaxed);
    }

    /// Current nonce scrambler value
    pub fn nonce_scrambler(&self) -> u64 {
        self.scrambler.load(Ordering::Relaxed)
    }

    /// Bit width of one worker's nonce segment
    pub fn segment_width(&self) -> u32 {
        self.settings.segment_width
    }

    /// Nonce randomization policy
    pub fn ergodicity(&self) -> Ergodicity {
        self.settings.ergodicity
    }

    /// Temperature thresholds `(start, stop)` for external monitors
    pub fn temperature_thresholds(&self) -> (u32, u32) {
        (self.settings.temp_start, self.settings.temp_stop)
    }

    /// Shared epoch context cache
    pub fn context_cache(&self) -> &EpochContextCache {
        &self.inner.cache
    }

    /// Aggregate hash rate; also asks workers to refresh their rolling rates
    pub fn hash_rate(&self) -> f64 {
        let workers = self.workers.lock();
        let mut total = 0.0;
        for worker in workers.iter() {
            worker.trigger_hash_rate_update();
            total += worker.hash_rate();
        }
        total
    }

    /// Record the outcome of a submitted solution
    pub fn account_solution(&self, miner_index: usize, kind: SolutionKind) {
        self.inner.account(miner_index, kind);
    }

    /// Farm-wide solution counters
    pub fn solutions(&self) -> SolutionAccount {
        *self.inner.farm_account.lock()
    }

    /// Snapshot of farm and per-worker telemetry
    pub fn telemetry(&self) -> TelemetrySnapshot {
        let workers = self.workers.lock();
        let accounts = self.inner.accounts.lock();
        let miners: Vec<MinerTelemetry> = workers
            .iter()
            .map(|worker| MinerTelemetry {
                index: worker.index(),
                hash_rate: worker.hash_rate(),
                paused: worker.paused(),
                paused_reasons: worker.paused_string(),
                solutions: accounts
                    .get(worker.index())
                    .copied()
                    .unwrap_or_default(),
            })
            .collect();
        TelemetrySnapshot {
            hash_rate: miners.iter().map(|m: &MinerTelemetry| m.hash_rate).sum(),
            solutions: *self.inner.farm_account.lock(),
            miners,
        }
    }
}

impl Drop for Farm {
    fn drop(&mut self) {
        self.stop();
    }
}
