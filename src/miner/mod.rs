//! Mining workers and their coordinator
//!
//! A [`MinerWorker`](worker::MinerWorker) owns one logical device and runs a
//! long-lived search loop on a dedicated thread. The [`Farm`](farm::Farm)
//! coordinates all workers: it fans out work packages, shuffles nonce
//! segments, aggregates hash rates and routes solutions up to the pool
//! manager.

use crate::ethash::EpochContextCache;
use crate::types::Solution;

pub mod farm;
pub mod worker;

pub use farm::{Farm, FarmSettings, TelemetrySnapshot};
pub use worker::{MinerWorker, PauseReason, WorkerSettings};

/// How a submitted solution ended up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolutionKind {
    /// Accepted by the pool
    Accepted,
    /// Accepted by the pool as stale
    AcceptedStale,
    /// Rejected by the pool
    Rejected,
    /// Never submitted (no connection)
    Wasted,
    /// Failed local re-verification
    Failed,
}

/// Per-miner solution counters
#[derive(Clone, Copy, Debug, Default)]
pub struct SolutionAccount {
    /// Solutions the pool accepted
    pub accepted: u32,
    /// Solutions the pool rejected
    pub rejected: u32,
    /// Solutions found while disconnected
    pub wasted: u32,
    /// Solutions that failed local verification
    pub failed: u32,
}

impl SolutionAccount {
    /// Record one solution outcome
    pub fn record(&mut self, kind: SolutionKind) {
        match kind {
            SolutionKind::Accepted | SolutionKind::AcceptedStale => self.accepted += 1,
            SolutionKind::Rejected => self.rejected += 1,
            SolutionKind::Wasted => self.wasted += 1,
            SolutionKind::Failed => self.failed += 1,
        }
    }

    /// Compact display form: `A<n>[:W<n>][:R<n>][:F<n>]`
    pub fn summary(&self) -> String {
        let mut out = format!("A{}", self.accepted);
        if self.wasted > 0 {
            out.push_str(&format!(":W{}", self.wasted));
        }
        if self.rejected > 0 {
            out.push_str(&format!(":R{}", self.rejected));
        }
        if self.failed > 0 {
            out.push_str(&format!(":F{}", self.failed));
        }
        out
    }
}

/// Services the farm provides to its workers.
///
/// Workers hold an explicit shared reference instead of reaching for a
/// process-wide farm instance; the farm must stay thread-safe since every
/// worker thread calls in concurrently.
pub trait FarmServices: Send + Sync {
    /// A worker found a candidate solution
    fn submit_proof(&self, solution: Solution);

    /// A worker hit an unrecoverable backend failure; the process must
    /// shut down with a non-zero status
    fn report_fatal(&self, miner_index: usize, message: String);

    /// Shared epoch context cache (single-flight construction)
    fn context_cache(&self) -> &EpochContextCache;

    /// Whether worker `index` may start its epoch initialization now.
    /// Always true for parallel DAG loading; sequential mode admits one
    /// worker at a time in index order.
    fn dag_load_allowed(&self, index: usize) -> bool;

    /// Worker `index` finished (or abandoned) its epoch initialization
    fn dag_load_done(&self, index: usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solution_account_summary() {
        let mut account = SolutionAccount::default();
        assert_eq!(account.summary(), "A0");

        account.record(SolutionKind::Accepted);
        account.record(SolutionKind::AcceptedStale);
        assert_eq!(account.summary(), "A2");

        account.record(SolutionKind::Wasted);
        account.record(SolutionKind::Rejected);
        account.record(SolutionKind::Failed);
        assert_eq!(account.summary(), "A2:W1:R1:F1");
    }
}
