//! Simulation pool client
//!
//! An in-process client used for benchmarking: it fabricates one work
//! package from the configured block and difficulty, accepts solutions
//! that re-verify against the job boundary, and otherwise behaves like a
//! regular pool session.

use super::{EventSender, PoolClient, PoolEvent};
use crate::ethash;
use crate::progpow;
use crate::types::{boundary_from_difficulty, Hash256, Solution, WorkPackage};
use crate::Result;
use async_trait::async_trait;
use num_bigint::BigUint;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Benchmark client for `simulation://` connections
#[derive(Debug)]
pub struct SimulateClient {
    block: u64,
    difficulty: f64,
    events: EventSender,
    connected: AtomicBool,
    session_start: Mutex<Option<Instant>>,
    current_work: Mutex<WorkPackage>,
}

impl SimulateClient {
    /// Create a client simulating work at `block` and `difficulty`
    pub fn new(block: u64, difficulty: f64, events: EventSender) -> Self {
        Self {
            block,
            difficulty,
            events,
            connected: AtomicBool::new(false),
            session_start: Mutex::new(None),
            current_work: Mutex::new(WorkPackage::default()),
        }
    }

    fn make_work(&self) -> WorkPackage {
        // A deterministic header keeps benchmark runs comparable
        let mut header_input = [0u8; 16];
        header_input[..8].copy_from_slice(&self.block.to_le_bytes());
        header_input[8..].copy_from_slice(&self.difficulty.to_bits().to_le_bytes());
        let header = ethash::keccak256(&header_input);

        let difficulty = BigUint::from(self.difficulty.max(1.0) as u64);
        let epoch = ethash::epoch_from_block(self.block);
        WorkPackage {
            job_id: format!("simulation-{}", self.block),
            header,
            boundary: boundary_from_difficulty(&difficulty),
            block_boundary: Hash256::zero(),
            seed: ethash::seed_from_epoch(epoch),
            epoch: Some(epoch),
            block: Some(self.block),
            start_nonce: 0,
            extra_nonce_size: 0,
            algo: "meowpow".to_string(),
        }
    }
}

#[async_trait]
impl PoolClient for SimulateClient {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Relaxed);
        *self.session_start.lock() = Some(Instant::now());
        info!(
            block = self.block,
            difficulty = self.difficulty,
            "simulation session started"
        );
        self.events.send(PoolEvent::Connected);

        let work = self.make_work();
        *self.current_work.lock() = work.clone();
        self.events.send(PoolEvent::WorkReceived(work));
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            if let Some(started) = self.session_start.lock().take() {
                info!(
                    elapsed_s = started.elapsed().as_secs(),
                    "simulation session ended"
                );
            }
            self.events.send(PoolEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn active_endpoint(&self) -> Option<String> {
        self.is_connected().then(|| "simulation:0".to_string())
    }

    async fn submit_solution(&self, solution: Solution) -> Result<()> {
        let submitted = Instant::now();
        let work = self.current_work.lock().clone();
        let valid = progpow::verify_light(
            &work.header,
            &solution.mix_hash,
            solution.nonce,
            &work.effective_boundary(),
        );
        let response_delay = submitted.elapsed();
        if valid {
            self.events.send(PoolEvent::SolutionAccepted {
                response_delay,
                miner_index: solution.miner_index,
                stale: false,
            });
        } else {
            warn!(
                nonce = format!("0x{:016x}", solution.nonce),
                "simulated pool rejected solution"
            );
            self.events.send(PoolEvent::SolutionRejected {
                response_delay,
                miner_index: solution.miner_index,
            });
        }
        Ok(())
    }

    async fn submit_hashrate(&self, rate: f64, id: &str) -> Result<()> {
        debug!(rate, id, "simulated hashrate submission");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ManagerEvent;
    use crate::types::Hash256;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn client_with_channel(
        block: u64,
        difficulty: f64,
    ) -> (SimulateClient, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SimulateClient::new(block, difficulty, EventSender::new(tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_connect_emits_session_and_work() {
        let (client, mut rx) = client_with_channel(30_000, 1.0);
        client.connect().await.unwrap();
        assert!(client.is_connected());

        match rx.recv().await {
            Some(ManagerEvent::Client(PoolEvent::Connected)) => {}
            other => panic!("expected Connected, got {:?}", other),
        }
        match rx.recv().await {
            Some(ManagerEvent::Client(PoolEvent::WorkReceived(work))) => {
                assert!(work.is_present());
                assert_eq!(work.block, Some(30_000));
                assert_eq!(work.epoch, Some(4)); // 30000 / 7500
                // Difficulty 1: unconstrained boundary
                assert_eq!(work.boundary, Hash256([0xff; 32]));
            }
            other => panic!("expected WorkReceived, got {:?}", other),
        }

        client.disconnect().await;
        assert!(!client.is_connected());
        match rx.recv().await {
            Some(ManagerEvent::Client(PoolEvent::Disconnected)) => {}
            other => panic!("expected Disconnected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submission_responses() {
        let (client, mut rx) = client_with_channel(5, 1.0);
        client.connect().await.unwrap();
        let work = loop {
            match rx.recv().await {
                Some(ManagerEvent::Client(PoolEvent::WorkReceived(work))) => break work,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        };

        // Difficulty 1 accepts any mix through light verification
        let good = Solution {
            nonce: 42,
            mix_hash: Hash256([0x01; 32]),
            work: work.clone(),
            found_at: Instant::now(),
            miner_index: 3,
        };
        client.submit_solution(good).await.unwrap();
        match rx.recv().await {
            Some(ManagerEvent::Client(PoolEvent::SolutionAccepted {
                miner_index, stale, ..
            })) => {
                assert_eq!(miner_index, 3);
                assert!(!stale);
            }
            other => panic!("expected SolutionAccepted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hard_difficulty_rejects_bogus_mix() {
        let (client, mut rx) = client_with_channel(5, 1e18);
        client.connect().await.unwrap();
        let work = loop {
            match rx.recv().await {
                Some(ManagerEvent::Client(PoolEvent::WorkReceived(work))) => break work,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        };

        let bogus = Solution {
            nonce: 1,
            mix_hash: Hash256::zero(),
            work,
            found_at: Instant::now(),
            miner_index: 0,
        };
        client.submit_solution(bogus).await.unwrap();
        match rx.recv().await {
            Some(ManagerEvent::Client(PoolEvent::SolutionRejected { miner_index, .. })) => {
                assert_eq!(miner_index, 0);
            }
            other => panic!("expected SolutionRejected, got {:?}", other),
        }
    }
}
