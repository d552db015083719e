//! Pool manager: session lifecycle and connection rotation
//!
//! The manager owns the failover list and the active client. It runs as a
//! single task draining one event channel, so every mutation happens in
//! one serial order without locks; readers outside the task see stale
//! snapshots through [`ManagerStatus`], which is fine for telemetry.
//!
//! Session state machine: Disconnected → Connecting → Connected → Working,
//! falling back to Disconnected from anywhere; `rotate_connect` advances
//! the list on repeated failures and honors the `exit` sentinel.

use super::{
    ClientFactory, Command, Connection, EventSender, ManagerEvent, PoolClient, PoolEvent,
    PoolSettings,
};
use crate::config::Ergodicity;
use crate::ethash;
use crate::miner::{Farm, SolutionKind};
use crate::types::{hashes_to_boundary, Solution, WorkPackage};
use crate::utils::format_hashes;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Telemetry snapshot of the manager, readable from any thread
#[derive(Default)]
pub struct ManagerStatus {
    running: AtomicBool,
    stopping: AtomicBool,
    async_pending: AtomicBool,
    connected: AtomicBool,
    active_index: AtomicUsize,
    connection_attempt: AtomicU32,
    connection_switches: AtomicU32,
    epoch_changes: AtomicU32,
    current_epoch: AtomicI64,
    difficulty_bits: AtomicU64,
}

impl ManagerStatus {
    fn new() -> Arc<Self> {
        let status = Self::default();
        status.current_epoch.store(-1, Ordering::Relaxed);
        Arc::new(status)
    }

    /// Whether the manager loop is alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Whether an orderly shutdown is in progress
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Whether a session with a pool is established
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Index of the active connection
    pub fn active_index(&self) -> usize {
        self.active_index.load(Ordering::Relaxed)
    }

    /// Attempts made on the active connection
    pub fn connection_attempt(&self) -> u32 {
        self.connection_attempt.load(Ordering::Relaxed)
    }

    /// Times the active connection changed
    pub fn connection_switches(&self) -> u32 {
        self.connection_switches.load(Ordering::Relaxed)
    }

    /// Times the epoch changed across received jobs
    pub fn epoch_changes(&self) -> u32 {
        self.epoch_changes.load(Ordering::Relaxed)
    }

    /// Epoch of the current work package
    pub fn current_epoch(&self) -> Option<u32> {
        let epoch = self.current_epoch.load(Ordering::Relaxed);
        (epoch >= 0).then(|| epoch as u32)
    }

    /// Expected hashes per solution at the current boundary
    pub fn current_difficulty(&self) -> f64 {
        f64::from_bits(self.difficulty_bits.load(Ordering::Relaxed))
    }
}

/// Cheap clone-able handle for admin mutations and status reads
#[derive(Clone)]
pub struct PoolManagerHandle {
    tx: mpsc::UnboundedSender<ManagerEvent>,
    status: Arc<ManagerStatus>,
}

impl PoolManagerHandle {
    /// Manager telemetry snapshot
    pub fn status(&self) -> &ManagerStatus {
        &self.status
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManagerEvent::Command(build(reply_tx)))
            .map_err(|_| Error::config("pool manager is not running"))?;
        reply_rx
            .await
            .map_err(|_| Error::config("pool manager dropped the command"))
    }

    /// Append a connection to the failover list
    pub async fn add_connection(&self, uri: impl Into<String>) -> Result<()> {
        let uri = uri.into();
        self.command(|reply| Command::AddConnection { uri, reply })
            .await?
    }

    /// Remove a non-active connection by index
    pub async fn remove_connection(&self, index: usize) -> Result<()> {
        self.command(|reply| Command::RemoveConnection { index, reply })
            .await?
    }

    /// Switch the active connection by index
    pub async fn set_active_connection(&self, index: usize) -> Result<()> {
        self.command(|reply| Command::SetActiveIndex { index, reply })
            .await?
    }

    /// Switch the active connection by URI (case-insensitive match)
    pub async fn set_active_connection_uri(&self, uri: impl Into<String>) -> Result<()> {
        let uri = uri.into();
        self.command(|reply| Command::SetActiveUri { uri, reply })
            .await?
    }

    /// JSON listing of the configured connections
    pub async fn connections(&self) -> Result<serde_json::Value> {
        self.command(|reply| Command::Connections { reply }).await
    }

    /// Begin an orderly shutdown
    pub fn stop(&self) {
        let _ = self.tx.send(ManagerEvent::Command(Command::Stop));
    }
}

/// The pool manager state machine. Created with the farm's event channel
/// and consumed by [`PoolManager::run`].
pub struct PoolManager {
    settings: PoolSettings,
    farm: Arc<Farm>,
    factory: Box<dyn ClientFactory>,
    status: Arc<ManagerStatus>,
    tx: mpsc::UnboundedSender<ManagerEvent>,
    rx: mpsc::UnboundedReceiver<ManagerEvent>,
    client: Option<Arc<dyn PoolClient>>,
    current_work: WorkPackage,
    selected_host: String,
    failover_deadline: Option<Instant>,
    hashrate_deadline: Option<Instant>,
    fatal: Option<Error>,
}

impl PoolManager {
    /// Build the manager over an event channel shared with the farm.
    /// `tx` must be the sender side of `rx`; the farm publishes solutions
    /// and fatal errors onto the same channel.
    pub fn new(
        settings: PoolSettings,
        farm: Arc<Farm>,
        factory: Box<dyn ClientFactory>,
        tx: mpsc::UnboundedSender<ManagerEvent>,
        rx: mpsc::UnboundedReceiver<ManagerEvent>,
    ) -> (Self, PoolManagerHandle) {
        let status = ManagerStatus::new();
        let handle = PoolManagerHandle {
            tx: tx.clone(),
            status: status.clone(),
        };
        (
            Self {
                settings,
                farm,
                factory,
                status,
                tx,
                rx,
                client: None,
                current_work: WorkPackage::default(),
                selected_host: String::new(),
                failover_deadline: None,
                hashrate_deadline: None,
                fatal: None,
            },
            handle,
        )
    }

    /// Run the manager until shutdown or a fatal error. This task is the
    /// strand: every event and timer is handled here, in arrival order.
    pub async fn run(mut self) -> Result<()> {
        info!("pool manager starting");
        self.status.running.store(true, Ordering::Relaxed);
        self.status.async_pending.store(true, Ordering::Relaxed);
        self.status.connection_switches.fetch_add(1, Ordering::Relaxed);
        self.rotate_connect().await;

        while self.status.running.load(Ordering::Relaxed) {
            let failover_at = self.failover_deadline;
            let hashrate_at = self.hashrate_deadline;
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(failover_at.unwrap_or_else(far_deadline)),
                    if failover_at.is_some() =>
                {
                    self.failover_elapsed().await;
                }
                _ = tokio::time::sleep_until(hashrate_at.unwrap_or_else(far_deadline)),
                    if hashrate_at.is_some() =>
                {
                    self.hashrate_tick().await;
                }
            }
        }

        info!("pool manager stopped");
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Client(PoolEvent::Connected) => self.on_connected().await,
            ManagerEvent::Client(PoolEvent::Disconnected) => self.on_disconnected().await,
            ManagerEvent::Client(PoolEvent::WorkReceived(work)) => self.on_work_received(work),
            ManagerEvent::Client(PoolEvent::SolutionAccepted {
                response_delay,
                miner_index,
                stale,
            }) => {
                info!(
                    delay_ms = response_delay.as_millis() as u64,
                    host = %self.selected_host,
                    stale,
                    "solution accepted"
                );
                self.farm.account_solution(
                    miner_index,
                    if stale {
                        SolutionKind::AcceptedStale
                    } else {
                        SolutionKind::Accepted
                    },
                );
            }
            ManagerEvent::Client(PoolEvent::SolutionRejected {
                response_delay,
                miner_index,
            }) => {
                warn!(
                    delay_ms = response_delay.as_millis() as u64,
                    host = %self.selected_host,
                    "solution rejected"
                );
                self.farm.account_solution(miner_index, SolutionKind::Rejected);
            }
            ManagerEvent::SolutionFound(solution) => self.on_solution_found(solution).await,
            ManagerEvent::Fatal {
                miner_index,
                message,
            } => {
                error!(miner = miner_index, %message, "fatal device failure, terminating");
                if self.farm.is_mining() {
                    self.farm.stop();
                }
                self.status.running.store(false, Ordering::Relaxed);
                self.fatal = Some(Error::backend_fatal(message));
            }
            ManagerEvent::Command(command) => self.handle_command(command).await,
        }
    }

    async fn on_connected(&mut self) {
        if let Some(client) = &self.client {
            if let Some(endpoint) = client.active_endpoint() {
                self.selected_host = endpoint;
            }
        }
        info!(host = %self.selected_host, "established connection");

        self.current_work = WorkPackage::default();
        if self.farm.ergodicity() == Ergodicity::PerSession {
            self.farm.shuffle();
        }

        // Return-to-primary timer runs only while camped on a failover
        self.failover_deadline = match self.settings.failover_timeout {
            Some(timeout) if self.status.active_index.load(Ordering::Relaxed) != 0 => {
                Some(Instant::now() + timeout)
            }
            _ => None,
        };

        if !self.farm.is_mining() {
            self.farm.start();
        } else if self.farm.is_paused() {
            info!("resuming mining");
            self.farm.resume();
        }

        if self.settings.report_hashrate {
            self.hashrate_deadline = Some(Instant::now() + self.settings.hash_rate_interval);
        }

        self.status.connected.store(true, Ordering::Relaxed);
        self.status.async_pending.store(false, Ordering::Relaxed);
    }

    async fn on_disconnected(&mut self) {
        info!(host = %self.selected_host, "disconnected");
        self.client = None;
        self.status.connected.store(false, Ordering::Relaxed);
        self.current_work = WorkPackage::default();
        self.failover_deadline = None;
        self.hashrate_deadline = None;

        if self.status.stopping.load(Ordering::Relaxed) {
            if self.farm.is_mining() {
                self.farm.stop();
            }
            self.status.running.store(false, Ordering::Relaxed);
        } else {
            self.status.async_pending.store(true, Ordering::Relaxed);
            info!("no connection, suspending mining");
            self.farm.pause();
            self.rotate_connect().await;
        }
    }

    fn on_work_received(&mut self, mut work: WorkPackage) {
        let block = match work.block {
            Some(block) if work.is_present() => block,
            _ => {
                warn!("invalid work package received, ignoring");
                return;
            }
        };
        if work.epoch.is_none() {
            work.epoch = Some(ethash::epoch_from_block(block));
        }

        let (new_epoch, new_diff) = if !self.current_work.is_present() {
            (true, true)
        } else {
            (
                self.current_work.epoch != work.epoch,
                self.current_work.effective_boundary() != work.effective_boundary(),
            )
        };

        self.current_work = work;

        if new_epoch {
            self.status.epoch_changes.fetch_add(1, Ordering::Relaxed);
            if let Some(epoch) = self.current_work.epoch {
                self.status.current_epoch.store(epoch as i64, Ordering::Relaxed);
            }
        }
        if new_epoch || new_diff {
            let difficulty = hashes_to_boundary(&self.current_work.effective_boundary());
            self.status
                .difficulty_bits
                .store(difficulty.to_bits(), Ordering::Relaxed);
            info!(
                epoch = self.current_work.epoch.unwrap_or(0),
                difficulty = %format_hashes(difficulty),
                "mining at"
            );
        }

        info!(
            job = %self.current_work.header.abridged(),
            block,
            host = %self.selected_host,
            "new job"
        );
        self.farm.set_work(&self.current_work);
    }

    async fn on_solution_found(&mut self, solution: Solution) {
        match &self.client {
            Some(client) if client.is_connected() => {
                debug!(
                    nonce = format!("0x{:016x}", solution.nonce),
                    miner = solution.miner_index,
                    "submitting solution"
                );
                if let Err(err) = client.submit_solution(solution).await {
                    warn!(%err, "solution submission failed");
                }
            }
            _ => {
                warn!(
                    nonce = format!("0x{:016x}", solution.nonce),
                    "solution wasted, waiting for connection"
                );
                self.farm
                    .account_solution(solution.miner_index, SolutionKind::Wasted);
            }
        }
    }

    /// Pick (or advance to) a usable connection and start connecting.
    /// Ends the process when the list empties or the `exit` entry is hit.
    async fn rotate_connect(&mut self) {
        if let Some(client) = &self.client {
            if client.is_connected() {
                return;
            }
        }

        let mut active = self.status.active_index.load(Ordering::Relaxed);
        if active >= self.settings.connections.len() {
            active = 0;
        }

        if !self.settings.connections.is_empty()
            && self.settings.connections[active].is_unrecoverable()
        {
            info!(
                uri = self.settings.connections[active].uri(),
                "discarding unrecoverable connection"
            );
            self.settings.connections.remove(active);
            self.status.connection_attempt.store(0, Ordering::Relaxed);
            if active >= self.settings.connections.len() {
                active = 0;
            }
            self.status.connection_switches.fetch_add(1, Ordering::Relaxed);
        } else if self.status.connection_attempt.load(Ordering::Relaxed)
            >= self.settings.connection_max_retries
        {
            if self.settings.connections.len() == 1 {
                // A sole connection is retried forever
                self.status.connection_attempt.store(0, Ordering::Relaxed);
            } else {
                self.status.connection_attempt.store(0, Ordering::Relaxed);
                active += 1;
                if active >= self.settings.connections.len() {
                    active = 0;
                }
                self.status.connection_switches.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.status.active_index.store(active, Ordering::Relaxed);

        let connection = match self.settings.connections.get(active) {
            Some(connection) if !connection.is_exit() => connection.clone(),
            _ => {
                if self.settings.connections.is_empty() {
                    info!("no more connections to try, exiting");
                } else {
                    info!("'exit' failover entry reached, exiting");
                }
                if self.farm.is_mining() {
                    self.farm.stop();
                }
                self.status.running.store(false, Ordering::Relaxed);
                return;
            }
        };

        self.client = None;
        let events = EventSender::new(self.tx.clone());
        match self.factory.create(&connection, &self.settings, events) {
            Ok(client) => {
                self.status.connection_attempt.fetch_add(1, Ordering::Relaxed);
                self.selected_host = connection.endpoint();
                info!(host = %self.selected_host, "selected pool");
                self.client = Some(client.clone());
                if let Err(err) = client.connect().await {
                    warn!(host = %self.selected_host, %err, "connection attempt failed");
                    let _ = self.tx.send(ManagerEvent::Client(PoolEvent::Disconnected));
                }
            }
            Err(err) => {
                warn!(uri = connection.uri(), %err, "cannot create pool client");
                connection.mark_unrecoverable();
                let _ = self.tx.send(ManagerEvent::Client(PoolEvent::Disconnected));
            }
        }
    }

    async fn failover_elapsed(&mut self) {
        self.failover_deadline = None;
        if !self.status.running.load(Ordering::Relaxed) {
            return;
        }
        if self.status.active_index.load(Ordering::Relaxed) != 0 {
            self.status.active_index.store(0, Ordering::Relaxed);
            self.status.connection_attempt.store(0, Ordering::Relaxed);
            self.status.connection_switches.fetch_add(1, Ordering::Relaxed);
            info!("failover timeout reached, returning to primary pool");
            if let Some(client) = &self.client {
                client.disconnect().await;
            }
        }
    }

    async fn hashrate_tick(&mut self) {
        self.hashrate_deadline = Some(Instant::now() + self.settings.hash_rate_interval);
        if !self.status.running.load(Ordering::Relaxed) {
            return;
        }
        if let Some(client) = &self.client {
            if client.is_connected() {
                let rate = self.farm.hash_rate();
                if let Err(err) = client
                    .submit_hashrate(rate, &self.settings.hash_rate_id)
                    .await
                {
                    warn!(%err, "hashrate submission failed");
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddConnection { uri, reply } => {
                let _ = reply.send(self.add_connection(&uri));
            }
            Command::RemoveConnection { index, reply } => {
                let _ = reply.send(self.remove_connection(index));
            }
            Command::SetActiveIndex { index, reply } => {
                let result = self.set_active_index(index).await;
                let _ = reply.send(result);
            }
            Command::SetActiveUri { uri, reply } => {
                let result = self.set_active_uri(&uri).await;
                let _ = reply.send(result);
            }
            Command::Connections { reply } => {
                let _ = reply.send(self.connections_json());
            }
            Command::Stop => self.begin_stop().await,
        }
    }

    fn guard_pending(&self) -> Result<()> {
        if self.status.async_pending.load(Ordering::Relaxed) {
            return Err(Error::config("outstanding connection operations, retry later"));
        }
        Ok(())
    }

    fn add_connection(&mut self, uri: &str) -> Result<()> {
        self.guard_pending()?;
        let connection = Connection::parse(uri)?;
        self.settings.connections.push(connection);
        Ok(())
    }

    fn remove_connection(&mut self, index: usize) -> Result<()> {
        self.guard_pending()?;
        if index >= self.settings.connections.len() {
            return Err(Error::config("connection index out of bounds"));
        }
        let active = self.status.active_index.load(Ordering::Relaxed);
        if index == active {
            return Err(Error::config("cannot remove the active connection"));
        }
        self.settings.connections.remove(index);
        if active > index {
            self.status.active_index.store(active - 1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn set_active_index(&mut self, index: usize) -> Result<()> {
        if index >= self.settings.connections.len() {
            return Err(Error::config("connection index out of bounds"));
        }
        self.set_active_common(index).await
    }

    async fn set_active_uri(&mut self, uri: &str) -> Result<()> {
        match self
            .settings
            .connections
            .iter()
            .position(|c| c.matches_uri(uri))
        {
            Some(index) => self.set_active_common(index).await,
            None => Err(Error::config(format!("connection not found: {}", uri))),
        }
    }

    async fn set_active_common(&mut self, index: usize) -> Result<()> {
        if self
            .status
            .async_pending
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::config("outstanding connection operations, retry later"));
        }
        if index != self.status.active_index.load(Ordering::Relaxed) {
            self.status.connection_switches.fetch_add(1, Ordering::Relaxed);
            self.status.active_index.store(index, Ordering::Relaxed);
            self.status.connection_attempt.store(0, Ordering::Relaxed);
            match &self.client {
                Some(client) => client.disconnect().await,
                None => self.rotate_connect().await,
            }
        } else {
            self.status.async_pending.store(false, Ordering::Relaxed);
        }
        Ok(())
    }

    fn connections_json(&self) -> serde_json::Value {
        let active = self.status.active_index.load(Ordering::Relaxed);
        serde_json::Value::Array(
            self.settings
                .connections
                .iter()
                .enumerate()
                .map(|(index, connection)| {
                    serde_json::json!({
                        "index": index,
                        "active": index == active,
                        "uri": connection.uri(),
                    })
                })
                .collect(),
        )
    }

    async fn begin_stop(&mut self) {
        if !self.status.running.load(Ordering::Relaxed) {
            return;
        }
        self.status.async_pending.store(true, Ordering::Relaxed);
        self.status.stopping.store(true, Ordering::Relaxed);
        match &self.client {
            Some(client) if client.is_connected() => {
                // The resulting Disconnected event finishes the shutdown
                client.disconnect().await;
            }
            _ => {
                self.failover_deadline = None;
                self.hashrate_deadline = None;
                if self.farm.is_mining() {
                    self.farm.stop();
                }
                self.status.running.store(false, Ordering::Relaxed);
            }
        }
    }
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::FarmSettings;
    use crate::pool::ProtocolFamily;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicI32;

    #[derive(Debug)]
    struct MockClient {
        host: String,
        fail_connect: bool,
        events: EventSender,
        connected: AtomicBool,
    }

    #[async_trait]
    impl PoolClient for MockClient {
        async fn connect(&self) -> Result<()> {
            if self.fail_connect {
                return Err(Error::pool_transport(self.host.clone(), "connection refused"));
            }
            self.connected.store(true, Ordering::Relaxed);
            self.events.send(PoolEvent::Connected);
            Ok(())
        }

        async fn disconnect(&self) {
            if self.connected.swap(false, Ordering::Relaxed) {
                self.events.send(PoolEvent::Disconnected);
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        fn active_endpoint(&self) -> Option<String> {
            Some(format!("{}:4444", self.host))
        }

        async fn submit_solution(&self, solution: Solution) -> Result<()> {
            self.events.send(PoolEvent::SolutionAccepted {
                response_delay: Duration::from_millis(5),
                miner_index: solution.miner_index,
                stale: false,
            });
            Ok(())
        }

        async fn submit_hashrate(&self, _rate: f64, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Factory whose per-host failure budgets drive connection outcomes
    struct MockFactory {
        fail_budget: PlMutex<HashMap<String, AtomicI32>>,
    }

    impl MockFactory {
        fn new(budgets: &[(&str, i32)]) -> Self {
            Self {
                fail_budget: PlMutex::new(
                    budgets
                        .iter()
                        .map(|(host, budget)| (host.to_string(), AtomicI32::new(*budget)))
                        .collect(),
                ),
            }
        }
    }

    impl ClientFactory for MockFactory {
        fn create(
            &self,
            connection: &Connection,
            _settings: &PoolSettings,
            events: EventSender,
        ) -> Result<Arc<dyn PoolClient>> {
            let budgets = self.fail_budget.lock();
            let fail_connect = budgets
                .get(connection.host())
                .map(|budget| budget.fetch_sub(1, Ordering::Relaxed) > 0)
                .unwrap_or(false);
            Ok(Arc::new(MockClient {
                host: connection.host().to_string(),
                fail_connect,
                events,
                connected: AtomicBool::new(false),
            }))
        }
    }

    fn connections(uris: &[&str]) -> Vec<Connection> {
        uris.iter().map(|u| Connection::parse(u).unwrap()).collect()
    }

    fn build_manager(
        settings: PoolSettings,
        factory: Box<dyn ClientFactory>,
    ) -> (PoolManager, PoolManagerHandle, Arc<Farm>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let farm = Farm::new(FarmSettings::default(), Vec::new(), tx.clone());
        let (manager, handle) = PoolManager::new(settings, farm.clone(), factory, tx, rx);
        (manager, handle, farm)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_rotation_after_max_retries() {
        let settings = PoolSettings {
            connections: connections(&[
                "stratum+tcp://a:4444",
                "stratum+tcp://b:4444",
                "stratum+tcp://c:4444",
            ]),
            connection_max_retries: 2,
            ..PoolSettings::default()
        };
        // Primary never connects
        let factory = MockFactory::new(&[("a", i32::MAX)]);
        let (manager, handle, _farm) = build_manager(settings, Box::new(factory));
        let status = handle.status.clone();
        let task = tokio::spawn(manager.run());

        wait_for(|| status.is_connected() && status.active_index() == 1).await;
        // One switch at startup, at least one more for the rotation
        assert!(status.connection_switches() >= 2);

        handle.stop();
        task.await.unwrap().unwrap();
        assert!(!status.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_returns_to_primary() {
        let settings = PoolSettings {
            connections: connections(&["stratum+tcp://primary:4444", "stratum+tcp://backup:4444"]),
            connection_max_retries: 1,
            failover_timeout: Some(Duration::from_secs(60)),
            ..PoolSettings::default()
        };
        // Primary fails exactly once, then recovers
        let factory = MockFactory::new(&[("primary", 1)]);
        let (manager, handle, _farm) = build_manager(settings, Box::new(factory));
        let status = handle.status.clone();
        let task = tokio::spawn(manager.run());

        wait_for(|| status.is_connected() && status.active_index() == 1).await;
        let switches_on_backup = status.connection_switches();

        // A minute on the failover brings the primary back
        tokio::time::advance(Duration::from_secs(61)).await;
        wait_for(|| status.is_connected() && status.active_index() == 0).await;
        assert!(status.connection_switches() > switches_on_backup);

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_admin_connection_mutations() {
        let settings = PoolSettings {
            connections: connections(&[
                "stratum+tcp://a:4444",
                "stratum+tcp://b:4444",
                "stratum+tcp://c:4444",
            ]),
            ..PoolSettings::default()
        };
        let (manager, handle, _farm) = build_manager(settings, Box::new(MockFactory::new(&[])));
        let status = handle.status.clone();
        let task = tokio::spawn(manager.run());
        wait_for(|| status.is_connected()).await;

        // The active connection cannot be removed
        assert!(handle.remove_connection(0).await.is_err());
        // Out of bounds is rejected
        assert!(handle.remove_connection(9).await.is_err());
        // A non-active entry can go
        handle.remove_connection(2).await.unwrap();

        let listing = handle.connections().await.unwrap();
        let rows = listing.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["active"], serde_json::json!(true));

        // Switching by URI string matches case-insensitively
        handle
            .set_active_connection_uri("STRATUM+TCP://b:4444")
            .await
            .unwrap();
        wait_for(|| status.is_connected() && status.active_index() == 1).await;

        // Unknown URIs are reported, not silently ignored
        let err = handle
            .set_active_connection_uri("stratum+tcp://nope:1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));

        // Removing an entry below the active one shifts the index down
        handle.remove_connection(0).await.unwrap();
        assert_eq!(status.active_index(), 0);
        assert!(status.is_connected());

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_work_intake_and_epoch_accounting() {
        let settings = PoolSettings {
            connections: connections(&["stratum+tcp://a:4444"]),
            ..PoolSettings::default()
        };
        let (manager, handle, _farm) = build_manager(settings, Box::new(MockFactory::new(&[])));
        let status = handle.status.clone();
        let tx = manager.tx.clone();
        let task = tokio::spawn(manager.run());
        wait_for(|| status.is_connected()).await;

        // Malformed package: no block number
        let mut bad = WorkPackage::default();
        bad.header = crate::types::Hash256([0x01; 32]);
        tx.send(ManagerEvent::Client(PoolEvent::WorkReceived(bad)))
            .unwrap();

        // Valid package: epoch derived from the block height
        let mut good = WorkPackage::default();
        good.header = crate::types::Hash256([0x02; 32]);
        good.boundary = crate::types::Hash256([0xff; 32]);
        good.block = Some(15_000);
        tx.send(ManagerEvent::Client(PoolEvent::WorkReceived(good.clone())))
            .unwrap();

        wait_for(|| status.epoch_changes() == 1).await;
        assert_eq!(status.current_epoch(), Some(2));

        // Same epoch, same boundary: no further epoch change
        good.job_id = "next".into();
        tx.send(ManagerEvent::Client(PoolEvent::WorkReceived(good)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status.epoch_changes(), 1);

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_solution_flow_accounting() {
        let settings = PoolSettings {
            connections: connections(&["stratum+tcp://a:4444"]),
            ..PoolSettings::default()
        };
        let (manager, handle, farm) = build_manager(settings, Box::new(MockFactory::new(&[])));
        let status = handle.status.clone();
        let tx = manager.tx.clone();
        let task = tokio::spawn(manager.run());
        wait_for(|| status.is_connected()).await;

        let solution = Solution {
            nonce: 0xdead,
            mix_hash: crate::types::Hash256::zero(),
            work: WorkPackage::default(),
            found_at: std::time::Instant::now(),
            miner_index: 0,
        };
        tx.send(ManagerEvent::SolutionFound(solution)).unwrap();
        wait_for(|| farm.solutions().accepted == 1).await;

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_solution_wasted_when_disconnected() {
        let settings = PoolSettings {
            connections: connections(&["stratum+tcp://dead:4444"]),
            connection_max_retries: 1_000_000,
            ..PoolSettings::default()
        };
        let factory = MockFactory::new(&[("dead", i32::MAX)]);
        let (manager, handle, farm) = build_manager(settings, Box::new(factory));
        let tx = manager.tx.clone();
        let task = tokio::spawn(manager.run());

        let solution = Solution {
            nonce: 0xbeef,
            mix_hash: crate::types::Hash256::zero(),
            work: WorkPackage::default(),
            found_at: std::time::Instant::now(),
            miner_index: 0,
        };
        tx.send(ManagerEvent::SolutionFound(solution)).unwrap();
        wait_for(|| farm.solutions().wasted == 1).await;

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exit_sentinel_terminates() {
        let settings = PoolSettings {
            connections: connections(&["exit"]),
            ..PoolSettings::default()
        };
        let (manager, handle, _farm) = build_manager(settings, Box::new(MockFactory::new(&[])));
        let status = handle.status.clone();
        manager.run().await.unwrap();
        assert!(!status.is_running());
        drop(handle);
    }

    #[tokio::test]
    async fn test_simulation_end_to_end_session() {
        let settings = PoolSettings {
            connections: connections(&["simulation://localhost:0"]),
            benchmark_block: 30_000,
            benchmark_diff: 1.0,
            ..PoolSettings::default()
        };
        let (manager, handle, _farm) =
            build_manager(settings, Box::new(crate::pool::DefaultClientFactory));
        let status = handle.status.clone();
        let task = tokio::spawn(manager.run());

        wait_for(|| status.is_connected() && status.epoch_changes() == 1).await;
        assert_eq!(status.current_epoch(), Some(4));
        assert!(status.current_difficulty() >= 1.0);

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_protocol_family_display() {
        assert_eq!(ProtocolFamily::Getwork.to_string(), "getwork");
        assert_eq!(ProtocolFamily::Stratum.to_string(), "stratum");
        assert_eq!(ProtocolFamily::Simulation.to_string(), "simulation");
    }
}
