//! Pool connectivity layer
//!
//! The wire protocols themselves are external collaborators; this module
//! defines what the manager consumes: the [`PoolClient`] capability, the
//! event stream clients feed back, the connection list entries, and the
//! factory seam through which protocol clients are instantiated per URI
//! family. Clients never call into the manager; they publish [`PoolEvent`]s
//! onto the manager's channel, which serializes all state changes.

use crate::types::{Solution, WorkPackage};
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use url::Url;

pub mod manager;
pub mod simulation;

pub use manager::{ManagerStatus, PoolManager, PoolManagerHandle};
pub use simulation::SimulateClient;

/// Protocol family of a pool URI
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolFamily {
    /// HTTP polling (getwork)
    Getwork,
    /// Stratum TCP variants
    Stratum,
    /// In-process benchmark client
    Simulation,
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFamily::Getwork => write!(f, "getwork"),
            ProtocolFamily::Stratum => write!(f, "stratum"),
            ProtocolFamily::Simulation => write!(f, "simulation"),
        }
    }
}

/// One entry of the failover connection list.
///
/// The bare string `exit` is a sentinel entry: reaching it in rotation
/// terminates the miner instead of connecting anywhere.
#[derive(Clone, Debug)]
pub struct Connection {
    uri: String,
    host: String,
    port: u16,
    family: ProtocolFamily,
    unrecoverable: Arc<AtomicBool>,
}

impl Connection {
    /// Parse a pool URI. Recognized schemes: `getwork`/`http`,
    /// `stratum`/`stratum+tcp`/`stratum+tls`/`stratum+ssl`, `simulation`.
    pub fn parse(input: &str) -> Result<Self> {
        if input.eq_ignore_ascii_case("exit") {
            return Ok(Self {
                uri: "exit".to_string(),
                host: "exit".to_string(),
                port: 0,
                family: ProtocolFamily::Getwork,
                unrecoverable: Arc::new(AtomicBool::new(false)),
            });
        }

        let url = Url::parse(input)
            .map_err(|e| Error::config(format!("invalid pool URI {}: {}", input, e)))?;
        let family = match url.scheme() {
            "http" | "https" | "getwork" => ProtocolFamily::Getwork,
            "stratum" | "stratum+tcp" | "stratum+tls" | "stratum+ssl" => ProtocolFamily::Stratum,
            "simulation" | "sim" => ProtocolFamily::Simulation,
            other => {
                return Err(Error::config(format!(
                    "unsupported pool URI scheme: {}",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .map(str::to_string)
            .unwrap_or_else(|| "localhost".to_string());

        Ok(Self {
            uri: input.to_string(),
            host,
            port: url.port().unwrap_or(0),
            family,
            unrecoverable: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Original URI string
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Host component
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port component (0 when unspecified)
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form for log lines
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Protocol family derived from the scheme
    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Whether this is the terminating sentinel entry
    pub fn is_exit(&self) -> bool {
        self.host.eq_ignore_ascii_case("exit")
    }

    /// Flag this connection as permanently unusable; rotation will erase it
    pub fn mark_unrecoverable(&self) {
        self.unrecoverable.store(true, Ordering::Relaxed);
    }

    /// Whether the connection was flagged unusable
    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable.load(Ordering::Relaxed)
    }

    /// Case-insensitive URI equality, used by the admin surface
    pub fn matches_uri(&self, uri: &str) -> bool {
        self.uri.eq_ignore_ascii_case(uri)
    }
}

/// Settings of the pool manager and its clients
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Ordered failover list
    pub connections: Vec<Connection>,
    /// Interval between getwork polls
    pub get_work_poll_interval: Duration,
    /// Drop the connection when no job arrives within this window
    pub no_work_timeout: Duration,
    /// Drop the connection when a request gets no response within this window
    pub no_response_timeout: Duration,
    /// Return to the primary pool after this long on a failover, when set
    pub failover_timeout: Option<Duration>,
    /// Whether to report the farm hash rate to the pool
    pub report_hashrate: bool,
    /// Interval between hash rate submissions
    pub hash_rate_interval: Duration,
    /// Identifier sent along with hash rate submissions
    pub hash_rate_id: String,
    /// Connection attempts before rotating to the next entry
    pub connection_max_retries: u32,
    /// Block number used by the simulation client
    pub benchmark_block: u64,
    /// Difficulty used by the simulation client
    pub benchmark_diff: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            get_work_poll_interval: Duration::from_millis(1000),
            no_work_timeout: Duration::from_secs(100000),
            no_response_timeout: Duration::from_secs(2),
            failover_timeout: None,
            report_hashrate: false,
            hash_rate_interval: Duration::from_secs(60),
            hash_rate_id: String::new(),
            connection_max_retries: 9000,
            benchmark_block: 0,
            benchmark_diff: 1.0,
        }
    }
}

/// Events a pool client publishes to the manager
#[derive(Debug)]
pub enum PoolEvent {
    /// Session established
    Connected,
    /// Session lost or closed
    Disconnected,
    /// A job arrived
    WorkReceived(WorkPackage),
    /// The pool accepted a submitted solution
    SolutionAccepted {
        /// Round-trip delay of the submission
        response_delay: Duration,
        /// Worker that found the solution
        miner_index: usize,
        /// Accepted but flagged stale
        stale: bool,
    },
    /// The pool rejected a submitted solution
    SolutionRejected {
        /// Round-trip delay of the submission
        response_delay: Duration,
        /// Worker that found the solution
        miner_index: usize,
    },
}

/// Everything the manager's event loop consumes, over one channel so all
/// state mutations observe a single serial order (the strand).
#[derive(Debug)]
pub enum ManagerEvent {
    /// Event from the active pool client
    Client(PoolEvent),
    /// Verified solution routed up from the farm
    SolutionFound(Solution),
    /// Unrecoverable device failure; terminates the process
    Fatal {
        /// Worker that hit the failure
        miner_index: usize,
        /// Backend error text
        message: String,
    },
    /// Admin command with a synchronous reply
    Command(Command),
}

/// Admin mutations of the connection list
#[derive(Debug)]
pub enum Command {
    /// Append a connection
    AddConnection {
        /// Pool URI
        uri: String,
        /// Outcome
        reply: oneshot::Sender<Result<()>>,
    },
    /// Remove a non-active connection by index
    RemoveConnection {
        /// Index into the list
        index: usize,
        /// Outcome
        reply: oneshot::Sender<Result<()>>,
    },
    /// Switch the active connection by index
    SetActiveIndex {
        /// Index into the list
        index: usize,
        /// Outcome
        reply: oneshot::Sender<Result<()>>,
    },
    /// Switch the active connection by URI string
    SetActiveUri {
        /// URI to look up (case-insensitive)
        uri: String,
        /// Outcome
        reply: oneshot::Sender<Result<()>>,
    },
    /// List the configured connections
    Connections {
        /// JSON rows `{index, active, uri}`
        reply: oneshot::Sender<serde_json::Value>,
    },
    /// Begin shutdown
    Stop,
}

/// Clone-able sender handed to pool clients for publishing events
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl EventSender {
    /// Wrap the manager's channel
    pub fn new(tx: mpsc::UnboundedSender<ManagerEvent>) -> Self {
        Self { tx }
    }

    /// Publish a client event; silently dropped after manager shutdown
    pub fn send(&self, event: PoolEvent) {
        let _ = self.tx.send(ManagerEvent::Client(event));
    }
}

/// A protocol session with one pool.
///
/// Implementations publish their lifecycle through the [`EventSender`] they
/// were created with: `Connected`, `Disconnected`, `WorkReceived` and the
/// solution responses. `connect` returning `Ok` only means the attempt
/// started; the session exists once `Connected` is published.
#[async_trait]
pub trait PoolClient: Send + Sync + std::fmt::Debug {
    /// Start connecting to the pool
    async fn connect(&self) -> Result<()>;

    /// Tear the session down; publishes `Disconnected`
    async fn disconnect(&self);

    /// Whether a session is currently established
    fn is_connected(&self) -> bool;

    /// Resolved remote endpoint, when connected
    fn active_endpoint(&self) -> Option<String>;

    /// Submit a solution; the response arrives as an event
    async fn submit_solution(&self, solution: Solution) -> Result<()>;

    /// Report the farm hash rate
    async fn submit_hashrate(&self, rate: f64, id: &str) -> Result<()>;
}

/// Instantiates the protocol client matching a connection's URI family
pub trait ClientFactory: Send + Sync {
    /// Create a client bound to `connection`, publishing onto `events`
    fn create(
        &self,
        connection: &Connection,
        settings: &PoolSettings,
        events: EventSender,
    ) -> Result<Arc<dyn PoolClient>>;
}

/// Built-in factory: serves the simulation family; real getwork/stratum
/// clients are external and plug in through their own [`ClientFactory`].
pub struct DefaultClientFactory;

impl ClientFactory for DefaultClientFactory {
    fn create(
        &self,
        connection: &Connection,
        settings: &PoolSettings,
        events: EventSender,
    ) -> Result<Arc<dyn PoolClient>> {
        match connection.family() {
            ProtocolFamily::Simulation => Ok(Arc::new(SimulateClient::new(
                settings.benchmark_block,
                settings.benchmark_diff,
                events,
            ))),
            family => Err(Error::pool_transport(
                connection.endpoint(),
                format!("no built-in client for the {} family", family),
            )),
        }
    }
}
