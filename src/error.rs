//! Error handling for the miner
//!
//! One flat error type covering the engine, the workers and the pool layer,
//! with constructor helpers and recovery classification. Device-local errors
//! are recovered by pausing the owning worker, connection-level errors by
//! rotating the pool list; `BackendFatal` terminates the process.

use thiserror::Error;

/// Result type alias for miner operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the miner
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A device could not be initialized or has gone away
    #[error("Device unavailable: {device}: {message}")]
    DeviceUnavailable { device: String, message: String },

    /// Not enough device memory for the requested epoch
    #[error("Out of device memory: required {required} bytes, available {available}")]
    OutOfMemory { required: usize, available: usize },

    /// Unrecoverable backend failure (e.g. driver lost mid-search)
    #[error("Fatal backend error: {message}")]
    BackendFatal { message: String },

    /// Kernel compilation failure for a ProgPoW period
    #[error("Kernel compilation failed for period {period}: {message}")]
    KernelCompile { period: u64, message: String },

    /// A work package that fails validation
    #[error("Malformed work package: {message}")]
    MalformedWork { message: String },

    /// Transport-level pool failure, surfaced as a disconnect
    #[error("Pool transport error ({host}): {message}")]
    PoolTransport { host: String, message: String },

    /// A solution failed re-verification before submission
    #[error("Solution verification failed: {message}")]
    Verification { message: String },

    /// Broken internal invariant; a programmer bug, not a runtime condition
    #[error("Invariant violation: {message}")]
    Invariant { message: String },

    /// Operation was cancelled
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a device-unavailable error
    pub fn device_unavailable(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Create an out-of-memory error
    pub fn out_of_memory(required: usize, available: usize) -> Self {
        Self::OutOfMemory {
            required,
            available,
        }
    }

    /// Create a fatal backend error
    pub fn backend_fatal(message: impl Into<String>) -> Self {
        Self::BackendFatal {
            message: message.into(),
        }
    }

    /// Create a kernel compilation error
    pub fn kernel_compile(period: u64, message: impl Into<String>) -> Self {
        Self::KernelCompile {
            period,
            message: message.into(),
        }
    }

    /// Create a malformed-work error
    pub fn malformed_work(message: impl Into<String>) -> Self {
        Self::MalformedWork {
            message: message.into(),
        }
    }

    /// Create a pool transport error
    pub fn pool_transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PoolTransport {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a verification error
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
        }
    }

    /// Create an invariant-violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether the error is recovered locally (by pausing a worker or
    /// rotating the connection list) rather than by terminating
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DeviceUnavailable { .. }
                | Error::OutOfMemory { .. }
                | Error::KernelCompile { .. }
                | Error::MalformedWork { .. }
                | Error::PoolTransport { .. }
                | Error::Verification { .. }
                | Error::Timeout { .. }
        )
    }

    /// Whether the error must terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BackendFatal { .. } | Error::Invariant { .. })
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Config { .. } => "config",
            Error::DeviceUnavailable { .. } => "device",
            Error::OutOfMemory { .. } => "memory",
            Error::BackendFatal { .. } => "backend",
            Error::KernelCompile { .. } => "kernel",
            Error::MalformedWork { .. } => "work",
            Error::PoolTransport { .. } => "transport",
            Error::Verification { .. } => "verification",
            Error::Invariant { .. } => "invariant",
            Error::Cancelled { .. } => "cancelled",
            Error::Timeout { .. } => "timeout",
        }
    }
}
