//! # meowminer
//!
//! A GPU-oriented Proof-of-Work miner for MeowPoW (ProgPoW family) chains.
//! The miner pulls work from a failover list of pools, searches candidate
//! nonces against the job boundary with the memory-hard MeowPoW function,
//! and submits verified solutions back to the active pool.
//!
//! ## Architecture
//!
//! Three subsystems compose bottom-up:
//!
//! - the cryptographic core ([`ethash`] epoch machinery and the [`progpow`]
//!   engine with its period kernel generator),
//! - the mining plane (one [`miner::MinerWorker`] thread per device behind
//!   a [`backend::DeviceBackend`], coordinated by the [`miner::Farm`]),
//! - the pool plane (the [`pool::PoolManager`] event loop driving protocol
//!   clients through the [`pool::ClientFactory`] seam).
//!
//! Workers and the pool manager communicate exclusively through one event
//! channel, so all manager state changes happen in a single serial order.

#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod error;
pub mod ethash;
pub mod miner;
pub mod pool;
pub mod progpow;
pub mod types;
pub mod utils;

pub use crate::error::{Error, Result};
pub use config::Config;
pub use types::{
    DeviceDescriptor, DeviceKind, Hash256, Hash512, HashRate, Solution, WorkPackage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
