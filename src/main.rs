//! meowminer entry point
//!
//! Wires configuration, device enumeration, the farm and the pool manager
//! together and runs until the pool list is exhausted, a fatal device
//! error occurs, or ctrl-c is received.

use clap::Parser;
use meowminer::backend::{CpuBackend, DeviceBackend};
use meowminer::config::Config;
use meowminer::miner::Farm;
use meowminer::pool::{DefaultClientFactory, PoolManager};
use meowminer::{Error, Result, VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config = Config::parse();
    let pool_settings = config.pool_settings()?;
    let farm_settings = config.farm_settings();

    info!("meowminer v{}", VERSION);

    // The CPU reference backend is always available; CUDA/OpenCL backends
    // are vendor plug-ins implementing the same DeviceBackend capability.
    let backends: Vec<Arc<dyn DeviceBackend>> = CpuBackend::enumerate()
        .into_iter()
        .map(|descriptor| {
            info!(
                device = %descriptor.unique_id,
                name = %descriptor.name,
                "found device"
            );
            Arc::new(CpuBackend::new(descriptor)) as Arc<dyn DeviceBackend>
        })
        .collect();
    if backends.is_empty() {
        return Err(Error::config("no usable mining devices found"));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let farm = Farm::new(farm_settings, backends, tx.clone());
    let (manager, handle) = PoolManager::new(
        pool_settings,
        farm.clone(),
        Box::new(DefaultClientFactory),
        tx,
        rx,
    );

    // Periodic progress line while the manager runs
    let telemetry_farm = farm.clone();
    let telemetry_status = handle.clone();
    let telemetry = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !telemetry_status.status().is_running() {
                break;
            }
            info!("{}", telemetry_farm.telemetry().summary());
        }
    });

    let mut manager_task = tokio::spawn(manager.run());
    let result = tokio::select! {
        joined = &mut manager_task => flatten_join(joined),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            handle.stop();
            flatten_join((&mut manager_task).await)
        }
    };

    telemetry.abort();
    farm.stop();
    result
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(Error::config(format!("pool manager task failed: {}", err))),
    }
}
