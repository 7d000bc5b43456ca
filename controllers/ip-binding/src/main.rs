//! IPBinding GC Controller
//!
//! Watches IPBinding records and reclaims addresses whose owning resource
//! no longer exists: the slot goes back to the pool ledger and the binding
//! is deleted. Fixed bindings get a grace period between "owner gone" and
//! reclamation so a resource recreation in flight does not lose its
//! address.
//!
//! The allocator's own release paths are best-effort; this controller is
//! what makes reclamation eventually happen.

mod backoff;
mod controller;
mod error;
mod reconciler;
mod watcher;


use std::env;
use std::time::Duration;

use tracing::info;

use crate::controller::{Controller, GcConfig};
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting IPBinding GC Controller");

    // Load configuration from environment variables
    let resync_secs = env_u64("RESYNC_INTERVAL_SECS", 60)?;
    let grace_secs = env_u64("RELEASE_GRACE_SECS", 60)?;
    let retry = env_u64("RECLAIM_RETRY", 10)?;

    info!("Configuration:");
    info!("  Resync interval: {resync_secs}s");
    info!("  Release grace period: {grace_secs}s");
    info!("  Retry bound: {retry}");

    let config = GcConfig {
        resync: Duration::from_secs(resync_secs),
        grace: chrono::Duration::seconds(grace_secs as i64),
        retry: retry as u32,
    };

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}

fn env_u64(name: &str, default: u64) -> Result<u64, ControllerError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value.parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("{name} must be an integer, got {value:?}"))
        }),
    }
}
