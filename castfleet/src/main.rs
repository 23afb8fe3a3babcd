//! Castfleet composition root.
//!
//! Wires the configuration service, streaming subsystem and device
//! manager together, loads the desired state and runs discovery until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use castconfig::ConfigService;
use castcontrol::{DeviceManager, ProgressStore};
use caststream::{SessionRegistry, StreamingServerPool};

/// Logging stand-in for the database collaborator.
struct LogProgressStore;

impl ProgressStore for LogProgressStore {
    fn save_progress(&self, device_name: &str, position: &str, duration: &str, progress: u8) {
        debug!(
            "Progress for {}: {} / {} ({}%)",
            device_name, position, duration, progress
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ========== Phase 1: services ==========
    let config = Arc::new(ConfigService::new());
    let registry = SessionRegistry::new();
    let pool = Arc::new(StreamingServerPool::new(registry.clone()));
    let manager = DeviceManager::new(Arc::clone(&config), registry, pool);
    manager.install_health_handler();
    manager.set_progress_store(Arc::new(LogProgressStore));

    // ========== Phase 2: desired state ==========
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(config_path) => {
            let names = manager.load_devices_from_config(&config_path);
            info!(
                "Loaded {} device configuration(s) from {}",
                names.len(),
                config_path.display()
            );
        }
        None => {
            warn!("No configuration file given; devices will be discovered but not auto-assigned");
        }
    }

    // ========== Phase 3: discovery ==========
    manager.start_discovery();
    info!("Castfleet control plane running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    manager.shutdown();

    Ok(())
}
