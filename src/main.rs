//! OCPP 1.6-J charging station simulator.
//! Reads configuration from TOML file (default: `~/.config/ocpp-station-sim/config.toml`).

use ocpp_station_sim::bootstrap;
use ocpp_station_sim::config::{default_config_path, SimulatorConfig};
use ocpp_station_sim::support::shutdown::ShutdownCoordinator;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("OCPP_SIM_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());

    let config = match SimulatorConfig::load(&config_path) {
        Ok(cfg) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log.level)),
                )
                .init();
            info!("configuration loaded from {}", config_path.display());
            cfg
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            error!("failed to load config from {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    info!("starting OCPP station simulator...");

    let shutdown = ShutdownCoordinator::new(30);
    shutdown.start_signal_listener();
    let shutdown_signal = shutdown.signal();

    bootstrap::run_with_config(config, shutdown_signal).await?;

    info!("simulator shutdown complete");
    Ok(())
}
