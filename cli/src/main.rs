//! OCPP station simulator — CLI entry point.
//!
//! Headless fleet simulator suitable for deployment as a systemd service,
//! Docker container, or standalone process.
//!
//! ```sh
//! # Run with default config (~/.config/ocpp-station-sim/config.toml)
//! ocpp-station-sim-cli
//!
//! # Custom config path
//! ocpp-station-sim-cli --config /etc/ocpp-station-sim/config.toml
//!
//! # Validate config without starting
//! ocpp-station-sim-cli --check
//! ```

use std::path::PathBuf;

use clap::Parser;
use ocpp_station_sim::config::{default_config_path, SimulatorConfig};
use ocpp_station_sim::support::shutdown::ShutdownCoordinator;
use ocpp_station_sim::{bootstrap, SimError};
use tracing::{error, info};

/// OCPP station simulator — drives a fleet of simulated charging stations
/// against one or more supervision (CSMS) servers.
#[derive(Parser, Debug)]
#[command(
    name = "ocpp-station-sim-cli",
    version,
    about = "Simulates a fleet of OCPP 1.6-J charging stations",
    long_about = "OCPP station simulator — drives simulated charging stations as \
                  WebSocket clients of one or more supervision servers, controllable \
                  via a UI server (HTTP or WebSocket).\n\n\
                  Default config: ~/.config/ocpp-station-sim/config.toml"
)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, env = "OCPP_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration file and exit without starting the simulator.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(default_config_path);

    let mut config = match SimulatorConfig::load(&config_path) {
        Ok(cfg) => {
            init_tracing(&cfg.log.level);
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

    if let Some(ref level) = cli.log_level {
        info!("CLI override: log_level = {}", level);
        config.log.level = level.clone();
    }

    if cli.check {
        println!("Configuration is valid");
        println!("   Config file        : {}", config_path.display());
        println!("   Supervision URLs    : {:?}", config.supervision_urls);
        println!("   Station templates   : {}", config.station_template_urls.len());
        println!(
            "   UI server           : {:?} on {}:{}",
            config.ui_server.r#type, config.ui_server.options.host, config.ui_server.options.port
        );
        println!("   Log level           : {}", config.log.level);
        return Ok(());
    }

    let shutdown = ShutdownCoordinator::new(30);
    shutdown.start_signal_listener();
    let shutdown_signal = shutdown.signal();

    info!("press Ctrl+C to shutdown gracefully");
    let result: Result<(), SimError> = bootstrap::run_with_config(config, shutdown_signal).await;
    result?;

    Ok(())
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}
