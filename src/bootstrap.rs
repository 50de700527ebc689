//! Process bootstrap (C12 ambient): loads configuration, spawns one station
//! supervisor per requested replica, wires the control plane, and drives the
//! whole process through Starting -> Running -> Stopping -> Stopped.
//!
//! Follows the usual process-bootstrap shape: load config, build shared
//! state, spawn server tasks under a `tokio::select!` against the shutdown
//! signal.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::config::{SimulatorConfig, StationTemplate};
use crate::control_plane::{self, ControlPlaneState};
use crate::error::SimError;
use crate::station::{Station, StationHandle};
use crate::support::shutdown::ShutdownSignal;

/// Process-wide lifecycle state (spec.md §4.9): `Starting -> Running ->
/// Stopping -> Stopped`, reachable read-only from the control plane's
/// `simulatorState` procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Idempotent start/stop over the process-wide lifecycle state, reachable
/// from the control plane's `startSimulator`/`stopSimulator` procedures.
#[derive(Clone)]
pub struct SimulatorLifecycle {
    state: Arc<AtomicU8>,
}

impl SimulatorLifecycle {
    fn new() -> Self {
        Self { state: Arc::new(AtomicU8::new(LifecycleState::Starting as u8)) }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    fn set(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Load every configured station template and spawn its replicas.
///
/// A single template file failing to parse only drops that template's
/// stations (logged, not fatal); the top-level `SimulatorConfig` failing is
/// fatal to the whole process.
fn load_templates(config: &SimulatorConfig) -> Vec<StationTemplate> {
    let mut templates = Vec::new();
    for entry in &config.station_template_urls {
        match StationTemplate::load(&entry.file) {
            Ok(template) => {
                for _ in 0..entry.number_of_stations {
                    templates.push(template.clone());
                }
            }
            Err(e) => {
                warn!(file = %entry.file.display(), error = %e, "failed to load station template, skipping");
            }
        }
    }
    templates
}

/// Spawn every station replica described by `templates`, returning the
/// hashId-keyed registry the control plane addresses them through.
fn spawn_stations(
    config: &SimulatorConfig,
    templates: &[StationTemplate],
    shutdown: ShutdownSignal,
) -> Arc<DashMap<String, StationHandle>> {
    let registry = Arc::new(DashMap::new());
    let mut counters: std::collections::HashMap<String, u32> = std::collections::HashMap::new();

    for template in templates {
        let counter = counters.entry(template.base_name.clone()).or_insert(0);
        let station_index = *counter;
        *counter += 1;

        let station_id = template.derive_station_id(station_index);
        let station = Station::new(
            template,
            station_id.clone(),
            station_index,
            config.supervision_urls.clone(),
            config.supervision_url_distribution,
            shutdown.clone(),
        );
        let (handle, _join) = station.spawn();
        if template.auto_register {
            let _ = handle.command_tx.send(crate::station::StationCommand::Start);
        }
        registry.insert(handle.hash_id.clone(), handle);
        info!(station_id = station_id.as_str(), "station supervisor spawned");
    }

    registry
}

/// Run the simulator to completion: load config, spawn stations, serve the
/// control plane, and block until `shutdown` fires.
pub async fn run(config_path: &Path, shutdown: ShutdownSignal) -> Result<(), SimError> {
    let config = SimulatorConfig::load(config_path)?;
    run_with_config(config, shutdown).await
}

pub async fn run_with_config(config: SimulatorConfig, shutdown: ShutdownSignal) -> Result<(), SimError> {
    let lifecycle = SimulatorLifecycle::new();

    let templates = load_templates(&config);
    info!(count = templates.len(), "station templates resolved");

    let stations = spawn_stations(&config, &templates, shutdown.clone());
    let ui_state = ControlPlaneState::new(
        stations.clone(),
        Arc::new(templates),
        config.ui_server.clone(),
        lifecycle.clone(),
    );

    lifecycle.set(LifecycleState::Running);
    let result = control_plane::serve(ui_state, shutdown.clone()).await;

    lifecycle.set(LifecycleState::Stopping);
    for entry in stations.iter() {
        let _ = entry.value().command_tx.send(crate::station::StationCommand::Stop);
    }
    lifecycle.set(LifecycleState::Stopped);

    result.map_err(SimError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_starts_in_starting_state() {
        let lifecycle = SimulatorLifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(!lifecycle.is_running());
        lifecycle.set(LifecycleState::Running);
        assert!(lifecycle.is_running());
        lifecycle.set(LifecycleState::Stopping);
        assert!(!lifecycle.is_running());
        lifecycle.set(LifecycleState::Stopped);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }
}
