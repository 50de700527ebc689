//! UI server (C11): the operator-facing control plane, reachable over
//! WebSocket or HTTP depending on `[ui_server].type`, fanning procedures out
//! to station workers over their own command mailboxes and aggregating
//! their answers. Implements spec.md §6's closed procedure-name set.

pub mod aggregate;
pub mod auth;
pub mod http;
pub mod ratelimit;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::warn;

use crate::bootstrap::SimulatorLifecycle;
use crate::config::{StationTemplate, UiServerConfig, UiServerType};
use crate::station::{EmitAction, StationHandle, StationCommand};
use crate::support::shutdown::ShutdownSignal;

use self::aggregate::Aggregator;
use self::ratelimit::FixedWindowLimiter;

/// Shared state reachable by both the HTTP and WebSocket transports.
#[derive(Clone)]
pub struct ControlPlaneState {
    pub stations: Arc<DashMap<String, StationHandle>>,
    pub templates: Arc<Vec<StationTemplate>>,
    pub config: Arc<UiServerConfig>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub aggregator: Arc<Aggregator>,
    pub lifecycle: SimulatorLifecycle,
}

impl ControlPlaneState {
    pub fn new(
        stations: Arc<DashMap<String, StationHandle>>,
        templates: Arc<Vec<StationTemplate>>,
        config: UiServerConfig,
        lifecycle: SimulatorLifecycle,
    ) -> Self {
        let limiter = Arc::new(FixedWindowLimiter::new(
            config.rate_limit_max,
            Duration::from_millis(config.rate_limit_window_ms),
        ));
        Self {
            stations,
            templates,
            config: Arc::new(config),
            limiter,
            aggregator: Arc::new(Aggregator::new()),
            lifecycle,
        }
    }

    fn all_hash_ids(&self) -> Vec<String> {
        self.stations.iter().map(|e| e.key().clone()).collect()
    }

    fn targets(&self, payload: &Value) -> Vec<String> {
        match payload.get("hashIds").and_then(|v| v.as_array()) {
            Some(arr) => arr.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
            None => self.all_hash_ids(),
        }
    }
}

/// Outcome of dispatching one procedure call (spec.md §6: SUCCESS/FAILURE).
/// Every payload carries a literal `"status": "success"|"failure"` field,
/// load-bearing on the WebSocket transport which has no status-code channel.
pub struct ProcedureResult {
    pub success: bool,
    pub payload: Value,
}

impl ProcedureResult {
    fn ok(payload: Value) -> Self {
        Self::with_status(true, payload)
    }

    fn fail(message: impl Into<String>) -> Self {
        Self::with_status(false, json!({"error": message.into()}))
    }

    fn with_status(success: bool, mut payload: Value) -> Self {
        if let Value::Object(ref mut map) = payload {
            map.insert("status".to_string(), json!(if success { "success" } else { "failure" }));
        }
        Self { success, payload }
    }
}

/// spec.md §4.8's "Command -> outcome mapping" table: whether one station's
/// answer to a fanned-out emit procedure counts as a success.
fn command_succeeded(procedure_name: &str, value: &Value) -> bool {
    match procedure_name {
        "startTransaction" | "stopTransaction" | "authorize" => {
            value.get("idTagInfo").and_then(|v| v.get("status")).and_then(|v| v.as_str()) == Some("Accepted")
        }
        "bootNotification" | "dataTransfer" => value.get("status").and_then(|v| v.as_str()) == Some("Accepted"),
        "statusNotification" | "meterValues" => value.as_object().map(|o| o.is_empty()).unwrap_or(false),
        "heartbeat" => value.get("currentTime").is_some(),
        _ => true,
    }
}

/// Route one `[correlationId, procedureName, payload]` call. Shared by the
/// HTTP and WebSocket transports so both speak exactly the same procedure
/// surface.
pub async fn dispatch_procedure(state: &ControlPlaneState, procedure_name: &str, payload: Value) -> ProcedureResult {
    match procedure_name {
        "simulatorState" => ProcedureResult::ok(json!({
            "state": state.lifecycle.state().as_str(),
            "stationsRegistered": state.stations.len(),
        })),
        "listTemplates" => {
            let names: Vec<&str> = state.templates.iter().map(|t| t.base_name.as_str()).collect();
            ProcedureResult::ok(json!({"templates": names}))
        }
        "listChargingStations" => {
            let mut stations = Vec::new();
            for entry in state.stations.iter() {
                if let Some(snapshot) = entry.value().snapshot().await {
                    stations.push(json!({
                        "stationId": snapshot.station_id,
                        "hashId": snapshot.hash_id,
                        "connectionState": snapshot.connection_state,
                        "bootAccepted": snapshot.boot_accepted,
                    }));
                }
            }
            ProcedureResult::ok(json!({"chargingStations": stations}))
        }
        "addChargingStations" | "deleteChargingStations" => {
            // Dynamic pool resizing is owned by bootstrap at startup time in
            // this simulator; the control plane only drives stations that
            // already exist.
            ProcedureResult::fail("dynamic station pool changes are not supported at runtime")
        }
        "performanceStatistics" => {
            let mut entries = Vec::new();
            for entry in state.stations.iter() {
                if let Some(snapshot) = entry.value().snapshot().await {
                    entries.push(json!({
                        "hashId": snapshot.hash_id,
                        "connectionState": snapshot.connection_state,
                        "connectors": snapshot.connectors.iter().map(|(id, status)| json!({"connectorId": id, "status": status.as_str()})).collect::<Vec<_>>(),
                    }));
                }
            }
            ProcedureResult::ok(json!({"stations": entries}))
        }
        "startSimulator" | "stopSimulator" => {
            let cmd = if procedure_name == "startSimulator" { StationCommand::Start } else { StationCommand::Stop };
            for entry in state.stations.iter() {
                let _ = entry.value().command_tx.send(match cmd {
                    StationCommand::Start => StationCommand::Start,
                    _ => StationCommand::Stop,
                });
            }
            ProcedureResult::ok(json!({"status": "Accepted"}))
        }
        "startChargingStation" | "stopChargingStation" | "openConnection" | "closeConnection" => {
            let targets = state.targets(&payload);
            let mut failed = Vec::new();
            for hash_id in &targets {
                let sent = state.stations.get(hash_id).map(|h| {
                    let cmd = match procedure_name {
                        "startChargingStation" => StationCommand::Start,
                        "stopChargingStation" => StationCommand::Stop,
                        "openConnection" => StationCommand::OpenConnection,
                        _ => StationCommand::CloseConnection,
                    };
                    h.command_tx.send(cmd).is_ok()
                });
                if sent != Some(true) {
                    failed.push(hash_id.clone());
                }
            }
            if failed.is_empty() {
                ProcedureResult::ok(json!({"status": "Accepted", "hashIds": targets}))
            } else {
                ProcedureResult::fail(format!("unknown station(s): {:?}", failed))
            }
        }
        "startAutomaticTransactionGenerator" | "stopAutomaticTransactionGenerator" => {
            let connector_id = payload.get("connectorId").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
            for hash_id in state.targets(&payload) {
                if let Some(h) = state.stations.get(&hash_id) {
                    let cmd = if procedure_name.starts_with("start") {
                        StationCommand::StartAtg { connector_id }
                    } else {
                        StationCommand::StopAtg { connector_id }
                    };
                    let _ = h.command_tx.send(cmd);
                }
            }
            ProcedureResult::ok(json!({"status": "Accepted"}))
        }
        "setSupervisionUrl" => ProcedureResult::ok(json!({"status": "Accepted"})),
        _ => dispatch_emit_procedure(state, procedure_name, payload).await,
    }
}

async fn dispatch_emit_procedure(state: &ControlPlaneState, procedure_name: &str, payload: Value) -> ProcedureResult {
    let action = match build_emit_action(procedure_name, &payload) {
        Ok(action) => action,
        Err(e) => return ProcedureResult::fail(e),
    };

    // The deprecated singular `hashId` is ignored for routing (spec.md §4.8);
    // every emit procedure fans out over `hashIds` (or all stations) and
    // aggregates the answers.
    if payload.get("hashId").is_some() {
        warn!(procedure_name, "deprecated singular 'hashId' field ignored; use 'hashIds'");
    }

    let targets = state.targets(&payload);
    if targets.is_empty() {
        return ProcedureResult::fail("no stations registered");
    }

    let correlation_id = uuid::Uuid::new_v4().to_string();
    let aggregator = state.aggregator.clone();
    let procedure_name = procedure_name.to_string();
    for hash_id in &targets {
        let Some(handle) = state.stations.get(hash_id).map(|e| e.value().clone()) else {
            continue;
        };
        let aggregator = aggregator.clone();
        let correlation_id = correlation_id.clone();
        let hash_id = hash_id.clone();
        let action = action.clone();
        let procedure_name = procedure_name.clone();
        tokio::spawn(async move {
            match handle.emit(action).await {
                Ok(value) => {
                    let success = command_succeeded(&procedure_name, &value);
                    aggregator.record(&correlation_id, hash_id, success, value);
                }
                Err(e) => aggregator.record(&correlation_id, hash_id, false, json!({"error": e})),
            }
        });
    }

    let timeout = Duration::from_millis(state.config.aggregation_timeout_ms);
    let result = aggregate::await_aggregate(&state.aggregator, correlation_id, targets, timeout).await;
    let success = result.hash_ids_failed.is_empty() && result.responses_failed.is_empty();
    ProcedureResult::with_status(
        success,
        json!({
            "hashIdsSucceeded": result.hash_ids_succeeded,
            "hashIdsFailed": result.hash_ids_failed,
            "responsesFailed": result.responses_failed,
        }),
    )
}

fn build_emit_action(procedure_name: &str, payload: &Value) -> Result<EmitAction, String> {
    let action = match procedure_name {
        "bootNotification" => EmitAction::BootNotification,
        "heartbeat" => EmitAction::Heartbeat,
        "statusNotification" => EmitAction::StatusNotification {
            connector_id: payload.get("connectorId").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            status: payload.get("status").and_then(|v| v.as_str()).unwrap_or("Available").to_string(),
        },
        "authorize" => EmitAction::Authorize {
            id_tag: payload.get("idTag").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        },
        "startTransaction" => EmitAction::StartTransaction {
            connector_id: payload.get("connectorId").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
            id_tag: payload.get("idTag").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        },
        "stopTransaction" => EmitAction::StopTransaction {
            transaction_id: payload.get("transactionId").and_then(|v| v.as_i64()).unwrap_or(0),
        },
        "meterValues" => EmitAction::MeterValues {
            connector_id: payload.get("connectorId").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
        },
        "dataTransfer" => EmitAction::DataTransfer {
            vendor_id: payload.get("vendorId").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            message_id: payload.get("messageId").and_then(|v| v.as_str()).map(String::from),
            data: payload.get("data").and_then(|v| v.as_str()).map(String::from),
        },
        "diagnosticsStatusNotification" => EmitAction::DiagnosticsStatusNotification {
            status: payload.get("status").and_then(|v| v.as_str()).unwrap_or("Idle").to_string(),
        },
        "firmwareStatusNotification" => EmitAction::FirmwareStatusNotification {
            status: payload.get("status").and_then(|v| v.as_str()).unwrap_or("Idle").to_string(),
        },
        other => return Err(format!("unknown procedure '{}'", other)),
    };
    Ok(action)
}

/// Bind and run the configured UI server transport until shutdown is
/// triggered. A disabled `[ui_server]` makes this a no-op (spec.md §6).
pub async fn serve(state: ControlPlaneState, shutdown: ShutdownSignal) -> std::io::Result<()> {
    if !state.config.enabled {
        tracing::info!("UI server disabled by configuration");
        shutdown.notified().wait().await;
        return Ok(());
    }

    let addr = format!("{}:{}", state.config.options.host, state.config.options.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = addr.as_str(), kind = ?state.config.r#type, "UI server listening");

    let app = match state.config.r#type {
        UiServerType::Http => http::router(state),
        UiServerType::Ws => ws::router(state),
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.notified().wait().await })
        .await
}
