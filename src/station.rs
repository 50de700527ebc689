//! Station supervisor (C9): owns one simulated charging station's
//! connection, connectors, request registry and ATG, and exposes the local
//! command surface the control plane and bootstrap drive it through.
//!
//! The mailbox loop below is a single cooperative worker per station: one
//! `tokio::select!` fields inbound socket events, local commands, and a
//! 1-second clock tick that drives reconnection, heartbeats and the ATG.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::atg::{AtgConfig, AtgTick, ConnectorAtg};
use crate::config::{StationTemplate, SupervisionUrlDistribution};
use crate::connection::{is_normal_close, ConnectionEvent, ConnectionManager, ConnectionState, ReconnectPolicy};
use crate::connector::{Availability, Connector, ConnectorStatus};
use crate::dispatch::{self, ConfigurationStore, DispatchEffect};
use crate::error::{OcppError, OcppErrorCode};
use crate::outgoing::{self, action, RequestOptions};
use crate::registry::{RequestFailure, RequestRegistry};
use crate::support::hashid::{self, HashIdInput};
use crate::support::ocpp_frame::OcppFrame;
use crate::support::shutdown::ShutdownSignal;

const CLOCK_TICK: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
const DEFAULT_METER_VALUES_INTERVAL_SECS: u64 = 60;
const DEFAULT_START_TRANSACTION_TIMEOUT_SECS: u64 = 10;
/// Assumed per-connector power ceiling used only to bound the synthetic
/// energy increment between periodic MeterValues samples.
const ASSUMED_MAX_POWER_W: f64 = 7_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy)]
pub enum BootState {
    NotBooted,
    Pending { interval_secs: u64 },
    Accepted { interval_secs: u64 },
    Rejected,
}

#[derive(Debug, Clone)]
pub struct StationIdentity {
    pub station_id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub meter_type: Option<String>,
    pub meter_serial_number: Option<String>,
    pub hash_id: String,
}

/// One outgoing OCPP action the control plane (or bootstrap) can request be
/// emitted directly, outside of the ATG's own session loop.
#[derive(Debug, Clone)]
pub enum EmitAction {
    BootNotification,
    Heartbeat,
    StatusNotification { connector_id: u32, status: String },
    Authorize { id_tag: String },
    StartTransaction { connector_id: u32, id_tag: String },
    StopTransaction { transaction_id: i64 },
    MeterValues { connector_id: u32 },
    DataTransfer { vendor_id: String, message_id: Option<String>, data: Option<String> },
    DiagnosticsStatusNotification { status: String },
    FirmwareStatusNotification { status: String },
}

#[derive(Debug)]
pub enum StationCommand {
    Start,
    Stop,
    OpenConnection,
    CloseConnection,
    StartAtg { connector_id: u32 },
    StopAtg { connector_id: u32 },
    Emit { action: EmitAction, reply: oneshot::Sender<Result<Value, String>> },
    Snapshot { reply: oneshot::Sender<StationSnapshot> },
}

/// A point-in-time summary for `listChargingStations`/`performanceStatistics`.
#[derive(Debug, Clone)]
pub struct StationSnapshot {
    pub station_id: String,
    pub hash_id: String,
    pub connection_state: &'static str,
    pub boot_accepted: bool,
    pub connectors: Vec<(u32, ConnectorStatus)>,
}

#[derive(Clone)]
pub struct StationHandle {
    pub station_id: String,
    pub hash_id: String,
    pub command_tx: mpsc::UnboundedSender<StationCommand>,
}

impl StationHandle {
    pub async fn snapshot(&self) -> Option<StationSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(StationCommand::Snapshot { reply: tx }).ok()?;
        rx.await.ok()
    }

    pub async fn emit(&self, action: EmitAction) -> Result<Value, String> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(StationCommand::Emit { action, reply: tx })
            .map_err(|_| "station mailbox closed".to_string())?;
        rx.await.map_err(|_| "station mailbox dropped reply".to_string())?
    }
}

pub struct Station {
    identity: StationIdentity,
    connectors: HashMap<u32, Connector>,
    configuration: ConfigurationStore,
    connection: ConnectionManager,
    registry: RequestRegistry,
    atgs: HashMap<u32, ConnectorAtg>,
    id_tags: Vec<String>,
    boot_state: BootState,
    lifecycle: LifecycleState,
    next_reconnect_at: Option<Instant>,
    last_heartbeat_at: Option<Instant>,
    last_meter_values_at: Option<Instant>,
    /// RemoteStartTransaction calls accepted but not yet due: `(fire_at, connector_id, id_tag)`.
    pending_remote_starts: Vec<(Instant, u32, String)>,
    shutdown: ShutdownSignal,
}

impl Station {
    pub fn new(
        template: &StationTemplate,
        station_id: String,
        station_index: u32,
        supervision_urls: Vec<String>,
        distribution: SupervisionUrlDistribution,
        shutdown: ShutdownSignal,
    ) -> Self {
        let hash_id = hashid::compute(&HashIdInput {
            model: &template.model,
            vendor: &template.vendor,
            serial_number: template.serial_number.as_deref(),
            meter_serial_number: template.meter_serial_number.as_deref(),
            meter_type: template.meter_type.as_deref(),
            station_id: &station_id,
        });

        let identity = StationIdentity {
            station_id: station_id.clone(),
            vendor: template.vendor.clone(),
            model: template.model.clone(),
            serial_number: template.serial_number.clone(),
            firmware_version: template.firmware_version.clone(),
            meter_type: template.meter_type.clone(),
            meter_serial_number: template.meter_serial_number.clone(),
            hash_id,
        };

        let mut connectors = HashMap::new();
        connectors.insert(0, Connector::new(0));
        for id in 1..=template.num_connectors {
            connectors.insert(id, Connector::new(id));
        }

        let mut configuration = ConfigurationStore::new();
        configuration.insert("HeartbeatInterval", DEFAULT_HEARTBEAT_INTERVAL_SECS.to_string(), false);
        configuration.insert(
            "MeterValueSampleInterval",
            DEFAULT_METER_VALUES_INTERVAL_SECS.to_string(),
            false,
        );
        configuration.insert(
            "StartTransactionTimeOut",
            DEFAULT_START_TRANSACTION_TIMEOUT_SECS.to_string(),
            false,
        );
        for entry in &template.configuration_key {
            configuration.insert(entry.key.clone(), entry.value.clone(), entry.readonly);
        }

        let mut atgs = HashMap::new();
        if let Some(atg_template) = &template.automatic_transaction_generator {
            if atg_template.enable {
                let cfg = AtgConfig {
                    min_duration: Duration::from_secs(atg_template.min_duration_secs),
                    max_duration: Duration::from_secs(atg_template.max_duration_secs),
                    min_delay_between_transactions: Duration::from_secs(
                        atg_template.min_delay_between_two_transactions_secs,
                    ),
                    max_delay_between_transactions: Duration::from_secs(
                        atg_template.max_delay_between_two_transactions_secs,
                    ),
                    probability_of_start: atg_template.probability_of_start,
                    stop_after: Duration::from_secs_f64(atg_template.stop_after_hours * 3600.0),
                    stop_on_connection_failure: atg_template.stop_on_connection_failure,
                    require_authorize: atg_template.require_authorize,
                };
                for id in 1..=template.num_connectors {
                    atgs.insert(id, ConnectorAtg::new(id, cfg.clone(), None));
                }
            }
        }

        let connection = ConnectionManager::new(
            station_id,
            supervision_urls,
            distribution,
            station_index,
            ReconnectPolicy::default(),
        );

        Self {
            identity,
            connectors,
            configuration,
            connection,
            registry: RequestRegistry::new(),
            atgs,
            id_tags: template.id_tags.clone(),
            boot_state: BootState::NotBooted,
            lifecycle: LifecycleState::Stopped,
            next_reconnect_at: None,
            last_heartbeat_at: None,
            last_meter_values_at: None,
            pending_remote_starts: Vec::new(),
            shutdown,
        }
    }

    pub fn spawn(self) -> (StationHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = StationHandle {
            station_id: self.identity.station_id.clone(),
            hash_id: self.identity.hash_id.clone(),
            command_tx: tx,
        };
        let join = tokio::spawn(self.run(rx));
        (handle, join)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<StationCommand>) {
        let mut events_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>> = None;
        let mut clock = tokio::time::interval(CLOCK_TICK);

        loop {
            let next_event = async {
                match events_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown.notified().wait() => {
                    self.registry.cancel_all();
                    break;
                }
                Some(cmd) = commands.recv() => {
                    self.handle_command(cmd, &mut events_rx).await;
                }
                maybe_event = next_event => {
                    match maybe_event {
                        Some(event) => self.handle_connection_event(event).await,
                        None => {
                            self.connection.mark_disconnected();
                            events_rx = None;
                            self.schedule_reconnect();
                        }
                    }
                }
                _ = clock.tick() => {
                    self.handle_tick(&mut events_rx).await;
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: StationCommand,
        events_rx: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    ) {
        match cmd {
            StationCommand::Start => {
                self.lifecycle = LifecycleState::Running;
                self.next_reconnect_at = Some(Instant::now());
            }
            StationCommand::Stop => {
                self.lifecycle = LifecycleState::Stopped;
                self.connection.mark_disconnected();
                self.connection.clear_buffer();
                self.registry.cancel_all();
                *events_rx = None;
                self.next_reconnect_at = None;
            }
            StationCommand::OpenConnection => {
                self.next_reconnect_at = Some(Instant::now());
            }
            StationCommand::CloseConnection => {
                self.connection.mark_disconnected();
                *events_rx = None;
                self.next_reconnect_at = None;
            }
            StationCommand::StartAtg { connector_id } => {
                // ATGs are instantiated from the template's config at station
                // construction; re-starting one that was stopped re-enters
                // the map rather than rebuilding its schedule.
                if !self.atgs.contains_key(&connector_id) {
                    warn!(
                        station_id = self.identity.station_id.as_str(),
                        connector_id, "no automatic transaction generator configured for connector"
                    );
                }
            }
            StationCommand::StopAtg { connector_id } => {
                self.atgs.remove(&connector_id);
            }
            StationCommand::Emit { action, reply } => {
                let result = self.emit(action).await;
                let _ = reply.send(result);
            }
            StationCommand::Snapshot { reply } => {
                let snapshot = StationSnapshot {
                    station_id: self.identity.station_id.clone(),
                    hash_id: self.identity.hash_id.clone(),
                    connection_state: match self.connection.state() {
                        ConnectionState::Connected => "Connected",
                        ConnectionState::Connecting => "Connecting",
                        ConnectionState::Disconnected => "Disconnected",
                    },
                    boot_accepted: matches!(self.boot_state, BootState::Accepted { .. }),
                    connectors: self.connectors.iter().map(|(id, c)| (*id, c.status)).collect(),
                };
                let _ = reply.send(snapshot);
            }
        }
    }

    async fn emit(&mut self, emit_action: EmitAction) -> Result<Value, String> {
        let outcome = match emit_action {
            EmitAction::BootNotification => self.send_boot_notification().await,
            EmitAction::Heartbeat => {
                outgoing::request(
                    &self.registry,
                    &mut self.connection,
                    action::HEARTBEAT,
                    outgoing::heartbeat_payload(),
                    RequestOptions::default(),
                )
                .await
            }
            EmitAction::StatusNotification { connector_id, status } => {
                outgoing::request(
                    &self.registry,
                    &mut self.connection,
                    action::STATUS_NOTIFICATION,
                    outgoing::status_notification_payload(connector_id, &status, "NoError"),
                    RequestOptions::default(),
                )
                .await
            }
            EmitAction::Authorize { id_tag } => {
                outgoing::request(
                    &self.registry,
                    &mut self.connection,
                    action::AUTHORIZE,
                    outgoing::authorize_payload(&id_tag),
                    RequestOptions::default(),
                )
                .await
            }
            EmitAction::StartTransaction { connector_id, id_tag } => {
                self.send_start_transaction(connector_id, &id_tag).await
            }
            EmitAction::StopTransaction { transaction_id } => {
                self.send_stop_transaction(transaction_id).await
            }
            EmitAction::MeterValues { connector_id } => self.send_meter_values(connector_id).await,
            EmitAction::DataTransfer { vendor_id, message_id, data } => {
                outgoing::request(
                    &self.registry,
                    &mut self.connection,
                    action::DATA_TRANSFER,
                    outgoing::data_transfer_payload(&vendor_id, message_id.as_deref(), data.as_deref()),
                    RequestOptions::default(),
                )
                .await
            }
            EmitAction::DiagnosticsStatusNotification { status } => {
                outgoing::request(
                    &self.registry,
                    &mut self.connection,
                    action::DIAGNOSTICS_STATUS_NOTIFICATION,
                    outgoing::diagnostics_status_notification_payload(&status),
                    RequestOptions::default(),
                )
                .await
            }
            EmitAction::FirmwareStatusNotification { status } => {
                outgoing::request(
                    &self.registry,
                    &mut self.connection,
                    action::FIRMWARE_STATUS_NOTIFICATION,
                    outgoing::firmware_status_notification_payload(&status),
                    RequestOptions::default(),
                )
                .await
            }
        };
        outcome.map_err(|e| format!("{:?}", e))
    }

    async fn send_boot_notification(&mut self) -> Result<Value, RequestFailure> {
        let payload = outgoing::boot_notification_payload(
            &self.identity.vendor,
            &self.identity.model,
            self.identity.serial_number.as_deref(),
            self.identity.firmware_version.as_deref(),
            self.identity.meter_type.as_deref(),
            self.identity.meter_serial_number.as_deref(),
        );
        let result = outgoing::request(
            &self.registry,
            &mut self.connection,
            action::BOOT_NOTIFICATION,
            payload,
            RequestOptions::default(),
        )
        .await;
        if let Ok(value) = &result {
            let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("Rejected");
            let interval = value.get("interval").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS);
            self.boot_state = match status {
                "Accepted" => {
                    self.last_heartbeat_at = Some(Instant::now());
                    BootState::Accepted { interval_secs: interval }
                }
                "Pending" => BootState::Pending { interval_secs: interval },
                _ => BootState::Rejected,
            };
            info!(station_id = self.identity.station_id.as_str(), status, "boot notification result");
        }
        result
    }

    async fn send_start_transaction(&mut self, connector_id: u32, id_tag: &str) -> Result<Value, RequestFailure> {
        let meter_start = self
            .connectors
            .get(&connector_id)
            .map(|c| c.energy_active_import_register_value)
            .unwrap_or(0);
        let payload = outgoing::start_transaction_payload(connector_id, id_tag, meter_start, Utc::now(), None);
        let result = outgoing::request(
            &self.registry,
            &mut self.connection,
            action::START_TRANSACTION,
            payload,
            RequestOptions::default(),
        )
        .await;
        if let Ok(value) = &result {
            let accepted = value
                .get("idTagInfo")
                .and_then(|v| v.get("status"))
                .and_then(|v| v.as_str())
                == Some("Accepted");
            if accepted {
                if let Some(tx_id) = value.get("transactionId").and_then(|v| v.as_i64()) {
                    if let Some(connector) = self.connectors.get_mut(&connector_id) {
                        connector.begin_transaction(tx_id, id_tag, meter_start);
                        connector.status = ConnectorStatus::Charging;
                    }
                }
            }
        }
        result
    }

    async fn send_stop_transaction(&mut self, transaction_id: i64) -> Result<Value, RequestFailure> {
        let connector_id = self
            .connectors
            .iter()
            .find(|(_, c)| c.transaction_id == Some(transaction_id))
            .map(|(id, _)| *id);
        let meter_stop = connector_id
            .and_then(|id| self.connectors.get(&id))
            .map(|c| c.energy_active_import_register_value)
            .unwrap_or(0);
        let payload = outgoing::stop_transaction_payload(transaction_id, None, meter_stop, Utc::now(), None);
        let result = outgoing::request(
            &self.registry,
            &mut self.connection,
            action::STOP_TRANSACTION,
            payload,
            RequestOptions::default(),
        )
        .await;
        if result.is_ok() {
            if let Some(id) = connector_id {
                if let Some(connector) = self.connectors.get_mut(&id) {
                    connector.clear_transaction();
                    connector.status = ConnectorStatus::Available;
                }
            }
        }
        result
    }

    async fn send_meter_values(&mut self, connector_id: u32) -> Result<Value, RequestFailure> {
        let (transaction_id, sample) = match self.connectors.get(&connector_id) {
            Some(c) => (
                c.transaction_id,
                json!({
                    "timestamp": Utc::now().to_rfc3339(),
                    "sampledValue": [{
                        "value": c.energy_active_import_register_value.to_string(),
                        "measurand": "Energy.Active.Import.Register",
                        "unit": "Wh",
                        "context": "Trigger",
                        "location": "Outlet",
                    }],
                }),
            ),
            None => return Err(RequestFailure::Canceled),
        };
        outgoing::request(
            &self.registry,
            &mut self.connection,
            action::METER_VALUES,
            outgoing::meter_values_payload(connector_id, transaction_id, sample),
            RequestOptions::default(),
        )
        .await
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame(frame) => self.handle_frame(frame).await,
            ConnectionEvent::MalformedFrame(err) => {
                warn!(station_id = self.identity.station_id.as_str(), error = err.as_str(), "malformed inbound frame");
            }
            ConnectionEvent::Closed { code } => {
                self.connection.mark_disconnected();
                if !is_normal_close(code) {
                    self.schedule_reconnect();
                } else {
                    info!(station_id = self.identity.station_id.as_str(), "connection closed normally");
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: OcppFrame) {
        self.registry.sweep(Instant::now());
        match frame {
            OcppFrame::Call { unique_id, action, payload } => {
                let response = match dispatch::handle(&action, &payload, &mut self.configuration, &self.id_tags) {
                    Ok((value, effect)) => {
                        if let Some(effect) = effect {
                            self.apply_effect(effect).await;
                        }
                        OcppFrame::CallResult { unique_id, payload: value }
                    }
                    Err(err) => OcppFrame::error_response(unique_id, err.code.as_str(), err.description),
                };
                self.connection.send_or_buffer(response);
            }
            OcppFrame::CallResult { unique_id, payload } => {
                self.registry.complete(&unique_id, payload);
            }
            OcppFrame::CallError { unique_id, error_code, error_description, error_details } => {
                let code = parse_error_code(&error_code);
                self.registry
                    .fail(&unique_id, OcppError::new(code, error_description).with_details(error_details));
            }
        }
    }

    async fn apply_effect(&mut self, effect: DispatchEffect) {
        match effect {
            DispatchEffect::ClearCache => {}
            DispatchEffect::Reset { hard } => {
                warn!(station_id = self.identity.station_id.as_str(), hard, "reset requested");
                self.registry.cancel_all();
            }
            DispatchEffect::UnlockConnector { connector_id } => {
                if let Some(c) = self.connectors.get_mut(&connector_id) {
                    c.clear_transaction();
                    c.status = ConnectorStatus::Available;
                }
            }
            DispatchEffect::ChangeAvailability { connector_id, availability } => {
                if let Some(c) = self.connectors.get_mut(&connector_id) {
                    c.request_availability(availability);
                }
            }
            DispatchEffect::RemoteStartTransaction { connector_id, id_tag } => {
                if let Some(id) = connector_id.or_else(|| self.connectors.keys().find(|k| **k != 0).copied()) {
                    if let Some(c) = self.connectors.get_mut(&id) {
                        c.status = ConnectorStatus::Preparing;
                    }
                    let timeout_secs: u64 = self
                        .configuration
                        .get_or_default("StartTransactionTimeOut", &DEFAULT_START_TRANSACTION_TIMEOUT_SECS.to_string())
                        .parse()
                        .unwrap_or(DEFAULT_START_TRANSACTION_TIMEOUT_SECS);
                    self.pending_remote_starts.push((Instant::now() + Duration::from_secs(timeout_secs), id, id_tag));
                }
            }
            DispatchEffect::RemoteStopTransaction { transaction_id } => {
                let _ = self.send_stop_transaction(transaction_id).await;
            }
            DispatchEffect::GetDiagnostics => {}
            DispatchEffect::TriggerMessage { requested_message, connector_id } => {
                let connector_id = connector_id.unwrap_or(0);
                match requested_message.as_str() {
                    "Heartbeat" => {
                        let _ = outgoing::request(
                            &self.registry,
                            &mut self.connection,
                            action::HEARTBEAT,
                            outgoing::heartbeat_payload(),
                            RequestOptions::default(),
                        )
                        .await;
                    }
                    "StatusNotification" => {
                        if let Some(c) = self.connectors.get(&connector_id) {
                            let status = c.status.as_str().to_string();
                            let _ = outgoing::request(
                                &self.registry,
                                &mut self.connection,
                                action::STATUS_NOTIFICATION,
                                outgoing::status_notification_payload(connector_id, &status, "NoError"),
                                RequestOptions::default(),
                            )
                            .await;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.lifecycle != LifecycleState::Running {
            return;
        }
        if self.connection.retries_exhausted() {
            error!(station_id = self.identity.station_id.as_str(), "reconnect attempts exhausted");
            return;
        }
        let delay = self.connection.reconnect_delay();
        self.next_reconnect_at = Some(Instant::now() + delay);
        self.connection.note_retry();
    }

    async fn handle_tick(&mut self, events_rx: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>) {
        self.registry.sweep(Instant::now());

        if self.lifecycle == LifecycleState::Running
            && self.connection.state() == ConnectionState::Disconnected
        {
            if let Some(at) = self.next_reconnect_at {
                if Instant::now() >= at {
                    match self.connection.connect().await {
                        Ok(rx) => {
                            *events_rx = Some(rx);
                            self.next_reconnect_at = None;
                            if matches!(self.boot_state, BootState::NotBooted | BootState::Pending { .. } | BootState::Rejected) {
                                let _ = self.send_boot_notification().await;
                            }
                        }
                        Err(e) => {
                            warn!(station_id = self.identity.station_id.as_str(), error = %e, "connect failed");
                            self.schedule_reconnect();
                        }
                    }
                }
            }
        }

        // Heartbeats only once boot has been accepted (no keep-alive traffic
        // before the supervision server has acknowledged the station).
        if let BootState::Accepted { interval_secs } = self.boot_state {
            let due = self
                .last_heartbeat_at
                .map(|t| t.elapsed() >= Duration::from_secs(interval_secs))
                .unwrap_or(true);
            if due && self.connection.state() == ConnectionState::Connected {
                self.last_heartbeat_at = Some(Instant::now());
                let _ = outgoing::request(
                    &self.registry,
                    &mut self.connection,
                    action::HEARTBEAT,
                    outgoing::heartbeat_payload(),
                    RequestOptions::default(),
                )
                .await;
            }
        }

        if matches!(self.boot_state, BootState::Accepted { .. }) {
            self.fire_due_remote_starts().await;
            self.tick_meter_values().await;
            self.tick_atgs().await;
        }
    }

    /// Fire any `RemoteStartTransaction` accepted earlier whose
    /// `StartTransactionTimeOut` delay has elapsed (spec.md §4.4, scenario 2).
    async fn fire_due_remote_starts(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.pending_remote_starts.retain(|(fire_at, connector_id, id_tag)| {
            if *fire_at <= now {
                due.push((*connector_id, id_tag.clone()));
                false
            } else {
                true
            }
        });
        for (connector_id, id_tag) in due {
            let _ = self.send_start_transaction(connector_id, &id_tag).await;
        }
    }

    /// Periodic MeterValues sampling on every connector with an active
    /// transaction, cadenced by `MeterValueSampleInterval` (spec.md §4.7).
    async fn tick_meter_values(&mut self) {
        if self.connection.state() != ConnectionState::Connected {
            return;
        }
        let interval_secs: u64 = self
            .configuration
            .get_or_default("MeterValueSampleInterval", &DEFAULT_METER_VALUES_INTERVAL_SECS.to_string())
            .parse()
            .unwrap_or(DEFAULT_METER_VALUES_INTERVAL_SECS);
        let due = self
            .last_meter_values_at
            .map(|t| t.elapsed() >= Duration::from_secs(interval_secs))
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_meter_values_at = Some(Instant::now());
        let connector_ids: Vec<u32> = self
            .connectors
            .values()
            .filter(|c| c.has_active_transaction())
            .map(|c| c.id)
            .collect();
        for connector_id in connector_ids {
            let _ = self.send_periodic_meter_sample(connector_id, interval_secs).await;
        }
    }

    async fn send_periodic_meter_sample(&mut self, connector_id: u32, interval_secs: u64) -> Result<Value, RequestFailure> {
        let max_increment_wh = (ASSUMED_MAX_POWER_W * interval_secs as f64 / 3_600.0).max(1.0);
        let increment = rand::thread_rng().gen_range(0.0..=max_increment_wh) as i64;
        let (transaction_id, total_wh) = match self.connectors.get_mut(&connector_id) {
            Some(c) => {
                let new_total = c.energy_active_import_register_value + increment;
                c.record_energy_sample(new_total);
                (c.transaction_id, c.energy_active_import_register_value)
            }
            None => return Err(RequestFailure::Canceled),
        };
        let sample = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "sampledValue": [{
                "value": total_wh.to_string(),
                "measurand": "Energy.Active.Import.Register",
                "unit": "Wh",
                "context": "Sample.Periodic",
                "location": "Outlet",
            }],
        });
        outgoing::request(
            &self.registry,
            &mut self.connection,
            action::METER_VALUES,
            outgoing::meter_values_payload(connector_id, transaction_id, sample),
            RequestOptions::default(),
        )
        .await
    }

    async fn tick_atgs(&mut self) {
        let connector_ids: Vec<u32> = self.atgs.keys().copied().collect();
        for connector_id in connector_ids {
            let available = self
                .connectors
                .get(&connector_id)
                .map(|c| c.status == ConnectorStatus::Available && c.availability == Availability::Operative)
                .unwrap_or(false);
            let require_authorize = self.atgs.get(&connector_id).map(|a| a.require_authorize()).unwrap_or(false);
            let tick = match self.atgs.get_mut(&connector_id) {
                Some(atg) => atg.tick(Instant::now(), available),
                None => continue,
            };
            match tick {
                AtgTick::None | AtgTick::Skipped => {}
                AtgTick::Start => {
                    let id_tag = self
                        .id_tags
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "SIMULATED_TAG".to_string());
                    let mut accepted = true;
                    if require_authorize {
                        let outcome = outgoing::request(
                            &self.registry,
                            &mut self.connection,
                            action::AUTHORIZE,
                            outgoing::authorize_payload(&id_tag),
                            RequestOptions::default(),
                        )
                        .await;
                        accepted = matches!(
                            outcome.as_ref().ok().and_then(|v| v.get("idTagInfo")).and_then(|v| v.get("status")).and_then(|v| v.as_str()),
                            Some("Accepted")
                        );
                        if let Some(atg) = self.atgs.get_mut(&connector_id) {
                            atg.record_authorize(accepted);
                        }
                    }
                    if accepted {
                        let result = self.send_start_transaction(connector_id, &id_tag).await;
                        let accepted = result.is_ok();
                        if let Some(atg) = self.atgs.get_mut(&connector_id) {
                            atg.record_started(Instant::now(), accepted);
                        }
                    } else if let Some(atg) = self.atgs.get_mut(&connector_id) {
                        atg.record_started(Instant::now(), false);
                    }
                }
                AtgTick::Stop => {
                    if let Some(tx_id) = self.connectors.get(&connector_id).and_then(|c| c.transaction_id) {
                        let result = self.send_stop_transaction(tx_id).await;
                        let accepted = result.is_ok();
                        if let Some(atg) = self.atgs.get_mut(&connector_id) {
                            atg.record_stopped(Instant::now(), accepted);
                        }
                    }
                }
            }
        }
    }
}

fn parse_error_code(code: &str) -> OcppErrorCode {
    match code {
        "GenericError" => OcppErrorCode::GenericError,
        "InternalError" => OcppErrorCode::InternalError,
        "NotImplemented" => OcppErrorCode::NotImplemented,
        "NotSupported" => OcppErrorCode::NotSupported,
        "ProtocolError" => OcppErrorCode::ProtocolError,
        "SecurityError" => OcppErrorCode::SecurityError,
        "FormationViolation" => OcppErrorCode::FormationViolation,
        "PropertyConstraintViolation" => OcppErrorCode::PropertyConstraintViolation,
        "OccurrenceConstraintViolation" => OcppErrorCode::OccurrenceConstraintViolation,
        "TypeConstraintViolation" => OcppErrorCode::TypeConstraintViolation,
        _ => OcppErrorCode::GenericError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_code_defaults_to_generic() {
        assert!(matches!(parse_error_code("Whatever"), OcppErrorCode::GenericError));
        assert!(matches!(parse_error_code("NotImplemented"), OcppErrorCode::NotImplemented));
    }
}
