//! Outgoing service (C6): builds OCPP requests, registers them in C2,
//! hands them to the connection manager (which sends or buffers in C3),
//! and awaits the correlated response.
//!
//! Follows the usual register-then-await-oneshot shape for a correlated
//! outbound call (register -> serialize -> send -> await with timeout),
//! extended with the `skipBufferingOnError` fast-fail spec.md §4.4 adds.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::registry::{RequestFailure, RequestOutcome, RequestRegistry, DEFAULT_SOCKET_TIMEOUT};
use crate::support::ocpp_frame::OcppFrame;

pub mod action {
    pub const BOOT_NOTIFICATION: &str = "BootNotification";
    pub const HEARTBEAT: &str = "Heartbeat";
    pub const STATUS_NOTIFICATION: &str = "StatusNotification";
    pub const AUTHORIZE: &str = "Authorize";
    pub const START_TRANSACTION: &str = "StartTransaction";
    pub const STOP_TRANSACTION: &str = "StopTransaction";
    pub const METER_VALUES: &str = "MeterValues";
    pub const DIAGNOSTICS_STATUS_NOTIFICATION: &str = "DiagnosticsStatusNotification";
    pub const FIRMWARE_STATUS_NOTIFICATION: &str = "FirmwareStatusNotification";
    pub const DATA_TRANSFER: &str = "DataTransfer";
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    /// If the connection is down, fail immediately instead of parking the
    /// frame in the outbound buffer (spec.md §4.4 step 3).
    pub skip_buffering_on_error: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SOCKET_TIMEOUT,
            skip_buffering_on_error: false,
        }
    }
}

/// Send an OCPP CALL and await its correlated response (spec.md §4.4).
pub async fn request(
    registry: &RequestRegistry,
    connection: &mut ConnectionManager,
    command: &str,
    payload: Value,
    opts: RequestOptions,
) -> RequestOutcome {
    if opts.skip_buffering_on_error && connection.state() != ConnectionState::Connected {
        return Err(RequestFailure::NotConnected);
    }

    let mut message_id = Uuid::new_v4().to_string();
    let deadline = Instant::now() + opts.timeout;
    let mut rx = registry.register(&message_id, command, deadline);
    // UUIDv4 collisions are practically impossible; retry once defensively
    // rather than failing the caller outright.
    if rx.is_err() {
        message_id = Uuid::new_v4().to_string();
        rx = registry.register(&message_id, command, deadline);
    }
    let rx = match rx {
        Ok(rx) => rx,
        Err(_) => return Err(RequestFailure::Canceled),
    };

    let frame = OcppFrame::Call {
        unique_id: message_id,
        action: command.to_string(),
        payload,
    };
    connection.send_or_buffer(frame);

    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(RequestFailure::Canceled),
    }
}

// ── Payload builders (spec.md §4.4/§6 procedure catalogue) ──────────────

pub fn boot_notification_payload(
    vendor: &str,
    model: &str,
    serial_number: Option<&str>,
    firmware_version: Option<&str>,
    meter_type: Option<&str>,
    meter_serial_number: Option<&str>,
) -> Value {
    let mut payload = json!({
        "chargePointVendor": vendor,
        "chargePointModel": model,
    });
    let obj = payload.as_object_mut().unwrap();
    if let Some(v) = serial_number {
        obj.insert("chargePointSerialNumber".into(), json!(v));
    }
    if let Some(v) = firmware_version {
        obj.insert("firmwareVersion".into(), json!(v));
    }
    if let Some(v) = meter_type {
        obj.insert("meterType".into(), json!(v));
    }
    if let Some(v) = meter_serial_number {
        obj.insert("meterSerialNumber".into(), json!(v));
    }
    payload
}

pub fn heartbeat_payload() -> Value {
    json!({})
}

pub fn status_notification_payload(connector_id: u32, status: &str, error_code: &str) -> Value {
    json!({
        "connectorId": connector_id,
        "status": status,
        "errorCode": error_code,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub fn authorize_payload(id_tag: &str) -> Value {
    json!({ "idTag": id_tag })
}

pub fn start_transaction_payload(
    connector_id: u32,
    id_tag: &str,
    meter_start: i64,
    timestamp: DateTime<Utc>,
    reservation_id: Option<i64>,
) -> Value {
    let mut payload = json!({
        "connectorId": connector_id,
        "idTag": id_tag,
        "meterStart": meter_start,
        "timestamp": timestamp.to_rfc3339(),
    });
    if let Some(r) = reservation_id {
        payload
            .as_object_mut()
            .unwrap()
            .insert("reservationId".into(), json!(r));
    }
    payload
}

pub fn stop_transaction_payload(
    transaction_id: i64,
    id_tag: Option<&str>,
    meter_stop: i64,
    timestamp: DateTime<Utc>,
    reason: Option<&str>,
) -> Value {
    let mut payload = json!({
        "transactionId": transaction_id,
        "meterStop": meter_stop,
        "timestamp": timestamp.to_rfc3339(),
    });
    let obj = payload.as_object_mut().unwrap();
    if let Some(t) = id_tag {
        obj.insert("idTag".into(), json!(t));
    }
    if let Some(r) = reason {
        obj.insert("reason".into(), json!(r));
    }
    payload
}

pub fn meter_values_payload(connector_id: u32, transaction_id: Option<i64>, meter_value: Value) -> Value {
    let mut payload = json!({
        "connectorId": connector_id,
        "meterValue": [meter_value],
    });
    if let Some(id) = transaction_id {
        payload
            .as_object_mut()
            .unwrap()
            .insert("transactionId".into(), json!(id));
    }
    payload
}

pub fn diagnostics_status_notification_payload(status: &str) -> Value {
    json!({ "status": status })
}

pub fn firmware_status_notification_payload(status: &str) -> Value {
    json!({ "status": status })
}

pub fn data_transfer_payload(vendor_id: &str, message_id: Option<&str>, data: Option<&str>) -> Value {
    let mut payload = json!({ "vendorId": vendor_id });
    let obj = payload.as_object_mut().unwrap();
    if let Some(m) = message_id {
        obj.insert("messageId".into(), json!(m));
    }
    if let Some(d) = data {
        obj.insert("data".into(), json!(d));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_notification_includes_optional_fields_when_present() {
        let payload = boot_notification_payload("Vendor", "Model", Some("SN1"), None, None, None);
        assert_eq!(payload["chargePointVendor"], "Vendor");
        assert_eq!(payload["chargePointSerialNumber"], "SN1");
        assert!(payload.get("firmwareVersion").is_none());
    }

    #[test]
    fn start_transaction_omits_reservation_when_absent() {
        let payload = start_transaction_payload(1, "TAG1", 0, Utc::now(), None);
        assert!(payload.get("reservationId").is_none());
    }

    #[test]
    fn stop_transaction_includes_reason_when_present() {
        let payload = stop_transaction_payload(42, Some("TAG1"), 500, Utc::now(), Some("Local"));
        assert_eq!(payload["reason"], "Local");
    }
}
