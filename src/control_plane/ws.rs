//! WebSocket transport for the control plane: a single `/ui` socket carrying
//! `[correlationId, procedureName, payload]` calls and replying with
//! `[correlationId, responsePayload]`, per spec.md §6.
//!
//! Follows the usual axum `WebSocketUpgrade` handler shape, carrying this
//! crate's own UI envelope rather than the charge-point wire protocol.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ControlPlaneError;

use super::{auth, dispatch_procedure, ControlPlaneState};

pub fn router(state: ControlPlaneState) -> Router {
    Router::new().route("/ui", get(upgrade)).with_state(state)
}

async fn upgrade(
    mut ws: WebSocketUpgrade,
    State(state): State<ControlPlaneState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // The credential rides as the chosen subprotocol (spec.md §6
    // protocolBasicAuth); echo whatever the client offered back so the
    // handshake completes, then validate it once the socket is open.
    let subprotocol = headers
        .get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    if let Some(p) = subprotocol.clone() {
        ws = ws.protocols([p]);
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr, subprotocol))
}

async fn handle_socket(mut socket: WebSocket, state: ControlPlaneState, addr: SocketAddr, subprotocol: Option<String>) {
    if state.config.authentication.enabled {
        let authorized = subprotocol
            .map(|p| auth::verify_protocol_basic_auth(&p, &state.config.authentication))
            .unwrap_or(false);
        if !authorized {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };

        let envelope: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed UI envelope");
                continue;
            }
        };
        let Some(array) = envelope.as_array() else {
            warn!("UI envelope is not a JSON array");
            continue;
        };
        let (Some(correlation_id), Some(procedure_name), payload) = (
            array.first().and_then(|v| v.as_str()),
            array.get(1).and_then(|v| v.as_str()),
            array.get(2).cloned().unwrap_or(json!({})),
        ) else {
            warn!("UI envelope missing correlationId or procedureName");
            continue;
        };

        if let Some(retry_after_ms) = state.limiter.check(&addr.ip().to_string()) {
            let err = ControlPlaneError::RateLimited { retry_after_ms };
            let reply = json!([correlation_id, {"status": "failure", "error": err.to_string(), "retryAfterMs": retry_after_ms}]);
            if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                break;
            }
            continue;
        }

        debug!(correlation_id, procedure_name, "dispatching UI procedure call");
        let result = dispatch_procedure(&state, procedure_name, payload).await;
        let reply = json!([correlation_id, result.payload]);
        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
}
