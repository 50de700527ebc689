//! HTTP transport for the control plane: one `POST` endpoint per procedure
//! call, status-coded the way spec.md §6 describes (SUCCESS -> 200,
//! FAILURE -> 400, unrecognized procedure -> 404).
//!
//! Rate limiting runs as a `FixedWindowLimiter` call inside the handler
//! rather than a tower layer, and authentication is a plain
//! `auth::verify_basic_auth` check against the configured credential.
//! Request bodies may be gzip-compressed (`Content-Encoding: gzip`), and
//! responses are gzipped back when the client advertises `Accept-Encoding:
//! gzip` and the body clears a size threshold (spec.md §6).

use std::io::Read;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::ControlPlaneError;

use super::{auth, dispatch_procedure, ControlPlaneState};

/// Responses at or above this size are gzipped when the client accepts it.
const GZIP_RESPONSE_THRESHOLD_BYTES: usize = 1024;

pub fn router(state: ControlPlaneState) -> Router {
    Router::new()
        .route("/ui/{version}/{procedure_name}", post(handle_procedure))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::permissive()
}

fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false)
}

fn json_response(headers: &HeaderMap, status: StatusCode, payload: &Value) -> Response {
    let body = serde_json::to_vec(payload).unwrap_or_default();
    if accepts_gzip(headers) && body.len() >= GZIP_RESPONSE_THRESHOLD_BYTES {
        let mut encoder = GzEncoder::new(&body[..], Compression::default());
        let mut compressed = Vec::new();
        if encoder.read_to_end(&mut compressed).is_ok() {
            return (
                status,
                [
                    (axum::http::header::CONTENT_ENCODING, "gzip"),
                    (axum::http::header::CONTENT_TYPE, "application/json"),
                ],
                compressed,
            )
                .into_response();
        }
    }
    (status, Json(payload.clone())).into_response()
}

async fn handle_procedure(
    State(state): State<ControlPlaneState>,
    Path((_version, procedure_name)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if body.len() > state.config.body_limit_bytes {
        return json_response(
            &headers,
            StatusCode::PAYLOAD_TOO_LARGE,
            &json!({"status": "failure", "error": "request body exceeds configured limit"}),
        );
    }

    if state.config.authentication.enabled {
        let authorized = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| auth::verify_basic_auth(v, &state.config.authentication))
            .unwrap_or(false);
        if !authorized {
            return json_response(&headers, StatusCode::UNAUTHORIZED, &json!({"status": "failure", "error": "unauthorized"}));
        }
    }

    if let Some(retry_after_ms) = state.limiter.check(&addr.ip().to_string()) {
        let err = ControlPlaneError::RateLimited { retry_after_ms };
        let mut response = json_response(
            &headers,
            StatusCode::TOO_MANY_REQUESTS,
            &json!({"status": "failure", "error": err.to_string(), "retryAfterMs": retry_after_ms}),
        );
        let retry_after_secs = (retry_after_ms / 1000).max(1).to_string();
        if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs) {
            response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
        }
        return response;
    }

    let decoded = if is_gzip_encoded(&headers) {
        let mut decoder = GzDecoder::new(&body[..]);
        let mut out = Vec::new();
        match decoder.read_to_end(&mut out) {
            Ok(_) => out,
            Err(e) => {
                warn!(error = %e, "failed to gzip-decode request body");
                return json_response(&headers, StatusCode::BAD_REQUEST, &json!({"status": "failure", "error": "malformed gzip body"}));
            }
        }
    } else {
        body.to_vec()
    };
    if decoded.len() > state.config.body_limit_bytes {
        return json_response(
            &headers,
            StatusCode::PAYLOAD_TOO_LARGE,
            &json!({"status": "failure", "error": "decompressed body exceeds configured limit"}),
        );
    }

    let payload: Value = if decoded.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&decoded) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed request body");
                return json_response(&headers, StatusCode::BAD_REQUEST, &json!({"status": "failure", "error": "malformed JSON body"}));
            }
        }
    };

    let result = dispatch_procedure(&state, &procedure_name, payload).await;
    let status = if result.success { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    json_response(&headers, status, &result.payload)
}
