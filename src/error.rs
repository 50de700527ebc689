//! Crate-wide error taxonomy.
//!
//! Composed via `#[from]` into domain/infra/app error layers, covering the
//! five error classes this simulator's components raise.

use serde_json::Value;
use thiserror::Error;

/// The closed set of OCPP domain error codes a CALLERROR may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcppErrorCode {
    GenericError,
    InternalError,
    NotImplemented,
    NotSupported,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
}

impl OcppErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenericError => "GenericError",
            Self::InternalError => "InternalError",
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }
}

impl std::fmt::Display for OcppErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An OCPP domain error, carried on the wire as a CALLERROR.
#[derive(Debug, Clone, Error)]
#[error("{code}: {description}")]
pub struct OcppError {
    pub code: OcppErrorCode,
    pub description: String,
    pub details: Value,
}

impl OcppError {
    pub fn new(code: OcppErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            OcppErrorCode::NotImplemented,
            format!("No handler registered for action '{}'", action),
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::InternalError, msg)
    }
}

/// Transport-layer failures: socket open failure, send failure, timeout.
/// Handled by the reconnection policy; surfaced to observers, not callers,
/// unless `skip_buffering_on_error` is set.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("request canceled")]
    Canceled,
    #[error("duplicate message id {0}")]
    DuplicateId(String),
}

/// Errors raised at the control-plane boundary. Never propagated to a
/// station supervisor: terminated and reported at the UI server.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("unknown procedure '{0}'")]
    UnknownProcedure(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("unauthorized")]
    Unauthorized,
    #[error("payload too large ({size} > {limit} bytes)")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Top-level crate error. Returned by bootstrap and the binary's `main`.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ocpp(#[from] OcppError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Io(_))
    }
}
