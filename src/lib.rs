//! # ocpp-station-sim
//!
//! Simulates a fleet of OCPP 1.6-J charging stations as WebSocket clients of
//! one or more supervision (CSMS) servers, driven by TOML station templates
//! and controllable through a UI server (HTTP or WebSocket).
//!
//! ## Layout
//!
//! - **support**: wire framing (`ocpp_frame`), `hashId` fingerprinting, shutdown coordination
//! - **error**: crate-wide error taxonomy
//! - **config**: simulator/station-template configuration (TOML-based)
//! - **connector**: per-connector state machine and charging profiles
//! - **registry**: request/response correlation and the outbound buffer
//! - **connection**: WebSocket dial, reconnect policy, socket pumps
//! - **dispatch**: inbound CALL routing to action handlers
//! - **outgoing**: outbound OCPP request construction and post-processing
//! - **atg**: automatic transaction generator
//! - **station**: per-station supervisor tying the above together
//! - **broadcast**: worker broadcast channel used by the control plane
//! - **control_plane**: UI server (HTTP + WebSocket) and fan-out aggregation
//! - **bootstrap**: process-wide startup/shutdown lifecycle

pub mod config;
pub mod connector;
pub mod error;
pub mod registry;
pub mod support;

pub mod atg;
pub mod connection;
pub mod dispatch;
pub mod outgoing;
pub mod station;

pub mod broadcast;
pub mod control_plane;

pub mod bootstrap;

pub use config::{default_config_path, SimulatorConfig, StationTemplate};
pub use error::{OcppError, OcppErrorCode, SimError};
