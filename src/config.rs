//! Configuration loading (ambient stack, C12).
//!
//! TOML-driven: parse a file into a `serde`-derived struct, falling back
//! to defaults (and a logged error) when the file is missing or malformed.
//! A top-level parse failure is fatal to the whole process (spec.md §6
//! exit codes); a single station template failing to parse only drops
//! that template's stations.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// `supervisionUrls` distribution policy (spec.md §4.9/§6).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisionUrlDistribution {
    RoundRobin,
    Random,
    ChargingStationAffinity,
}

impl Default for SupervisionUrlDistribution {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UiServerType {
    Http,
    Ws,
}

impl Default for UiServerType {
    fn default() -> Self {
        Self::Ws
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthenticationType {
    BasicAuth,
    ProtocolBasicAuth,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_auth_type")]
    pub r#type: AuthenticationType,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_auth_type() -> AuthenticationType {
    AuthenticationType::BasicAuth
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            r#type: default_auth_type(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiServerOptions {
    #[serde(default = "default_ui_host")]
    pub host: String,
    #[serde(default = "default_ui_port")]
    pub port: u16,
}

fn default_ui_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ui_port() -> u16 {
    8010
}

impl Default for UiServerOptions {
    fn default() -> Self {
        Self {
            host: default_ui_host(),
            port: default_ui_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub r#type: UiServerType,
    #[serde(default)]
    pub options: UiServerOptions,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
    /// Fixed-window rate limit: max requests per window per client IP.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Body size limit in bytes for HTTP requests.
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
    /// Aggregation timeout for fan-out replies, in milliseconds.
    #[serde(default = "default_aggregation_timeout_ms")]
    pub aggregation_timeout_ms: u64,
}

fn default_rate_limit_max() -> u32 {
    100
}
fn default_rate_limit_window_ms() -> u64 {
    1000
}
fn default_body_limit_bytes() -> usize {
    1024 * 1024
}
fn default_aggregation_timeout_ms() -> u64 {
    10_000
}

impl Default for UiServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            r#type: UiServerType::default(),
            options: UiServerOptions::default(),
            authentication: AuthenticationConfig::default(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            body_limit_bytes: default_body_limit_bytes(),
            aggregation_timeout_ms: default_aggregation_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: true,
        }
    }
}

/// One entry of `stationTemplateUrls`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StationTemplateRef {
    pub file: PathBuf,
    #[serde(default = "default_number_of_stations")]
    pub number_of_stations: u32,
}

fn default_number_of_stations() -> u32 {
    1
}

/// Top-level simulator configuration (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatorConfig {
    #[serde(default, alias = "supervisionUrl")]
    pub supervision_urls: Vec<String>,
    #[serde(default)]
    pub supervision_url_distribution: SupervisionUrlDistribution,
    pub station_template_urls: Vec<StationTemplateRef>,
    #[serde(default)]
    pub ui_server: UiServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            supervision_urls: vec!["ws://localhost:8180/ocpp".to_string()],
            supervision_url_distribution: SupervisionUrlDistribution::default(),
            station_template_urls: Vec::new(),
            ui_server: UiServerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Load from a TOML file. A parse/read failure is returned so the
    /// caller can decide whether it is fatal (top-level config is fatal
    /// per spec.md §6 exit codes; callers loading a single station
    /// template should log and skip instead).
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path).map_err(SimError::Io)?;
        toml::from_str(&text).map_err(|e| SimError::Config(e.to_string()))
    }
}

/// Default config path, following the `~/.config/<app>/config.toml`
/// convention (`dirs-next`).
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-station-sim")
        .join("config.toml")
}

// ── Station template (file-driven, one per `stationTemplateUrls` entry) ──

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigurationKeyTemplate {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConnectorTemplate {
    #[serde(default)]
    pub boot_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutomaticTransactionGeneratorTemplate {
    #[serde(default)]
    pub enable: bool,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    pub min_delay_between_two_transactions_secs: u64,
    pub max_delay_between_two_transactions_secs: u64,
    pub probability_of_start: f64,
    pub stop_after_hours: f64,
    #[serde(default)]
    pub stop_on_connection_failure: bool,
    #[serde(default = "default_true")]
    pub require_authorize: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StationTemplate {
    pub base_name: String,
    #[serde(default)]
    pub fixed_name: Option<String>,
    pub vendor: String,
    pub model: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub meter_type: Option<String>,
    #[serde(default)]
    pub meter_serial_number: Option<String>,
    #[serde(default = "default_num_connectors")]
    pub num_connectors: u32,
    #[serde(default)]
    pub configuration_key: Vec<ConfigurationKeyTemplate>,
    #[serde(default)]
    pub connectors: std::collections::HashMap<u32, ConnectorTemplate>,
    #[serde(default)]
    pub automatic_transaction_generator: Option<AutomaticTransactionGeneratorTemplate>,
    #[serde(default)]
    pub id_tags: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_register: bool,
}

fn default_num_connectors() -> u32 {
    1
}

impl StationTemplate {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path).map_err(SimError::Io)?;
        toml::from_str(&text).map_err(|e| SimError::Config(e.to_string()))
    }

    /// Derive a station-id from `baseName` and a zero-padded 4-digit
    /// suffix, or use `fixedName` verbatim (spec.md §4.9).
    pub fn derive_station_id(&self, index: u32) -> String {
        match &self.fixed_name {
            Some(name) => name.clone(),
            None => format!("{}{:04}", self.base_name, index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml_text = r#"
            station_template_urls = []
        "#;
        let cfg: SimulatorConfig = toml::from_str(toml_text).unwrap();
        assert!(cfg.station_template_urls.is_empty());
        assert_eq!(
            cfg.supervision_url_distribution,
            SupervisionUrlDistribution::RoundRobin
        );
    }

    #[test]
    fn derives_station_id_with_zero_padded_suffix() {
        let template = StationTemplate {
            base_name: "CS-".into(),
            fixed_name: None,
            vendor: "V".into(),
            model: "M".into(),
            serial_number: None,
            firmware_version: None,
            meter_type: None,
            meter_serial_number: None,
            num_connectors: 1,
            configuration_key: vec![],
            connectors: Default::default(),
            automatic_transaction_generator: None,
            id_tags: vec![],
            auto_register: true,
        };
        assert_eq!(template.derive_station_id(7), "CS-0007");
    }

    #[test]
    fn fixed_name_used_verbatim() {
        let mut template = StationTemplate {
            base_name: "CS-".into(),
            fixed_name: Some("FIXED-ID".into()),
            vendor: "V".into(),
            model: "M".into(),
            serial_number: None,
            firmware_version: None,
            meter_type: None,
            meter_serial_number: None,
            num_connectors: 1,
            configuration_key: vec![],
            connectors: Default::default(),
            automatic_transaction_generator: None,
            id_tags: vec![],
            auto_register: true,
        };
        assert_eq!(template.derive_station_id(3), "FIXED-ID");
        template.fixed_name = None;
        assert_eq!(template.derive_station_id(3), "CS-0003");
    }
}
