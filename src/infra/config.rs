//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::io::radio::{CHARACTERISTIC_UUID, DEVICE_NAME, SERVICE_UUID};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSource {
    /// JSON lines over a TCP listener
    Tcp,
    /// NMEA 0183 GPS receiver on a serial port
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioBackend {
    /// In-process simulated peripheral
    Sim,
    /// Bluetooth LE central (requires the `ble` feature)
    Ble,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_route_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// "lat,lon" or free-text place
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "default_route_timeout_ms")]
    pub timeout_ms: u64,
    /// Seconds between route re-fetches (0 = fetch once)
    #[serde(default = "default_route_refresh_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            base_url: default_route_base_url(),
            api_key: None,
            destination: None,
            timeout_ms: default_route_timeout_ms(),
            refresh_interval_secs: default_route_refresh_secs(),
        }
    }
}

fn default_route_base_url() -> String {
    "https://api.olamaps.io/routing/v1/directions".to_string()
}

fn default_route_timeout_ms() -> u64 {
    10_000
}

fn default_route_refresh_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_threshold_m")]
    pub threshold_m: f64,
    /// Suppress re-sending the step that fired last
    #[serde(default)]
    pub dedupe_repeats: bool,
    /// Fixes older than this are ignored (0 = never stale)
    #[serde(default = "default_max_fix_age_secs")]
    pub max_fix_age_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_dispatch_interval_secs(),
            threshold_m: default_threshold_m(),
            dedupe_repeats: false,
            max_fix_age_secs: default_max_fix_age_secs(),
        }
    }
}

fn default_dispatch_interval_secs() -> u64 {
    5
}

fn default_threshold_m() -> f64 {
    50.0
}

fn default_max_fix_age_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionConfig {
    #[serde(default = "default_position_source")]
    pub source: PositionSource,
    #[serde(default = "default_position_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_serial_device")]
    pub serial_device: String,
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            source: default_position_source(),
            tcp_port: default_position_tcp_port(),
            serial_device: default_serial_device(),
            serial_baud: default_serial_baud(),
        }
    }
}

fn default_position_source() -> PositionSource {
    PositionSource::Tcp
}

fn default_position_tcp_port() -> u16 {
    5600
}

fn default_serial_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_serial_baud() -> u32 {
    9600
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeripheralConfig {
    #[serde(default = "default_radio_backend")]
    pub backend: RadioBackend,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: Uuid,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on each write and read-back
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_max_write_failures")]
    pub max_write_failures: u32,
    #[serde(default = "default_max_discovery_attempts")]
    pub max_discovery_attempts_per_minute: u32,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            backend: default_radio_backend(),
            device_name: default_device_name(),
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            scan_timeout_ms: default_scan_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            max_write_failures: default_max_write_failures(),
            max_discovery_attempts_per_minute: default_max_discovery_attempts(),
        }
    }
}

fn default_radio_backend() -> RadioBackend {
    RadioBackend::Sim
}

fn default_device_name() -> String {
    DEVICE_NAME.to_string()
}

fn default_service_uuid() -> Uuid {
    SERVICE_UUID
}

fn default_characteristic_uuid() -> Uuid {
    CHARACTERISTIC_UUID
}

fn default_scan_timeout_ms() -> u64 {
    15_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_io_timeout_ms() -> u64 {
    5_000
}

fn default_max_write_failures() -> u32 {
    3
}

fn default_max_discovery_attempts() -> u32 {
    6
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9100
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub position: PositionConfig,
    #[serde(default)]
    pub peripheral: PeripheralConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    route_base_url: String,
    route_api_key: Option<String>,
    destination: Option<String>,
    route_timeout_ms: u64,
    route_refresh_interval_secs: u64,
    dispatch_interval_secs: u64,
    threshold_m: f64,
    dedupe_repeats: bool,
    max_fix_age_secs: u64,
    position_source: PositionSource,
    position_tcp_port: u16,
    serial_device: String,
    serial_baud: u32,
    radio_backend: RadioBackend,
    device_name: String,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    scan_timeout_ms: u64,
    connect_timeout_ms: u64,
    io_timeout_ms: u64,
    max_write_failures: u32,
    max_discovery_attempts_per_minute: u32,
    metrics_interval_secs: u64,
    prometheus_port: u16,
}

const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

fn pick_config_path(cli: Option<&str>, env_path: Option<String>) -> String {
    match (cli, env_path) {
        (Some(path), _) => path.to_string(),
        (None, Some(path)) if !path.is_empty() => path,
        _ => DEFAULT_CONFIG_PATH.to_string(),
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults come from the same functions serde uses for missing keys
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    /// Config file path: the `--config` value if given, else `CONFIG_FILE`, else the default
    pub fn resolve_config_path(cli: Option<&str>) -> String {
        pick_config_path(cli, env::var("CONFIG_FILE").ok())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file {}", source))?;
        let threshold = toml_config.dispatch.threshold_m;
        if !(threshold.is_finite() && threshold > 0.0) {
            anyhow::bail!("dispatch.threshold_m must be a positive number in {}", source);
        }
        Ok(Self::from_toml(toml_config, source))
    }

    fn from_toml(toml_config: TomlConfig, source: &str) -> Self {
        let TomlConfig { route, dispatch, position, peripheral, metrics } = toml_config;

        Self {
            config_file: source.to_string(),
            route_base_url: route.base_url,
            route_api_key: route.api_key,
            destination: route.destination.filter(|d| !d.trim().is_empty()),
            route_timeout_ms: route.timeout_ms,
            route_refresh_interval_secs: route.refresh_interval_secs,
            // A zero cadence would spin the dispatcher
            dispatch_interval_secs: dispatch.interval_secs.max(1),
            threshold_m: dispatch.threshold_m,
            dedupe_repeats: dispatch.dedupe_repeats,
            max_fix_age_secs: dispatch.max_fix_age_secs,
            position_source: position.source,
            position_tcp_port: position.tcp_port,
            serial_device: position.serial_device,
            serial_baud: position.serial_baud,
            radio_backend: peripheral.backend,
            device_name: peripheral.device_name,
            service_uuid: peripheral.service_uuid,
            characteristic_uuid: peripheral.characteristic_uuid,
            scan_timeout_ms: peripheral.scan_timeout_ms,
            connect_timeout_ms: peripheral.connect_timeout_ms,
            io_timeout_ms: peripheral.io_timeout_ms,
            max_write_failures: peripheral.max_write_failures.max(1),
            max_discovery_attempts_per_minute: peripheral.max_discovery_attempts_per_minute,
            metrics_interval_secs: metrics.interval_secs.max(1),
            prometheus_port: metrics.prometheus_port,
        }
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from the `--config` value / environment
    pub fn load(cli: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(cli))
    }

    /// Override the configured destination (CLI flag)
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        let destination = destination.into();
        self.destination = if destination.trim().is_empty() { None } else { Some(destination) };
        self
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn route_base_url(&self) -> &str {
        &self.route_base_url
    }

    pub fn route_api_key(&self) -> Option<&str> {
        self.route_api_key.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn route_timeout_ms(&self) -> u64 {
        self.route_timeout_ms
    }

    pub fn route_refresh_interval_secs(&self) -> u64 {
        self.route_refresh_interval_secs
    }

    pub fn dispatch_interval_secs(&self) -> u64 {
        self.dispatch_interval_secs
    }

    pub fn threshold_m(&self) -> f64 {
        self.threshold_m
    }

    pub fn dedupe_repeats(&self) -> bool {
        self.dedupe_repeats
    }

    pub fn max_fix_age_secs(&self) -> u64 {
        self.max_fix_age_secs
    }

    pub fn position_source(&self) -> PositionSource {
        self.position_source
    }

    pub fn position_tcp_port(&self) -> u16 {
        self.position_tcp_port
    }

    pub fn serial_device(&self) -> &str {
        &self.serial_device
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial_baud
    }

    pub fn radio_backend(&self) -> RadioBackend {
        self.radio_backend
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    pub fn scan_timeout_ms(&self) -> u64 {
        self.scan_timeout_ms
    }

    pub fn connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms
    }

    pub fn io_timeout_ms(&self) -> u64 {
        self.io_timeout_ms
    }

    pub fn max_write_failures(&self) -> u32 {
        self.max_write_failures
    }

    pub fn max_discovery_attempts_per_minute(&self) -> u32 {
        self.max_discovery_attempts_per_minute
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    /// Builder method for tests to enable the repeat guard
    #[cfg(test)]
    pub fn with_dedupe_repeats(mut self, enabled: bool) -> Self {
        self.dedupe_repeats = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dispatch_interval_secs(), 5);
        assert_eq!(config.threshold_m(), 50.0);
        assert!(!config.dedupe_repeats());
        assert_eq!(config.device_name(), "ESP32_BLE");
        assert_eq!(
            config.service_uuid().to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            config.characteristic_uuid().to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert_eq!(config.position_source(), PositionSource::Tcp);
        assert_eq!(config.radio_backend(), RadioBackend::Sim);
        assert_eq!(config.destination(), None);
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml_str("", "inline").unwrap();
        assert_eq!(config.dispatch_interval_secs(), 5);
        assert_eq!(config.max_write_failures(), 3);
        assert_eq!(config.prometheus_port(), 9100);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
[dispatch]
threshold_m = 75.5
dedupe_repeats = true

[route]
destination = "12.9352,77.6245"
"#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.threshold_m(), 75.5);
        assert!(config.dedupe_repeats());
        assert_eq!(config.dispatch_interval_secs(), 5);
        assert_eq!(config.destination(), Some("12.9352,77.6245"));
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        let result = Config::from_toml_str(
            r#"
[peripheral]
service_uuid = "not-a-uuid"
"#,
            "inline",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let result = Config::from_toml_str("[dispatch]\nthreshold_m = -1.0\n", "inline");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_interval_clamped() {
        let config = Config::from_toml_str("[dispatch]\ninterval_secs = 0\n", "inline").unwrap();
        assert_eq!(config.dispatch_interval_secs(), 1);
    }

    #[test]
    fn test_with_destination_override() {
        let config = Config::default().with_destination("MG Road");
        assert_eq!(config.destination(), Some("MG Road"));
        let config = config.with_destination("  ");
        assert_eq!(config.destination(), None);
    }

    #[test]
    fn test_config_path_prefers_cli_arg() {
        assert_eq!(
            pick_config_path(Some("config/car.toml"), Some("/etc/nb.toml".to_string())),
            "config/car.toml"
        );
    }

    #[test]
    fn test_config_path_from_env() {
        assert_eq!(pick_config_path(None, Some("/etc/nb.toml".to_string())), "/etc/nb.toml");
        assert_eq!(pick_config_path(None, Some(String::new())), "config/dev.toml");
    }

    #[test]
    fn test_config_path_default() {
        assert_eq!(pick_config_path(None, None), "config/dev.toml");
    }
}
