use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `meter.debug`.
pub const DEBUG_ENV: &str = "OBIS2MQTT_DEBUG";
/// Environment variable holding the default log filter.
pub const LOG_LEVEL_ENV: &str = "OBIS2MQTT_LOG_LEVEL";

const CONFIG_PATHS: [&str; 2] = ["config/obis2mqtt.yaml", "obis2mqtt.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on {0}")]
    NotFound(String),
    #[error("Unable to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub enum Protocol {
    #[serde(alias = "SmlProtocol")]
    Sml,
    #[serde(alias = "D0Protocol")]
    D0,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub enum Transport {
    #[serde(alias = "SerialResponseTransport")]
    SerialResponse,
    #[serde(alias = "SerialRequestResponseTransport")]
    SerialRequestResponse,
    #[serde(alias = "LocalFileTransport")]
    LocalFile,
    #[serde(alias = "TcpTransport")]
    Tcp,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub enum InputEncoding {
    #[serde(alias = "binary")]
    Binary,
    /// Hex text, one frame per line.
    #[serde(alias = "ascii")]
    Ascii,
    #[serde(alias = "base64")]
    Base64,
}

fn meter_protocol_default() -> Protocol { Protocol::Sml }
fn meter_transport_default() -> Transport { Transport::SerialResponse }
fn meter_request_interval_default() -> u64 { 10 }
fn meter_input_encoding_default() -> InputEncoding { InputEncoding::Binary }
fn meter_debug_default() -> u8 { 0 }
fn meter_fallback_medium_default() -> u8 { 1 }

/// Options handed to the measurement reader.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MeterConfig {
    /// Serial device path, file path for `LocalFile` or `host:port` for `Tcp`.
    pub serial_port: String,
    #[serde(default="meter_protocol_default")]
    pub protocol: Protocol,
    #[serde(default="meter_transport_default")]
    pub transport: Transport,
    pub baud_rate: Option<u32>,
    pub data_bits: Option<u8>,
    pub stop_bits: Option<u8>,
    pub parity: Option<Parity>,
    #[serde(default="meter_request_interval_default")]
    pub request_interval: u64,
    #[serde(default="meter_input_encoding_default")]
    pub input_encoding: InputEncoding,
    #[serde(default)]
    pub ignore_invalid_crc: bool,
    #[serde(default="meter_debug_default")]
    pub debug: u8,
    #[serde(default="meter_fallback_medium_default")]
    pub obis_fallback_medium: u8,
}

impl MeterConfig {
    pub fn new(serial_port: &str, protocol: Protocol, transport: Transport) -> Self {
        MeterConfig {
            serial_port: serial_port.to_string(),
            protocol,
            transport,
            baud_rate: None,
            data_bits: None,
            stop_bits: None,
            parity: None,
            request_interval: meter_request_interval_default(),
            input_encoding: meter_input_encoding_default(),
            ignore_invalid_crc: false,
            debug: meter_debug_default(),
            obis_fallback_medium: meter_fallback_medium_default(),
        }
    }

    /// Baud rate to open the line with; D0 meters start at 300 baud.
    pub fn effective_baud_rate(&self) -> u32 {
        match (self.baud_rate, self.protocol) {
            (Some(rate), _) => rate,
            (None, Protocol::Sml) => 9600,
            (None, Protocol::D0) => 300,
        }
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_secs(self.request_interval)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial_port.trim().is_empty() {
            return Err(ConfigError::Invalid("meter.serial_port must be set".to_string()));
        }
        if let Some(bits) = self.data_bits {
            if !(5..=8).contains(&bits) {
                return Err(ConfigError::Invalid(format!("meter.data_bits {} not in 5..=8", bits)));
            }
        }
        if let Some(bits) = self.stop_bits {
            if bits != 1 && bits != 2 {
                return Err(ConfigError::Invalid(format!("meter.stop_bits {} must be 1 or 2", bits)));
            }
        }
        if self.baud_rate == Some(0) {
            return Err(ConfigError::Invalid("meter.baud_rate must not be 0".to_string()));
        }
        if self.debug > 2 {
            return Err(ConfigError::Invalid(format!("meter.debug {} must be 0, 1 or 2", self.debug)));
        }
        if self.transport == Transport::Tcp && !self.serial_port.contains(':') {
            return Err(ConfigError::Invalid(format!("meter.serial_port {} must be host:port for Tcp", self.serial_port)));
        }
        Ok(())
    }
}

fn polling_interval_default() -> u64 { 60 }
fn polling_timeout_default() -> u64 { 30 }
fn polling_validation_timeout_default() -> u64 { 130 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PollingConfig {
    #[serde(default="polling_interval_default")]
    pub poll_interval: u64,
    #[serde(default="polling_timeout_default")]
    pub poll_timeout: u64,
    #[serde(default="polling_validation_timeout_default")]
    pub validation_timeout: u64,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration { Duration::from_secs(self.poll_interval) }
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.poll_timeout) }
    pub fn validation_timeout(&self) -> Duration { Duration::from_secs(self.validation_timeout) }
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            poll_interval: polling_interval_default(),
            poll_timeout: polling_timeout_default(),
            validation_timeout: polling_validation_timeout_default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct SensorsConfig {
    #[serde(default)]
    pub hide_power_consumption_device: bool,
    #[serde(default)]
    pub hide_power_return_device: bool,
    #[serde(default)]
    pub hide_energy_import_device: bool,
    #[serde(default)]
    pub hide_voltage_devices: bool,
}

fn history_enabled_default() -> bool { true }
fn history_path_default() -> String { "history".to_string() }
fn history_minutes_default() -> u64 { 10 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HistoryConfig {
    #[serde(default="history_enabled_default")]
    pub enabled: bool,
    #[serde(default="history_path_default")]
    pub path: String,
    #[serde(default="history_minutes_default")]
    pub minutes: u64,
}

impl HistoryConfig {
    pub fn window(&self) -> Duration {
        let minutes = if self.minutes > 0 { self.minutes } else { history_minutes_default() };
        Duration::from_secs(minutes * 60)
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            enabled: history_enabled_default(),
            path: history_path_default(),
            minutes: history_minutes_default(),
        }
    }
}

fn mqtt_port_default() -> u16 { 1883 }
fn mqtt_client_name_default() -> String { "obis2mqtt".to_string() }
fn mqtt_base_topic_default() -> String { "obis2mqtt".to_string() }
fn mqtt_ha_enabled_default() -> bool { true }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_ha_enabled_default")]
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_base_topic_default")]
    pub base_topic: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub meter: MeterConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    pub mqtt: MqttConfig,
}

impl Config {
    /// Loads `config/obis2mqtt.yaml` or `obis2mqtt.yaml`, whichever exists first.
    pub fn load() -> Result<Self, ConfigError> {
        let path = CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or_else(|| ConfigError::NotFound(CONFIG_PATHS.join(" or ")))?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_debug_override(std::env::var(DEBUG_ENV).ok().as_deref());
        Ok(config)
    }

    /// Parses and validates, without looking at the environment.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        config.meter.validate()?;
        if config.polling.poll_interval == 0 {
            return Err(ConfigError::Invalid("polling.poll_interval must be > 0".to_string()));
        }
        Ok(config)
    }

    /// Applies the debug override taken from the environment. Only a
    /// non-negative integer wins over the configured level.
    pub fn apply_debug_override(&mut self, value: Option<&str>) {
        let raw = match value {
            Some(v) => v.trim(),
            None => return,
        };
        match raw.parse::<i64>() {
            Ok(level) if level >= 0 => {
                let level = level.min(2) as u8;
                debug!("{} overrides meter debug level {} with {}", DEBUG_ENV, self.meter.debug, level);
                self.meter.debug = level;
            }
            _ => warn!("Ignoring {}={:?}, expected a non-negative integer", DEBUG_ENV, raw),
        }
    }
}
