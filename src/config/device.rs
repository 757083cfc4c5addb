//! Device configuration document.
//!
//! The document is a JSON array of device entries:
//!
//! ```json
//! [{
//!   "Device": "Chamber gauge",
//!   "Model": "KJLC 354",
//!   "Address": "/dev/ttyUSB0",
//!   "SerialConnectionParams": {"baudrate": 19200},
//!   "DeviceSpecificParams": {"InternalAddress": "01"},
//!   "Timeout": 2,
//!   "ParallelReadout": true,
//!   "tags": {"lab": "B2"},
//!   "measurement": "vacuum",
//!   "Channels": {
//!     "chamber": {"Type": "Pressure", "field-key": "pressure_torr"}
//!   }
//! }]
//! ```
//!
//! Channel order follows the document. Model-specific keys stay in the residual
//! `params` / `extra` bags here and are turned into typed driver parameters when the
//! driver is built.

use crate::converter::Converter;
use crate::error::{AppResult, ConfigError};
use crate::reading::TagSet;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Line parameters for serial-backed models (pyserial-style key names).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SerialConnectionParams {
    /// Baud rate
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Data bits (5..=8)
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// `N`, `E` or `O`
    #[serde(default = "default_parity")]
    pub parity: String,
    /// 1 or 2
    #[serde(default = "default_stopbits")]
    pub stopbits: f64,
}

fn default_baudrate() -> u32 {
    9600
}

fn default_bytesize() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> f64 {
    1.0
}

impl Default for SerialConnectionParams {
    fn default() -> Self {
        Self {
            baudrate: default_baudrate(),
            bytesize: default_bytesize(),
            parity: default_parity(),
            stopbits: default_stopbits(),
        }
    }
}

/// Raw device entry as it appears in the document.
#[derive(Debug, Clone, Deserialize)]
struct DeviceEntry {
    #[serde(rename = "Device")]
    name: String,
    #[serde(rename = "Model")]
    model: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "SerialConnectionParams", default)]
    serial: Option<Map<String, Value>>,
    #[serde(rename = "DeviceSpecificParams", default)]
    params: Map<String, Value>,
    #[serde(rename = "Timeout", default)]
    timeout: Option<f64>,
    #[serde(rename = "ParallelReadout", default)]
    parallel_readout: bool,
    #[serde(default)]
    tags: TagSet,
    #[serde(default)]
    measurement: String,
    #[serde(rename = "Channels", default)]
    channels: Map<String, Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// One reading position within a device.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Channel key from the `Channels` mapping.
    #[serde(skip)]
    pub key: String,
    /// Driver-understood channel selector.
    #[serde(rename = "Type", default)]
    pub channel_type: Option<String>,
    /// Optional numeric sub-address (scan channel, gauge number).
    #[serde(rename = "DeviceChannel", default)]
    pub device_channel: Option<u32>,
    /// Scale factor applied before the converter.
    #[serde(rename = "Multiplier", default)]
    pub multiplier: Option<f64>,
    /// Function applied after the multiplier.
    #[serde(rename = "Converter", default)]
    pub converter: Option<Converter>,
    /// Output field key.
    #[serde(rename = "field-key", default)]
    pub field_key: String,
    /// Tags merged over the device tags.
    #[serde(default)]
    pub tags: TagSet,
    /// Model-specific channel keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChannelConfig {
    /// Channel type, falling back to the channel key.
    pub fn selector(&self) -> &str {
        self.channel_type.as_deref().unwrap_or(&self.key)
    }

    /// Model-specific key, looked up in a nested `DeviceSpecificParams` object first.
    pub fn extra_value(&self, key: &str) -> Option<&Value> {
        self.extra
            .get("DeviceSpecificParams")
            .and_then(|nested| nested.get(key))
            .or_else(|| self.extra.get(key))
    }

    /// String-valued model-specific key; falls back to the channel tags.
    pub fn extra_str(&self, key: &str) -> Option<String> {
        match self.extra_value(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => self.tags.get(key).cloned(),
        }
    }

    /// Numeric model-specific key.
    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        value_as_f64(self.extra_value(key)?)
    }
}

/// One physical instrument, validated.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Unique device name.
    pub name: String,
    /// Driver-selection key.
    pub model: String,
    /// Transport endpoint; may be empty.
    pub address: String,
    /// Serial line parameters, present for entries that carry them.
    pub serial: Option<SerialConnectionParams>,
    /// Residual model-specific parameters.
    pub params: Map<String, Value>,
    /// Deadline for a whole read cycle.
    pub timeout: Duration,
    /// Whether cycles may overlap across ticks.
    pub parallel_readout: bool,
    /// Default tags.
    pub tags: TagSet,
    /// Default measurement name.
    pub measurement: String,
    /// Channels in document order.
    pub channels: Vec<ChannelConfig>,
    /// Connection parameters that are not serial line settings (e.g. `ApiKey`).
    pub connection: Map<String, Value>,
}

impl DeviceConfig {
    /// String-valued device parameter.
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Numeric device parameter.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        value_as_f64(self.params.get(key)?)
    }

    /// Boolean device parameter; accepts `true`/`false`, 0/1 and their string forms.
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        match self.params.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Non-serial connection parameter (e.g. `ApiKey`).
    pub fn connection_str(&self, key: &str) -> Option<String> {
        match self.connection.get(key)? {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Serial line parameters or defaults.
    pub fn serial_params(&self) -> SerialConnectionParams {
        self.serial.clone().unwrap_or_default()
    }

    fn from_entry(entry: DeviceEntry, default_timeout: Duration) -> Result<Self, ConfigError> {
        let name = entry.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::Invalid("device entry without a name".into()));
        }
        if entry.model.trim().is_empty() {
            return Err(ConfigError::device(&name, "missing Model"));
        }
        if entry.measurement.trim().is_empty() {
            return Err(ConfigError::device(&name, "missing measurement"));
        }

        let timeout = match entry.timeout {
            None => default_timeout,
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
            Some(secs) => {
                return Err(ConfigError::device(
                    &name,
                    format!("Timeout must be positive, got {}", secs),
                ))
            }
        };

        let (serial, connection) = split_connection_params(&name, entry.serial)?;

        // Unrecognised top-level keys (`VISAIDN`, `CmdOnInit`) act as device parameters.
        let mut params = entry.params;
        for (key, value) in entry.extra {
            params.entry(key).or_insert(value);
        }

        if entry.channels.is_empty() {
            return Err(ConfigError::device(&name, "no Channels configured"));
        }

        let mut channels = Vec::with_capacity(entry.channels.len());
        for (key, value) in entry.channels {
            let mut channel: ChannelConfig = serde_json::from_value(value)
                .map_err(|e| ConfigError::channel(&name, &key, e.to_string()))?;
            if channel.field_key.trim().is_empty() {
                return Err(ConfigError::channel(&name, &key, "missing field-key"));
            }
            if let Some(m) = channel.multiplier {
                if !m.is_finite() {
                    return Err(ConfigError::channel(&name, &key, "Multiplier is not finite"));
                }
            }
            channel.key = key;
            channels.push(channel);
        }

        Ok(Self {
            name,
            model: entry.model.trim().to_string(),
            address: entry.address.trim().to_string(),
            serial,
            params,
            timeout,
            parallel_readout: entry.parallel_readout,
            tags: entry.tags,
            measurement: entry.measurement,
            channels,
            connection,
        })
    }
}

/// Separate serial line settings from other connection keys such as `ApiKey`.
fn split_connection_params(
    device: &str,
    raw: Option<Map<String, Value>>,
) -> Result<(Option<SerialConnectionParams>, Map<String, Value>), ConfigError> {
    const SERIAL_KEYS: [&str; 4] = ["baudrate", "bytesize", "parity", "stopbits"];

    let Some(raw) = raw else {
        return Ok((None, Map::new()));
    };

    let mut serial = Map::new();
    let mut other = Map::new();
    for (key, value) in raw {
        if SERIAL_KEYS.contains(&key.as_str()) {
            serial.insert(key, value);
        } else {
            other.insert(key, value);
        }
    }

    if serial.is_empty() {
        return Ok((None, other));
    }
    let params: SerialConnectionParams = serde_json::from_value(Value::Object(serial))
        .map_err(|e| ConfigError::device(device, format!("SerialConnectionParams: {}", e)))?;
    Ok((Some(params), other))
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse and validate a device document.
pub fn parse_devices(json: &str, default_timeout: Duration) -> AppResult<Vec<DeviceConfig>> {
    let entries: Vec<DeviceEntry> = serde_json::from_str(json)?;

    let mut seen = HashSet::new();
    let mut devices = Vec::with_capacity(entries.len());
    for entry in entries {
        let device = DeviceConfig::from_entry(entry, default_timeout)?;
        if !seen.insert(device.name.clone()) {
            return Err(ConfigError::DuplicateDevice(device.name).into());
        }
        debug!(
            device = %device.name,
            model = %device.model,
            channels = device.channels.len(),
            "Parsed device entry"
        );
        devices.push(device);
    }
    Ok(devices)
}

/// Load the device document from disk.
pub fn load_devices(path: &Path, default_timeout: Duration) -> AppResult<Vec<DeviceConfig>> {
    let json = std::fs::read_to_string(path)?;
    let devices = parse_devices(&json, default_timeout)?;
    info!(
        path = %path.display(),
        count = devices.len(),
        "Loaded device configuration"
    );
    Ok(devices)
}
