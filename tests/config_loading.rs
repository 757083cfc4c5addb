//! Loading the runtime configuration and device document from disk.

use lab_logger::build_pollers;
use lab_logger::config::{load_devices, RuntimeConfig};
use lab_logger::error::{ConfigError, LoggerError};
use lab_logger::reading::Precision;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const RUNTIME: &str = r#"
[database]
url = "http://influx.lab:8086"
org = "lab"
bucket = "telemetry"
token = "from-file"
precision = "s"

[update]
interval_secs = 15

[devices]
config_path = "devices.json"
default_timeout_secs = 2.5

[writer]
max_attempts = 5

[logging]
level = "debug"
format = "compact"
"#;

const DEVICES: &str = r#"[
  {
    "Device": "Chamber gauge",
    "Model": "Simulated",
    "measurement": "pressure",
    "tags": {"room": "b12"},
    "Channels": {
      "main": {"Type": "Constant", "Value": 1e-6, "field-key": "p"}
    }
  },
  {
    "Device": "Scanner",
    "Model": "Keysight DAQ973A",
    "Address": "TCPIP0::10.0.0.20::inst0::INSTR",
    "Timeout": 8,
    "ParallelReadout": true,
    "measurement": "temperature",
    "Channels": {
      "inlet":  {"Type": "TEMPJ", "DeviceChannel": 101, "field-key": "t_in"},
      "outlet": {"Type": "TEMPJ", "DeviceChannel": 102, "field-key": "t_out"}
    }
  }
]"#;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

#[test]
fn test_runtime_and_device_documents_load() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "config.toml", RUNTIME);
    write(dir.path(), "devices.json", DEVICES);

    let config = RuntimeConfig::load_from(dir.path().join("config.toml")).unwrap();
    assert_eq!(config.database.precision, Precision::S);
    assert_eq!(config.interval(), Duration::from_secs(15));
    assert_eq!(config.writer.max_attempts, 5);
    assert_eq!(config.writer.initial_backoff_ms, 500);
    assert_eq!(config.logging.format, "compact");

    let devices = load_devices(
        &dir.path().join(&config.devices.config_path),
        Duration::from_secs_f64(config.devices.default_timeout_secs),
    )
    .unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].timeout, Duration::from_millis(2500));
    assert_eq!(devices[1].timeout, Duration::from_secs(8));
    assert!(devices[1].parallel_readout);
    let keys: Vec<_> = devices[1].channels.iter().map(|c| c.key.as_str()).collect();
    assert_eq!(keys, ["inlet", "outlet"]);

    let pollers = build_pollers(devices, config.devices.reconnect_threshold).unwrap();
    assert_eq!(pollers[1].driver().family(), "scpi");
}

#[test]
fn test_environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "config.toml", RUNTIME);

    std::env::set_var("LAB_LOGGER_DATABASE__TOKEN", "from-env");
    let config = RuntimeConfig::load_from(dir.path().join("config.toml"));
    std::env::remove_var("LAB_LOGGER_DATABASE__TOKEN");

    assert_eq!(config.unwrap().database.token, "from-env");
}

#[test]
fn test_invalid_runtime_values_are_fatal() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "config.toml",
        &RUNTIME.replace("interval_secs = 15", "interval_secs = -1"),
    );
    let err = RuntimeConfig::load_from(dir.path().join("config.toml")).unwrap_err();
    assert!(matches!(err, LoggerError::Config(ConfigError::Invalid(_))));
}

#[test]
fn test_missing_device_document_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let err = load_devices(&dir.path().join("absent.json"), Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, LoggerError::Io(_)));
}

#[test]
fn test_unknown_model_is_rejected() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "devices.json",
        &DEVICES.replace("Keysight DAQ973A", "Flux Capacitor 9000"),
    );
    let devices = load_devices(&dir.path().join("devices.json"), Duration::from_secs(5)).unwrap();
    let err = build_pollers(devices, 3).unwrap_err();
    assert_eq!(
        err,
        ConfigError::UnknownModel {
            device: "Scanner".into(),
            model: "Flux Capacitor 9000".into(),
        }
    );
}

#[test]
fn test_vendor_visa_resources_are_rejected() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "devices.json",
        &DEVICES.replace("TCPIP0::10.0.0.20::inst0::INSTR", "GPIB0::22::INSTR"),
    );
    let devices = load_devices(&dir.path().join("devices.json"), Duration::from_secs(5)).unwrap();
    assert!(build_pollers(devices, 3).is_err());
}

#[test]
fn test_shipped_sample_configuration_is_valid() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
    let config = RuntimeConfig::load_from(root.join("config.toml")).unwrap();
    let devices = load_devices(
        &root.join(&config.devices.config_path),
        Duration::from_secs_f64(config.devices.default_timeout_secs),
    )
    .unwrap();
    let pollers = build_pollers(devices, config.devices.reconnect_threshold).unwrap();
    let families: Vec<_> = pollers.iter().map(|p| p.driver().family()).collect();
    assert_eq!(
        families,
        ["simulated", "scpi", "ascii_serial", "vendor_tcp", "vendor_tcp", "http"]
    );
}
