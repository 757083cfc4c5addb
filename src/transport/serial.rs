//! Serial port sessions.
//!
//! Line settings come from the entry's `SerialConnectionParams` and are checked when
//! the configuration loads; opening the port happens lazily on the first cycle.

use super::DynStream;
use crate::config::SerialConnectionParams;
use crate::error::{ConfigError, DeviceError};

/// Parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Validated serial line settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits, 5 to 8
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits, 1 or 2
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl SerialSettings {
    /// Check `SerialConnectionParams` for a device entry.
    pub fn from_params(device: &str, params: &SerialConnectionParams) -> Result<Self, ConfigError> {
        if params.baudrate == 0 {
            return Err(ConfigError::device(device, "baudrate must be positive"));
        }
        if !(5..=8).contains(&params.bytesize) {
            return Err(ConfigError::device(
                device,
                format!("unsupported bytesize {}", params.bytesize),
            ));
        }
        let parity = match params.parity.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Parity::None,
            "E" | "EVEN" => Parity::Even,
            "O" | "ODD" => Parity::Odd,
            other => {
                return Err(ConfigError::device(
                    device,
                    format!("unsupported parity '{}'", other),
                ))
            }
        };
        let stop_bits = if params.stopbits == 1.0 {
            1
        } else if params.stopbits == 2.0 {
            2
        } else {
            return Err(ConfigError::device(
                device,
                format!("unsupported stopbits {}", params.stopbits),
            ));
        };
        Ok(Self {
            baud_rate: params.baudrate,
            data_bits: params.bytesize,
            parity,
            stop_bits,
        })
    }
}

/// Open a serial port asynchronously using spawn_blocking.
#[cfg(feature = "instrument_serial")]
pub async fn open_serial(
    path: &str,
    settings: SerialSettings,
    device_name: &str,
) -> Result<DynStream, DeviceError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path_owned = path.to_string();
    let device_owned = device_name.to_string();

    let port = spawn_blocking(move || {
        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        tokio_serial::new(&path_owned, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DeviceError::connection(format!(
                    "failed to open {} serial port {}: {}",
                    device_owned, path_owned, e
                ))
            })
    })
    .await
    .map_err(|e| DeviceError::connection(format!("serial open task failed: {}", e)))??;

    Ok(Box::new(port))
}

/// Serial support was not compiled in.
#[cfg(not(feature = "instrument_serial"))]
pub async fn open_serial(
    path: &str,
    _settings: SerialSettings,
    device_name: &str,
) -> Result<DynStream, DeviceError> {
    Err(DeviceError::connection(format!(
        "cannot open {} for {}: built without the instrument_serial feature",
        path, device_name
    )))
}
