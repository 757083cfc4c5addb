//! VISA-style resource strings.
//!
//! SCPI instruments are addressed the way VISA addresses them, but sessions are opened
//! on native transports:
//!
//! | Resource                          | Transport                  |
//! |-----------------------------------|----------------------------|
//! | `TCPIP0::10.0.0.5::5025::SOCKET`  | raw TCP, given port        |
//! | `TCPIP0::10.0.0.5::inst0::INSTR`  | raw SCPI socket, port 5025 |
//! | `ASRL/dev/ttyUSB0::INSTR`         | serial port                |
//! | `ASRL3::INSTR`                    | serial port number 3       |
//! | `/dev/usbtmc0`                    | USB-TMC character device   |
//! | `10.0.0.5:5025`                   | raw TCP                    |
//!
//! GPIB and USB INSTR resources need a vendor VISA library and are rejected.

use super::serial::{open_serial, SerialSettings};
use super::{connect_tcp, DynStream};
use crate::error::DeviceError;

/// Standard raw-socket port for LAN SCPI instruments.
pub const SCPI_RAW_PORT: u16 = 5025;

/// Native transport behind a resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Raw TCP socket
    Tcp {
        /// Host name or address
        host: String,
        /// Port
        port: u16,
    },
    /// Serial port
    Serial {
        /// Device path (`/dev/ttyUSB0`, `COM3`)
        path: String,
    },
    /// USB-TMC character device
    UsbTmc {
        /// Device path
        path: String,
    },
}

/// Map a resource string to its native transport.
pub fn resolve(address: &str) -> Result<Resource, String> {
    let address = address.trim();
    if address.is_empty() {
        return Err("empty resource address".into());
    }

    if address.starts_with("/dev/usbtmc") {
        return Ok(Resource::UsbTmc {
            path: address.to_string(),
        });
    }

    let upper = address.to_ascii_uppercase();
    if upper.starts_with("TCPIP") {
        let parts: Vec<&str> = address.split("::").collect();
        let suffix = parts.last().map(|s| s.to_ascii_uppercase());
        return match (parts.len(), suffix.as_deref()) {
            (4, Some("SOCKET")) => {
                let port = parts[2]
                    .parse()
                    .map_err(|_| format!("invalid port in '{}'", address))?;
                Ok(Resource::Tcp {
                    host: parts[1].to_string(),
                    port,
                })
            }
            (3 | 4, Some("INSTR")) => Ok(Resource::Tcp {
                host: parts[1].to_string(),
                port: SCPI_RAW_PORT,
            }),
            _ => Err(format!("unrecognised TCPIP resource '{}'", address)),
        };
    }

    if upper.starts_with("ASRL") {
        let body = address[4..]
            .strip_suffix("::INSTR")
            .or_else(|| address[4..].strip_suffix("::instr"))
            .unwrap_or(&address[4..]);
        if body.is_empty() {
            return Err(format!("missing port in '{}'", address));
        }
        let path = match body.parse::<u32>() {
            Ok(n) => numbered_serial_port(n)?,
            Err(_) => body.to_string(),
        };
        return Ok(Resource::Serial { path });
    }

    if upper.starts_with("GPIB") || upper.starts_with("USB") {
        return Err(format!(
            "'{}' needs a vendor VISA library; use a TCPIP, ASRL or /dev/usbtmc resource",
            address
        ));
    }

    if let Some((host, port)) = address.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return Ok(Resource::Tcp {
                host: host.to_string(),
                port,
            });
        }
    }

    if address.starts_with("/dev/") || upper.starts_with("COM") {
        return Ok(Resource::Serial {
            path: address.to_string(),
        });
    }

    Err(format!("unrecognised resource '{}'", address))
}

fn numbered_serial_port(n: u32) -> Result<String, String> {
    if n == 0 {
        return Err("ASRL port numbers start at 1".into());
    }
    if cfg!(windows) {
        Ok(format!("COM{}", n))
    } else {
        Ok(format!("/dev/ttyS{}", n - 1))
    }
}

/// Open a session on a resolved resource.
pub async fn open(
    resource: &Resource,
    serial: SerialSettings,
    device_name: &str,
) -> Result<DynStream, DeviceError> {
    match resource {
        Resource::Tcp { host, port } => connect_tcp(host, *port).await,
        Resource::Serial { path } => open_serial(path, serial, device_name).await,
        Resource::UsbTmc { path } => {
            let file = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .await
                .map_err(|e| DeviceError::connection(format!("{}: {}", path, e)))?;
            Ok(Box::new(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str, port: u16) -> Resource {
        Resource::Tcp {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn tcpip_resources() {
        assert_eq!(
            resolve("TCPIP0::192.168.1.20::5025::SOCKET").unwrap(),
            tcp("192.168.1.20", 5025)
        );
        assert_eq!(
            resolve("TCPIP::daq.lab::inst0::INSTR").unwrap(),
            tcp("daq.lab", SCPI_RAW_PORT)
        );
        assert_eq!(
            resolve("TCPIP0::10.0.0.5::INSTR").unwrap(),
            tcp("10.0.0.5", SCPI_RAW_PORT)
        );
        assert!(resolve("TCPIP0::10.0.0.5::x::SOCKET").is_err());
    }

    #[test]
    fn serial_resources() {
        assert_eq!(
            resolve("ASRL/dev/ttyUSB0::INSTR").unwrap(),
            Resource::Serial {
                path: "/dev/ttyUSB0".into()
            }
        );
        assert!(matches!(resolve("ASRL3::INSTR").unwrap(), Resource::Serial { .. }));
        assert!(resolve("ASRL0::INSTR").is_err());
        assert_eq!(
            resolve("/dev/ttyACM0").unwrap(),
            Resource::Serial {
                path: "/dev/ttyACM0".into()
            }
        );
    }

    #[test]
    fn usbtmc_and_host_port() {
        assert_eq!(
            resolve("/dev/usbtmc0").unwrap(),
            Resource::UsbTmc {
                path: "/dev/usbtmc0".into()
            }
        );
        assert_eq!(resolve("pm100.lab:5000").unwrap(), tcp("pm100.lab", 5000));
    }

    #[test]
    fn vendor_visa_resources_are_rejected() {
        assert!(resolve("GPIB0::22::INSTR").is_err());
        assert!(resolve("USB0::0x1313::0x8078::P0001::INSTR").is_err());
        assert!(resolve("").is_err());
    }
}
