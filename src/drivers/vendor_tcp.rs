//! Vendor control protocols over TCP.
//!
//! # Pfeiffer TPG 366 MaxiGauge (port 8000)
//!
//! Mnemonic commands terminated by CR LF are acknowledged with `ACK CR LF` (or
//! `NAK CR LF`); the data is then requested with a bare `ENQ`:
//!
//! ```text
//! > PR3\r\n        < \x06\r\n
//! > \x05           < 0,1.2340E-03\r\n      (status, pressure)
//! ```
//!
//! The unit streams measurement data until it receives the first command, so a
//! session starts with `RES` and discards everything up to its acknowledgement.
//!
//! # Cryomech CPA1110 helium compressor (Modbus TCP, port 502)
//!
//! Function 0x04 (read input registers), one register per channel; the register holds
//! ten times the value.

use super::{parse_f64, unknown_channel, DeviceDriver};
use crate::config::DeviceConfig;
use crate::error::{ConfigError, DeviceError};
use crate::reading::FieldValue;
use crate::transport::{connect_tcp, Link};
use async_trait::async_trait;
use tracing::{debug, warn};

/// TPG 366 Ethernet port.
pub const PFEIFFER_PORT: u16 = 8000;
/// Modbus TCP port.
pub const MODBUS_PORT: u16 = 502;

const ACK: &str = "\x06";
const NAK: &str = "\x15";
const ENQ: &[u8] = b"\x05";

const READ_INPUT_REGISTERS: u8 = 0x04;

fn gauge_status(code: u32) -> &'static str {
    match code {
        0 => "measurement data okay",
        1 => "underrange",
        2 => "overrange",
        3 => "sensor error",
        4 => "sensor off",
        5 => "no sensor",
        6 => "identification error",
        _ => "unknown status",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Tpg366,
    Cpa1110 { unit: u8 },
}

/// Vendor TCP driver.
#[derive(Debug)]
pub struct VendorTcpDriver {
    device: String,
    host: String,
    port: u16,
    protocol: Protocol,
    /// Gauge number (TPG) or input register (CPA) per channel.
    targets: Vec<u16>,
}

/// Vendor TCP session.
#[derive(Debug)]
pub struct VendorSession {
    link: Link,
    transaction: u16,
}

impl VendorSession {
    fn new(link: Link) -> Self {
        Self {
            link,
            transaction: 0,
        }
    }
}

impl VendorTcpDriver {
    /// Build from a device entry.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let (protocol, default_port) = match config.model.as_str() {
            "Pfeiffer TPG366" => (Protocol::Tpg366, PFEIFFER_PORT),
            "Cryomech CPA1110" => {
                let id = config.param_f64("ModbusDeviceID").unwrap_or(1.0);
                if !(0.0..=255.0).contains(&id) || id.fract() != 0.0 {
                    return Err(ConfigError::device(
                        &config.name,
                        format!("ModbusDeviceID {} is not a unit id", id),
                    ));
                }
                (Protocol::Cpa1110 { unit: id as u8 }, MODBUS_PORT)
            }
            other => {
                return Err(ConfigError::UnknownModel {
                    device: config.name.clone(),
                    model: other.to_string(),
                })
            }
        };
        let (host, port) = host_port(&config.address, default_port)
            .ok_or_else(|| ConfigError::device(&config.name, "Address must be host or host:port"))?;

        let mut targets = Vec::with_capacity(config.channels.len());
        for channel in &config.channels {
            let target = match protocol {
                Protocol::Tpg366 => {
                    if channel.selector() != "Pressure" {
                        return Err(unknown_channel(config, channel));
                    }
                    match channel.device_channel {
                        Some(n @ 1..=6) => n as u16,
                        _ => {
                            return Err(ConfigError::channel(
                                &config.name,
                                &channel.key,
                                "DeviceChannel must be a gauge number 1..6",
                            ))
                        }
                    }
                }
                Protocol::Cpa1110 { .. } => match channel.selector() {
                    "CoolantInTemperature" | "CoolantIntTemperature" => 40,
                    "CoolantOutTemperature" => 41,
                    "OilTemperature" => 42,
                    "HeTemperature" => 43,
                    "LowPressure" => 44,
                    "HighPressure" => 46,
                    _ => return Err(unknown_channel(config, channel)),
                },
            };
            targets.push(target);
        }

        Ok(Self {
            device: config.name.clone(),
            host,
            port,
            protocol,
            targets,
        })
    }

    async fn start_session(&self, link: Link) -> Result<VendorSession, DeviceError> {
        let mut session = VendorSession::new(link);
        if self.protocol == Protocol::Tpg366 {
            let link = &mut session.link;
            link.send(b"RES\r\n").await?;
            let mut discarded = 0usize;
            loop {
                let line = link.read_line().await?;
                if line.trim_end().ends_with(ACK) {
                    break;
                }
                discarded += line.len();
            }
            link.send(ENQ).await?;
            let errors = link.read_line().await?;
            debug!(device = %self.device, discarded, errors = %errors.trim(), "Gauge unit reset");
        }
        Ok(session)
    }

    async fn tpg_pressure(&self, link: &mut Link, gauge: u16) -> Result<f64, DeviceError> {
        let reply = link.query_line(&format!("PR{}\r\n", gauge)).await?;
        match reply.as_str() {
            ACK => {}
            NAK => return Err(DeviceError::malformed("gauge unit returned NAK")),
            other => {
                return Err(DeviceError::malformed(format!(
                    "unexpected acknowledgement {:?}",
                    other
                )))
            }
        }
        link.send(ENQ).await?;
        let data = link.read_line().await?;
        let (status, value) = data
            .trim()
            .split_once(',')
            .ok_or_else(|| DeviceError::malformed(format!("unexpected data {:?}", data.trim())))?;
        let status: u32 = status
            .trim()
            .parse()
            .map_err(|_| DeviceError::malformed(format!("invalid status '{}'", status)))?;
        if status != 0 {
            return Err(DeviceError::malformed(format!(
                "gauge {}: {}",
                gauge,
                gauge_status(status)
            )));
        }
        parse_f64(value)
    }

    async fn modbus_register(
        &self,
        session: &mut VendorSession,
        unit: u8,
        register: u16,
    ) -> Result<u16, DeviceError> {
        session.transaction = session.transaction.wrapping_add(1);
        let tid = session.transaction;
        let request = modbus_request(tid, unit, register);
        session.link.send(&request).await?;

        let header = session.link.read_exact(7).await?;
        let reply_tid = u16::from_be_bytes([header[0], header[1]]);
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        if length < 2 || length > 253 {
            return Err(DeviceError::malformed(format!(
                "invalid MBAP length {}",
                length
            )));
        }
        let pdu = session.link.read_exact(length - 1).await?;
        if reply_tid != tid {
            return Err(DeviceError::malformed(format!(
                "transaction id {} answered with {}",
                tid, reply_tid
            )));
        }
        decode_register(&pdu)
    }
}

fn modbus_request(tid: u16, unit: u8, register: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&tid.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&6u16.to_be_bytes());
    frame.push(unit);
    frame.push(READ_INPUT_REGISTERS);
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame
}

fn decode_register(pdu: &[u8]) -> Result<u16, DeviceError> {
    match pdu {
        [READ_INPUT_REGISTERS, 2, hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        [code, exception, ..] if *code == READ_INPUT_REGISTERS | 0x80 => Err(
            DeviceError::malformed(format!("Modbus exception code {}", exception)),
        ),
        _ => Err(DeviceError::malformed(format!(
            "unexpected Modbus response {:02x?}",
            pdu
        ))),
    }
}

fn host_port(address: &str, default_port: u16) -> Option<(String, u16)> {
    let address = address.trim();
    if address.is_empty() {
        return None;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((address.to_string(), default_port)),
    }
}

#[async_trait]
impl DeviceDriver for VendorTcpDriver {
    type Session = VendorSession;

    async fn open(&self) -> Result<VendorSession, DeviceError> {
        let stream = connect_tcp(&self.host, self.port).await?;
        self.start_session(Link::new(stream)).await
    }

    async fn read_channel(
        &self,
        session: &mut VendorSession,
        channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        let target = *self
            .targets
            .get(channel)
            .ok_or_else(|| DeviceError::malformed(format!("no channel {}", channel)))?;
        let value = match self.protocol {
            Protocol::Tpg366 => self.tpg_pressure(&mut session.link, target).await?,
            Protocol::Cpa1110 { unit } => {
                f64::from(self.modbus_register(session, unit, target).await?) / 10.0
            }
        };
        Ok(FieldValue::Float(value))
    }

    async fn close(&self, mut session: VendorSession) {
        if let Err(e) = session.link.shutdown().await {
            warn!(device = %self.device, error = %e, "Closing TCP session failed");
        }
    }
}
