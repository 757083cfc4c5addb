//! SCPI instruments on VISA-style resources.
//!
//! Protocol Overview:
//! - Format: SCPI, one command per line
//! - Terminator: LF (\n) on write, LF or CRLF on read
//! - Resources: TCPIP SOCKET/INSTR, ASRL, /dev/usbtmc*, host:port
//!   (see [`crate::transport::resource`])
//!
//! On open the session reads `*IDN?` and compares it with the optional `VISAIDN`
//! parameter (a mismatch is only a warning), then sends the optional `CmdOnInit`.
//!
//! # Keysight DAQ973A
//!
//! Channels are configured once per session and read as one scan per cycle:
//!
//! ```text
//! CONF:VOLT:DC 10.000000000000,0.000010000000000000,(@101)
//! CONF:TEMP TC,J,(@102)
//! ROUT:SCAN (@101,102)
//! TRIG:COUNT 1
//! FORM:READ:CHAN ON
//! ...
//! ROUT:SCAN (@101,102)     <- every cycle
//! READ?                    -> +1.234E+00,101,+2.345E+01,102
//! ```
//!
//! # Thorlabs PM100
//!
//! Power unit is forced to W on open. Channel types map to single queries
//! (`MEAS:POW?`, `SENS:POW:UNIT?`, ...).
//!
//! # Red Pitaya lockbox
//!
//! Plain TCP on `Address` and `SCPIConnectionParams.Port` (5000 by default). Commands
//! end in CR LF and the session starts without `*IDN?`:
//!
//! ```text
//! ANALOG:IN1:VOLT?         -> 0.4512\r\n     FastAnalogIn,  DeviceChannel 1
//! PID:IN1:OUT2:KP?         -> 250\r\n        PGain,         PID "12"
//! ```
//!
//! # Generic SCPI
//!
//! `Query` channels send the channel's `Command` and parse the answer as
//! `ResponseType` (`float` by default, `integer`, `text` or `boolean`).

use super::{parse_f64, unknown_channel, DeviceDriver};
use crate::config::{ChannelConfig, DeviceConfig};
use crate::error::{ConfigError, DeviceError};
use crate::reading::FieldValue;
use crate::transport::resource::{self, Resource};
use crate::transport::serial::SerialSettings;
use crate::transport::Link;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How a query response is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Floating point number
    Float,
    /// Integer (a float answer with no fraction is accepted)
    Integer,
    /// Raw text
    Text,
    /// `1`/`0`, `ON`/`OFF`
    Boolean,
}

impl ResponseKind {
    fn parse(self, response: &str) -> Result<FieldValue, DeviceError> {
        let text = response.trim();
        match self {
            ResponseKind::Float => parse_f64(text).map(FieldValue::Float),
            ResponseKind::Integer => {
                let value = parse_f64(text)?;
                if value.fract() != 0.0 || !value.is_finite() {
                    return Err(DeviceError::malformed(format!(
                        "'{}' is not an integer",
                        text
                    )));
                }
                Ok(FieldValue::Integer(value as i64))
            }
            ResponseKind::Text => Ok(FieldValue::Text(text.to_string())),
            ResponseKind::Boolean => match text.to_ascii_uppercase().as_str() {
                "1" | "ON" | "TRUE" => Ok(FieldValue::Boolean(true)),
                "0" | "OFF" | "FALSE" => Ok(FieldValue::Boolean(false)),
                _ => Err(DeviceError::malformed(format!("'{}' is not a boolean", text))),
            },
        }
    }
}

/// Red Pitaya SCPI server port.
pub const RED_PITAYA_PORT: u16 = 5000;

/// Framing and session start-up of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// LF-terminated commands, `*IDN?` on open.
    Standard,
    /// CR LF-terminated commands, no identification.
    RedPitaya,
}

impl Dialect {
    fn terminator(self) -> &'static str {
        match self {
            Dialect::Standard => "\n",
            Dialect::RedPitaya => "\r\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ScpiChannel {
    /// Value picked from the cycle's scan.
    Scan(u32),
    /// Single query.
    Query { command: String, kind: ResponseKind },
}

/// SCPI driver.
#[derive(Debug)]
pub struct ScpiDriver {
    device: String,
    dialect: Dialect,
    resource: Resource,
    serial: SerialSettings,
    idn: Option<String>,
    cmd_on_init: Option<String>,
    /// Commands sent once per session after identification.
    setup: Vec<String>,
    /// Scan list for whole-device readout, `None` for query-only instruments.
    scan: Option<ScanList>,
    channels: Vec<ScpiChannel>,
}

#[derive(Debug, Clone, PartialEq)]
struct ScanList {
    channels: BTreeSet<u32>,
    spec: String,
}

/// SCPI session.
#[derive(Debug)]
pub struct ScpiSession {
    link: Link,
    scan: HashMap<u32, f64>,
}

impl ScpiDriver {
    /// Build from a device entry.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let dialect = match config.model.as_str() {
            "Red Pitaya Lockbox" => Dialect::RedPitaya,
            _ => Dialect::Standard,
        };
        let resource = match dialect {
            Dialect::Standard => resource::resolve(&config.address)
                .map_err(|e| ConfigError::device(&config.name, e))?,
            Dialect::RedPitaya => red_pitaya_resource(config)?,
        };
        let serial = SerialSettings::from_params(&config.name, &config.serial_params())?;

        let mut driver = Self {
            device: config.name.clone(),
            dialect,
            resource,
            serial,
            idn: config.param_str("VISAIDN"),
            cmd_on_init: config.param_str("CmdOnInit"),
            setup: Vec::new(),
            scan: None,
            channels: Vec::with_capacity(config.channels.len()),
        };

        match config.model.as_str() {
            "Keysight DAQ973A" => driver.configure_daq973a(config)?,
            "Thorlabs PM100" => {
                driver.setup.push("SENS:POW:UNIT W".into());
                for channel in &config.channels {
                    let (command, kind) = pm100_query(channel.selector())
                        .ok_or_else(|| unknown_channel(config, channel))?;
                    driver.channels.push(ScpiChannel::Query {
                        command: command.into(),
                        kind,
                    });
                }
            }
            "Red Pitaya Lockbox" => {
                for channel in &config.channels {
                    driver.channels.push(ScpiChannel::Query {
                        command: lockbox_query(config, channel)?,
                        kind: ResponseKind::Float,
                    });
                }
            }
            _ => {
                for channel in &config.channels {
                    driver.channels.push(generic_query(config, channel)?);
                }
            }
        }
        Ok(driver)
    }

    fn configure_daq973a(&mut self, config: &DeviceConfig) -> Result<(), ConfigError> {
        let mut scanned = BTreeSet::new();
        let mut order = Vec::new();

        for channel in &config.channels {
            let slot = channel.device_channel.ok_or_else(|| {
                ConfigError::channel(&config.name, &channel.key, "DeviceChannel is required")
            })?;
            let range = channel.extra_f64("Range");
            let nplc = channel.extra_f64("NPLC");

            let conf = match channel.selector() {
                "DCV" => format!("CONF:VOLT:DC {},(@{})", range_and_resolution(range), slot),
                "ACV" => format!("CONF:VOLT:AC {},(@{})", range_and_resolution(range), slot),
                "RES" => match range {
                    Some(_) => format!("CONF:RES {},(@{})", range_and_resolution(range), slot),
                    None => format!("CONF:RES (@{})", slot),
                },
                "TEMPJ" => format!("CONF:TEMP TC,J,(@{})", slot),
                _ => return Err(unknown_channel(config, channel)),
            };
            self.setup.push(conf);
            if let Some(nplc) = nplc {
                if channel.selector() == "DCV" {
                    self.setup.push(format!("VOLT:DC:NPLC {:.6},(@{})", nplc, slot));
                }
            }

            if scanned.insert(slot) {
                order.push(slot.to_string());
            }
            self.channels.push(ScpiChannel::Scan(slot));
        }

        let spec = order.join(",");
        if let Some(aperture) = config.param_f64("AveragingTime") {
            self.setup.push(format!("VOLT:DC:APER:ENAB ON,(@{})", spec));
            self.setup.push(format!("VOLT:DC:APER {:.6},(@{})", aperture, spec));
        }
        self.setup.push(format!("ROUT:SCAN (@{})", spec));
        self.setup.push("TRIG:COUNT 1".into());
        self.setup.push("FORM:READ:CHAN ON".into());
        self.scan = Some(ScanList {
            channels: scanned,
            spec,
        });
        Ok(())
    }

    /// Identify and configure a freshly opened link.
    #[instrument(skip(self, link), fields(device = %self.device))]
    pub(crate) async fn start_session(&self, mut link: Link) -> Result<ScpiSession, DeviceError> {
        if self.dialect == Dialect::Standard {
            let idn = link.query_line(&self.terminated("*IDN?")).await?;
            match &self.idn {
                Some(expected) if expected.trim() != idn => {
                    warn!(received = %idn, expected = %expected, "Instrument IDN does not match VISAIDN");
                }
                Some(_) => debug!(idn = %idn, "Instrument IDN matches"),
                None => info!(idn = %idn, "Connected"),
            }
        }

        if let Some(cmd) = &self.cmd_on_init {
            info!(command = %cmd, "Sending initialization command");
            self.write_command(&mut link, cmd).await?;
        }
        for cmd in &self.setup {
            self.write_command(&mut link, cmd).await?;
        }

        Ok(ScpiSession {
            link,
            scan: HashMap::new(),
        })
    }

    async fn read_scan(&self, session: &mut ScpiSession) -> Result<(), DeviceError> {
        let Some(scan) = &self.scan else {
            return Ok(());
        };
        session.scan.clear();
        self.write_command(&mut session.link, &format!("ROUT:SCAN (@{})", scan.spec))
            .await?;
        let response = session.link.query_line(&self.terminated("READ?")).await?;
        let values = parse_scan(&response)?;

        let unexpected: Vec<String> = values
            .iter()
            .filter(|(ch, _)| !scan.channels.contains(ch))
            .map(|(ch, _)| ch.to_string())
            .collect();
        if !unexpected.is_empty() {
            return Err(DeviceError::malformed(format!(
                "returned measurements (channel(s) {}) do not match requested channel(s) ({})",
                unexpected.join(","),
                scan.spec
            )));
        }
        session.scan.extend(values);
        Ok(())
    }

    fn terminated(&self, command: &str) -> String {
        format!("{}{}", command, self.dialect.terminator())
    }

    async fn write_command(&self, link: &mut Link, command: &str) -> Result<(), DeviceError> {
        debug!(command = %command, "SCPI write");
        link.send(self.terminated(command).as_bytes()).await
    }
}

/// Range and 6½-digit resolution arguments, or autorange.
fn range_and_resolution(range: Option<f64>) -> String {
    match range {
        Some(r) => format!("{:.12},{:.18}", r, r * 1e-6),
        None => "AUTO,DEF".to_string(),
    }
}

fn pm100_query(selector: &str) -> Option<(&'static str, ResponseKind)> {
    Some(match selector {
        "Power" => ("MEAS:POW?", ResponseKind::Float),
        "PowerUnit" => ("SENS:POW:UNIT?", ResponseKind::Text),
        "PowerAutoRange" => ("SENS:POW:RANG:AUTO?", ResponseKind::Boolean),
        "Wavelength" => ("SENS:CORR:WAV?", ResponseKind::Float),
        "BeamDiameter" => ("SENS:CORR:BEAM?", ResponseKind::Float),
        "NumAverages" => ("SENS:AVER:COUN?", ResponseKind::Integer),
        "ZeroMagnitude" => ("SENS:CORR:COLL:ZERO:MAGN?", ResponseKind::Float),
        _ => return None,
    })
}

fn generic_query(config: &DeviceConfig, channel: &ChannelConfig) -> Result<ScpiChannel, ConfigError> {
    if channel.selector() != "Query" {
        return Err(unknown_channel(config, channel));
    }
    let command = channel.extra_str("Command").ok_or_else(|| {
        ConfigError::channel(&config.name, &channel.key, "Query channels need a Command")
    })?;
    let kind = match channel
        .extra_str("ResponseType")
        .unwrap_or_else(|| "float".into())
        .to_ascii_lowercase()
        .as_str()
    {
        "float" => ResponseKind::Float,
        "integer" => ResponseKind::Integer,
        "text" => ResponseKind::Text,
        "boolean" => ResponseKind::Boolean,
        other => {
            return Err(ConfigError::channel(
                &config.name,
                &channel.key,
                format!("unknown ResponseType '{}'", other),
            ))
        }
    };
    Ok(ScpiChannel::Query { command, kind })
}

fn red_pitaya_resource(config: &DeviceConfig) -> Result<Resource, ConfigError> {
    let host = config.address.trim();
    if host.is_empty() {
        return Err(ConfigError::device(&config.name, "Address must be the lockbox host"));
    }
    let port = match config
        .params
        .get("SCPIConnectionParams")
        .and_then(|p| p.get("Port"))
    {
        None => RED_PITAYA_PORT,
        Some(value) => value
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                ConfigError::device(
                    &config.name,
                    format!("SCPIConnectionParams.Port {} is not a TCP port", value),
                )
            })?,
    };
    Ok(Resource::Tcp {
        host: host.to_string(),
        port,
    })
}

/// Query for one lockbox channel.
fn lockbox_query(config: &DeviceConfig, channel: &ChannelConfig) -> Result<String, ConfigError> {
    let invalid = |message: String| ConfigError::channel(&config.name, &channel.key, message);
    let gain = match channel.selector() {
        "FastAnalogIn" | "FastAnalogOut" => {
            let direction = if channel.selector() == "FastAnalogIn" {
                "IN"
            } else {
                "OUT"
            };
            return match channel.device_channel {
                Some(n @ (1 | 2)) => Ok(format!("ANALOG:{}{}:VOLT?", direction, n)),
                Some(n) => Err(invalid(format!("DeviceChannel {} is not 1 or 2", n))),
                None => Err(invalid("DeviceChannel is required".into())),
            };
        }
        "GlobalGain" => "KG",
        "PGain" => "KP",
        "IGain" => "KI",
        "IIGain" => "KII",
        "DGain" => "KD",
        _ => return Err(unknown_channel(config, channel)),
    };

    let pid = channel
        .extra_str("PID")
        .ok_or_else(|| invalid("PID is required".into()))?;
    match pid.trim().as_bytes() {
        [input @ (b'1' | b'2'), output @ (b'1' | b'2')] => Ok(format!(
            "PID:IN{}:OUT{}:{}?",
            *input as char, *output as char, gain
        )),
        _ => Err(invalid(format!(
            "invalid PID '{}', expected one of 11, 12, 21, 22",
            pid
        ))),
    }
}

/// Parse `value,channel,value,channel,...` as returned with `FORM:READ:CHAN ON`.
fn parse_scan(response: &str) -> Result<Vec<(u32, f64)>, DeviceError> {
    let fields: Vec<&str> = response.trim().split(',').map(str::trim).collect();
    if fields.len() % 2 != 0 || fields.iter().all(|f| f.is_empty()) {
        return Err(DeviceError::malformed(format!(
            "scan response '{}' is not value,channel pairs",
            response.trim()
        )));
    }
    fields
        .chunks(2)
        .map(|pair| {
            let value = parse_f64(pair[0])?;
            let channel = parse_f64(pair[1])?;
            if channel.fract() != 0.0 || channel < 0.0 {
                return Err(DeviceError::malformed(format!(
                    "'{}' is not a channel number",
                    pair[1]
                )));
            }
            Ok((channel as u32, value))
        })
        .collect()
}

#[async_trait]
impl DeviceDriver for ScpiDriver {
    type Session = ScpiSession;

    async fn open(&self) -> Result<ScpiSession, DeviceError> {
        let stream = resource::open(&self.resource, self.serial, &self.device).await?;
        self.start_session(Link::new(stream)).await
    }

    async fn prepare_cycle(&self, session: &mut ScpiSession) -> Result<(), DeviceError> {
        self.read_scan(session).await
    }

    async fn read_channel(
        &self,
        session: &mut ScpiSession,
        channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        match self.channels.get(channel) {
            Some(ScpiChannel::Scan(slot)) => session
                .scan
                .get(slot)
                .copied()
                .map(FieldValue::Float)
                .ok_or_else(|| {
                    DeviceError::malformed(format!("channel {} missing from scan", slot))
                }),
            Some(ScpiChannel::Query { command, kind }) => {
                let response = session.link.query_line(&self.terminated(command)).await?;
                kind.parse(&response)
            }
            None => Err(DeviceError::malformed(format!("no channel {}", channel))),
        }
    }

    async fn close(&self, mut session: ScpiSession) {
        session.link.drain(Duration::from_millis(10)).await;
        debug!(device = %self.device, "SCPI session closed");
    }
}
