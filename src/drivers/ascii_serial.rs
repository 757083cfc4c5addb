//! ASCII command/response instruments on serial ports.
//!
//! | Model            | Query                      | Response                              |
//! |------------------|----------------------------|---------------------------------------|
//! | KJLC 354         | `#{addr}RD\r`              | `*{addr} 1.23E-07\r`, `?` on error    |
//! | SMC HRS012       | `STX {addr} R PV1 ETX`     | byte 3 = ACK, value in bytes 7..12 (0.1 °C) |
//! | SRS CTC100       | `{name}?\n`                | value terminated by `\r\n`            |
//! | Met One DR-528   | `4\r`                      | CSV report, header line then values   |
//! | Thorlabs MDT693B | `{axis}voltage?\r`         | `[ 12.34]`                            |
//! | Burleigh WA-1000 | `@Q\r\n`                   | 23 bytes, GHz in bytes 1..11          |
//!
//! Every query starts by draining stale input: RS-485 lines are multidrop and a cycle
//! cut off by its deadline may leave a late answer behind.

use super::{parse_f64, unknown_channel, DeviceDriver};
use crate::config::{ChannelConfig, DeviceConfig};
use crate::error::{ConfigError, DeviceError};
use crate::reading::FieldValue;
use crate::transport::serial::{open_serial, SerialSettings};
use crate::transport::Link;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// Quiet period that ends a stale-input drain.
const DRAIN_WINDOW: Duration = Duration::from_millis(20);

/// Quiet period that ends a DR-528 report.
const REPORT_IDLE: Duration = Duration::from_millis(300);

/// Settling time after Burleigh setup commands.
const BURLEIGH_SETTLE: Duration = Duration::from_millis(100);

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const ACK: u8 = 0x06;

#[derive(Debug, Clone, PartialEq)]
enum Protocol {
    Kjlc354 {
        address: String,
        confirm_filament: bool,
        combined_pressure: bool,
    },
    SmcHrs012 {
        address: String,
    },
    Ctc100,
    Dr528,
    Mdt693b,
    Burleigh,
}

#[derive(Debug, Clone, PartialEq)]
enum AsciiChannel {
    /// KJLC 354 pressure
    Pressure,
    /// SMC circulating fluid temperature, `PV1` or `SV1`
    Smc(&'static str),
    /// CTC100 query string
    Ctc(String),
    /// DR-528 report column
    Report(String),
    /// MDT693B axis voltage
    Axis(char),
    /// Burleigh frequency
    Frequency,
}

/// ASCII serial driver.
#[derive(Debug)]
pub struct AsciiSerialDriver {
    device: String,
    path: String,
    serial: SerialSettings,
    protocol: Protocol,
    channels: Vec<AsciiChannel>,
}

/// ASCII serial session.
#[derive(Debug)]
pub struct AsciiSession {
    link: Link,
    report: HashMap<String, f64>,
}

impl AsciiSerialDriver {
    /// Build from a device entry.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        if config.address.is_empty() {
            return Err(ConfigError::device(&config.name, "serial Address is required"));
        }
        let serial = SerialSettings::from_params(&config.name, &config.serial_params())?;

        let internal_address = || {
            config.param_str("InternalAddress").ok_or_else(|| {
                ConfigError::device(&config.name, "InternalAddress is required")
            })
        };

        let protocol = match config.model.as_str() {
            "KJLC 354" => Protocol::Kjlc354 {
                address: internal_address()?,
                confirm_filament: config.param_bool("ConfirmFilamentIsOn").unwrap_or(false),
                combined_pressure: config.param_bool("ReadCombinedPressure").unwrap_or(false),
            },
            "SMC HRS012" => Protocol::SmcHrs012 {
                address: internal_address()?,
            },
            "SRS CTC100" => Protocol::Ctc100,
            "Met One DR-528" => Protocol::Dr528,
            "Thorlabs MDT693B" => Protocol::Mdt693b,
            "Burleigh WA-1000" => Protocol::Burleigh,
            other => {
                return Err(ConfigError::UnknownModel {
                    device: config.name.clone(),
                    model: other.to_string(),
                })
            }
        };

        let channels = config
            .channels
            .iter()
            .map(|channel| parse_channel(config, &protocol, channel))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            device: config.name.clone(),
            path: config.address.clone(),
            serial,
            protocol,
            channels,
        })
    }

    /// Prepare a freshly opened link.
    pub(crate) async fn start_session(&self, mut link: Link) -> Result<AsciiSession, DeviceError> {
        if self.protocol == Protocol::Burleigh {
            // Reset to stored defaults, then stop automatic broadcasts.
            link.send(b"@\x0F\r\n").await?;
            tokio::time::sleep(BURLEIGH_SETTLE).await;
            link.send(b"@\x51\r\n").await?;
            tokio::time::sleep(BURLEIGH_SETTLE).await;
            link.drain(DRAIN_WINDOW).await;
        }
        Ok(AsciiSession {
            link,
            report: HashMap::new(),
        })
    }

    async fn kjlc_query(
        &self,
        link: &mut Link,
        address: &str,
        command: &str,
    ) -> Result<String, DeviceError> {
        link.drain(DRAIN_WINDOW).await;
        link.send(format!("#{}{}\r", address, command).as_bytes()).await?;
        let raw = link.read_until(b'\r').await?;
        let rsp = String::from_utf8(raw)
            .map_err(|_| DeviceError::malformed("response is not ASCII"))?;
        if rsp.starts_with('?') {
            return Err(DeviceError::malformed(format!(
                "error response '{}'",
                rsp.trim()
            )));
        }
        let ack = format!("*{} ", address);
        match rsp.strip_prefix(&ack) {
            Some(value) => Ok(value.trim().to_string()),
            None => Err(DeviceError::malformed(format!(
                "no acknowledgement in response '{}'",
                rsp.trim()
            ))),
        }
    }

    async fn kjlc_pressure(
        &self,
        link: &mut Link,
        address: &str,
        confirm_filament: bool,
        combined: bool,
    ) -> Result<f64, DeviceError> {
        if confirm_filament {
            let status = self.kjlc_query(link, address, "IGS").await?;
            if status.starts_with('0') {
                return Err(DeviceError::malformed(
                    "filament is not powered up, no pressure reading available",
                ));
            }
        }
        let command = if combined { "RDS" } else { "RD" };
        parse_f64(&self.kjlc_query(link, address, command).await?)
    }

    async fn smc_temperature(
        &self,
        link: &mut Link,
        address: &str,
        command: &str,
    ) -> Result<f64, DeviceError> {
        link.drain(DRAIN_WINDOW).await;
        let mut frame = vec![STX];
        frame.extend_from_slice(address.as_bytes());
        frame.push(b'R');
        frame.extend_from_slice(command.as_bytes());
        frame.push(ETX);
        link.send(&frame).await?;

        let rsp = link.read_until(b'\n').await?;
        if rsp.len() < 12 || rsp[3] != ACK {
            return Err(DeviceError::malformed(format!(
                "no acknowledgement in response {:?}",
                String::from_utf8_lossy(&rsp)
            )));
        }
        let digits = std::str::from_utf8(&rsp[7..12])
            .map_err(|_| DeviceError::malformed("temperature digits are not ASCII"))?;
        Ok(parse_f64(digits)? / 10.0)
    }

    async fn ctc_query(&self, link: &mut Link, command: &str) -> Result<f64, DeviceError> {
        link.drain(DRAIN_WINDOW).await;
        link.send(format!("{}\n", command).as_bytes()).await?;
        let rsp = link.read_line().await?;
        if !rsp.ends_with("\r\n") {
            return Err(DeviceError::malformed(
                "response does not end with CRLF as expected",
            ));
        }
        parse_f64(&rsp)
    }

    #[instrument(skip(self, session), fields(device = %self.device))]
    async fn read_report(&self, session: &mut AsciiSession) -> Result<(), DeviceError> {
        session.report.clear();
        session.link.drain(DRAIN_WINDOW).await;
        session.link.send(b"4\r").await?;
        let raw = session.link.read_available(REPORT_IDLE, 64 * 1024).await;
        let text = String::from_utf8_lossy(&raw);
        session.report = parse_report(&text)?;
        debug!(columns = session.report.len(), "Particle counter report");
        Ok(())
    }

    async fn mdt_voltage(&self, link: &mut Link, axis: char) -> Result<f64, DeviceError> {
        link.drain(DRAIN_WINDOW).await;
        link.send(format!("{}voltage?\r", axis).as_bytes()).await?;
        let raw = link.read_until(b']').await?;
        let text = String::from_utf8_lossy(&raw);
        let start = text
            .rfind('[')
            .ok_or_else(|| DeviceError::malformed(format!("no bracketed value in '{}'", text)))?;
        parse_f64(text[start + 1..].trim_end_matches(']'))
    }

    async fn burleigh_frequency(&self, link: &mut Link) -> Result<f64, DeviceError> {
        link.drain(DRAIN_WINDOW).await;
        link.send(b"@\x51\r\n").await?;
        let rsp = link.read_exact(23).await?;
        let ghz = std::str::from_utf8(&rsp[1..11])
            .map_err(|_| DeviceError::malformed("frequency digits are not ASCII"))?;
        Ok(1e9 * parse_f64(ghz)?)
    }
}

fn parse_channel(
    config: &DeviceConfig,
    protocol: &Protocol,
    channel: &ChannelConfig,
) -> Result<AsciiChannel, ConfigError> {
    let selector = channel.selector();
    let missing = |key: &str| ConfigError::channel(&config.name, &channel.key, format!("{} is required", key));

    let parsed = match protocol {
        Protocol::Kjlc354 { .. } if selector == "Pressure" => AsciiChannel::Pressure,
        Protocol::SmcHrs012 { .. } => match selector {
            "PV1" => AsciiChannel::Smc("PV1"),
            "SV1" => AsciiChannel::Smc("SV1"),
            _ => return Err(unknown_channel(config, channel)),
        },
        Protocol::Ctc100 => {
            let name = || {
                channel
                    .extra_str("CTC100ChannelName")
                    .ok_or_else(|| missing("CTC100ChannelName"))
            };
            match selector {
                "Temperature" | "HeaterPower" => AsciiChannel::Ctc(format!("{}?", name()?)),
                "PIDSetpoint" => AsciiChannel::Ctc(format!("{}.PID.Setpoint?", name()?)),
                "Custom" => AsciiChannel::Ctc(
                    channel
                        .extra_str("CTC100CustomCommand")
                        .ok_or_else(|| missing("CTC100CustomCommand"))?,
                ),
                _ => return Err(unknown_channel(config, channel)),
            }
        }
        Protocol::Dr528 => AsciiChannel::Report(selector.to_string()),
        Protocol::Mdt693b if selector == "Vout" => {
            let axis = channel
                .extra_str("Axis")
                .ok_or_else(|| missing("Axis"))?
                .trim()
                .to_ascii_lowercase();
            match axis.as_str() {
                "x" | "y" | "z" => AsciiChannel::Axis(axis.chars().next().unwrap_or('x')),
                other => {
                    return Err(ConfigError::channel(
                        &config.name,
                        &channel.key,
                        format!("Axis must be x, y or z, got '{}'", other),
                    ))
                }
            }
        }
        Protocol::Burleigh if selector == "Frequency" => AsciiChannel::Frequency,
        _ => return Err(unknown_channel(config, channel)),
    };
    Ok(parsed)
}

/// Parse a DR-528 report: the last two lines are the CSV header and the values.
fn parse_report(text: &str) -> Result<HashMap<String, f64>, DeviceError> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < 2 {
        return Err(DeviceError::transient("no report received"));
    }
    let header = lines[lines.len() - 2];
    let values = lines[lines.len() - 1];

    header
        .split(',')
        .zip(values.split(','))
        .skip(1)
        .take(10)
        .map(|(key, value)| Ok((key.trim().to_string(), parse_f64(value)?)))
        .collect()
}

#[async_trait]
impl DeviceDriver for AsciiSerialDriver {
    type Session = AsciiSession;

    async fn open(&self) -> Result<AsciiSession, DeviceError> {
        let stream = open_serial(&self.path, self.serial, &self.device).await?;
        self.start_session(Link::new(stream)).await
    }

    async fn prepare_cycle(&self, session: &mut AsciiSession) -> Result<(), DeviceError> {
        if self.protocol == Protocol::Dr528 {
            self.read_report(session).await?;
        }
        Ok(())
    }

    async fn read_channel(
        &self,
        session: &mut AsciiSession,
        channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        let kind = self
            .channels
            .get(channel)
            .ok_or_else(|| DeviceError::malformed(format!("no channel {}", channel)))?;
        let link = &mut session.link;

        let value = match (&self.protocol, kind) {
            (
                Protocol::Kjlc354 {
                    address,
                    confirm_filament,
                    combined_pressure,
                },
                AsciiChannel::Pressure,
            ) => {
                self.kjlc_pressure(link, address, *confirm_filament, *combined_pressure)
                    .await?
            }
            (Protocol::SmcHrs012 { address }, AsciiChannel::Smc(command)) => {
                self.smc_temperature(link, address, command).await?
            }
            (_, AsciiChannel::Ctc(command)) => self.ctc_query(link, command).await?,
            (_, AsciiChannel::Report(column)) => {
                *session.report.get(column).ok_or_else(|| {
                    DeviceError::malformed(format!("column '{}' missing from report", column))
                })?
            }
            (_, AsciiChannel::Axis(axis)) => self.mdt_voltage(link, *axis).await?,
            (_, AsciiChannel::Frequency) => self.burleigh_frequency(link).await?,
            _ => {
                return Err(DeviceError::malformed(
                    "channel does not match the instrument protocol",
                ))
            }
        };
        Ok(FieldValue::Float(value))
    }

    async fn close(&self, mut session: AsciiSession) {
        session.link.drain(Duration::ZERO).await;
        debug!(device = %self.device, "Serial session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_devices;
    use crate::drivers::testing::{commands, frame_instrument, line_instrument};

    fn driver(model: &str, params: &str, channels: &str) -> AsciiSerialDriver {
        let json = format!(
            r#"[{{"Device": "D", "Model": "{model}", "Address": "/dev/ttyUSB0",
                  "DeviceSpecificParams": {params}, "measurement": "m",
                  "Channels": {channels}}}]"#
        );
        let devices = parse_devices(&json, Duration::from_secs(1)).unwrap();
        AsciiSerialDriver::from_config(&devices[0]).unwrap()
    }

    async fn read(d: &AsciiSerialDriver, link: Link, channel: usize) -> Result<FieldValue, DeviceError> {
        let mut session = d.start_session(link).await?;
        d.prepare_cycle(&mut session).await?;
        d.read_channel(&mut session, channel).await
    }

    #[tokio::test]
    async fn kjlc354_pressure_with_filament_check() {
        let d = driver(
            "KJLC 354",
            r#"{"InternalAddress": "01", "ConfirmFilamentIsOn": true}"#,
            r#"{"p": {"Type": "Pressure", "field-key": "p"}}"#,
        );
        let (link, log) = line_instrument(b'\r', |cmd| match cmd {
            b"#01IGS\r" => Some(b"*01 1 IG ON\r".to_vec()),
            b"#01RD\r" => Some(b"*01 1.23E-07\r".to_vec()),
            _ => None,
        });
        assert_eq!(read(&d, link, 0).await.unwrap(), FieldValue::Float(1.23e-7));
        assert_eq!(commands(&log), ["#01IGS\r", "#01RD\r"]);
    }

    #[tokio::test]
    async fn kjlc354_error_responses() {
        let d = driver(
            "KJLC 354",
            r#"{"InternalAddress": "01", "ConfirmFilamentIsOn": true, "ReadCombinedPressure": true}"#,
            r#"{"p": {"Type": "Pressure", "field-key": "p"}}"#,
        );
        let (link, _) = line_instrument(b'\r', |_| Some(b"*01 0 IG OFF\r".to_vec()));
        let err = read(&d, link, 0).await.unwrap_err();
        assert!(err.to_string().contains("filament"));

        let (link, _) = line_instrument(b'\r', |_| Some(b"?01 SYNTX ER\r".to_vec()));
        assert!(!read(&d, link, 0).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn smc_temperature_frame() {
        let d = driver(
            "SMC HRS012",
            r#"{"InternalAddress": "01"}"#,
            r#"{"t": {"Type": "PV1", "field-key": "t"}}"#,
        );
        let (link, log) = line_instrument(ETX, |_| Some(b"\x0201\x06PV1+0215\x03\r\n".to_vec()));
        assert_eq!(read(&d, link, 0).await.unwrap(), FieldValue::Float(21.5));
        assert_eq!(log.lock()[0], b"\x0201RPV1\x03".to_vec());
    }

    #[tokio::test]
    async fn smc_without_ack_is_malformed() {
        let d = driver(
            "SMC HRS012",
            r#"{"InternalAddress": "01"}"#,
            r#"{"t": {"Type": "SV1", "field-key": "t"}}"#,
        );
        let (link, _) = line_instrument(ETX, |_| Some(b"\x0201\x15SV1+0215\x03\r\n".to_vec()));
        assert!(!read(&d, link, 0).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn ctc100_queries() {
        let d = driver(
            "SRS CTC100",
            "{}",
            r#"{"t": {"Type": "PIDSetpoint", "field-key": "t", "tags": {"CTC100ChannelName": "In1"}},
                "c": {"Type": "Custom", "field-key": "c", "CTC100CustomCommand": "Out1.Max?"}}"#,
        );
        let (link, log) = line_instrument(b'\n', |cmd| match cmd {
            b"In1.PID.Setpoint?\n" => Some(b"4.2\r\n".to_vec()),
            b"Out1.Max?\n" => Some(b"1.5\n".to_vec()),
            _ => None,
        });
        let mut s = d.start_session(link).await.unwrap();
        assert_eq!(d.read_channel(&mut s, 0).await.unwrap(), FieldValue::Float(4.2));
        // Missing CR.
        assert!(d.read_channel(&mut s, 1).await.is_err());
        assert_eq!(commands(&log).len(), 2);
    }

    #[tokio::test]
    async fn dr528_report_columns() {
        let d = driver(
            "Met One DR-528",
            "{}",
            r#"{"0.3": {"field-key": "n03"}, "AT": {"field-key": "temp"}}"#,
        );
        let (link, _) = line_instrument(b'\r', |_| {
            Some(
                b"OK\r\nTime,0.3,0.5,1.0,2.0,5.0,10.0,AT,RH,Loc,Extra\r\n\
                  2024-01-01 00:00,120,60,20,5,1,0,21.5,40,1,99\r\n"
                    .to_vec(),
            )
        });
        let mut s = d.start_session(link).await.unwrap();
        d.prepare_cycle(&mut s).await.unwrap();
        assert_eq!(d.read_channel(&mut s, 0).await.unwrap(), FieldValue::Float(120.0));
        assert_eq!(d.read_channel(&mut s, 1).await.unwrap(), FieldValue::Float(21.5));
    }

    #[tokio::test]
    async fn mdt693b_axis_voltage() {
        let d = driver(
            "Thorlabs MDT693B",
            "{}",
            r#"{"y": {"Type": "Vout", "Axis": "Y", "field-key": "vy"}}"#,
        );
        let (link, log) = line_instrument(b'\r', |_| Some(b"[ 37.25]\r>".to_vec()));
        assert_eq!(read(&d, link, 0).await.unwrap(), FieldValue::Float(37.25));
        assert_eq!(commands(&log), ["yvoltage?\r"]);
    }

    #[tokio::test]
    async fn burleigh_frequency_in_hz() {
        let d = driver(
            "Burleigh WA-1000",
            "{}",
            r#"{"f": {"Type": "Frequency", "field-key": "f"}}"#,
        );
        let (link, log) = frame_instrument(4, |req| match req {
            b"@\x51\r\n" => Some(b"~384230.4840, 00000000\r\n"[..23].to_vec()),
            _ => None,
        });
        let value = read(&d, link, 0).await.unwrap().as_f64().unwrap();
        assert!((value - 384230.484e9).abs() < 1.0);
        assert_eq!(log.lock()[0], b"@\x0F\r\n".to_vec());
    }

    #[test]
    fn channel_validation() {
        let devices = parse_devices(
            r#"[{"Device": "D", "Model": "SRS CTC100", "Address": "/dev/ttyUSB0",
                 "measurement": "m", "Channels": {"t": {"Type": "Temperature", "field-key": "t"}}}]"#,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(AsciiSerialDriver::from_config(&devices[0]).is_err());

        let devices = parse_devices(
            r#"[{"Device": "D", "Model": "KJLC 354", "measurement": "m",
                 "DeviceSpecificParams": {"InternalAddress": "01"},
                 "Channels": {"p": {"Type": "Pressure", "field-key": "p"}}}]"#,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(AsciiSerialDriver::from_config(&devices[0]).is_err());
    }
}
