//! Binary-framed instruments on serial ports.
//!
//! # KJLC ACG capacitance manometer
//!
//! The gauge streams a 9-byte frame every 10 ms without being asked:
//!
//! ```text
//! [0x07, b1, b2, status, p_hi, p_lo, b6, fsr, checksum]
//! checksum = (b1 + .. + fsr) & 0xFF
//! pressure = u16(p_hi, p_lo) / 32000 * MANTISSA[fsr & 0x0F] * 10^((fsr >> 4) - 3)   [Torr]
//! ```
//!
//! Status bits other than the two setpoint flags (0b0001_1000) are errors.
//!
//! # Vacom CU-100 cold cathode controller
//!
//! A fixed 22-byte request followed by a CRC-16/MODBUS (little endian). The answer
//! carries the pressure in mbar as NUL-padded ASCII in bytes 6..22.

use super::{parse_f64, unknown_channel, DeviceDriver};
use crate::config::DeviceConfig;
use crate::error::{ConfigError, DeviceError};
use crate::reading::FieldValue;
use crate::transport::serial::{open_serial, SerialSettings};
use crate::transport::Link;
use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use std::time::Duration;
use tracing::debug;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const ACG_START: u8 = 0x07;
const ACG_FRAME_LEN: usize = 9;
/// Bytes inspected for a complete frame: two frames minus one byte.
const ACG_WINDOW: usize = 17;
const ACG_ERROR_MASK: u8 = 0b1110_0111;
const ACG_MANTISSA: [f64; 5] = [1.0, 1.1, 2.0, 2.5, 5.0];

const CU100_REQUEST: [u8; 22] = [
    0xA5, 0x50, 0x00, 0x00, 0x20, 0x10, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
const CU100_SETTLE: Duration = Duration::from_millis(100);

const DRAIN_WINDOW: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    KjlcAcg,
    VacomCu100,
}

/// Binary serial driver.
#[derive(Debug)]
pub struct BinarySerialDriver {
    device: String,
    path: String,
    serial: SerialSettings,
    protocol: Protocol,
}

/// Binary serial session.
#[derive(Debug)]
pub struct BinarySession {
    link: Link,
}

impl BinarySerialDriver {
    /// Build from a device entry.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        if config.address.is_empty() {
            return Err(ConfigError::device(&config.name, "serial Address is required"));
        }
        let protocol = match config.model.as_str() {
            "KJLC ACG" => Protocol::KjlcAcg,
            "Vacom CU-100" => Protocol::VacomCu100,
            other => {
                return Err(ConfigError::UnknownModel {
                    device: config.name.clone(),
                    model: other.to_string(),
                })
            }
        };
        for channel in &config.channels {
            if channel.selector() != "Pressure" {
                return Err(unknown_channel(config, channel));
            }
        }
        let mut params = config.serial_params();
        if config.serial.is_none() && protocol == Protocol::VacomCu100 {
            params.baudrate = 19200;
        }
        Ok(Self {
            device: config.name.clone(),
            path: config.address.clone(),
            serial: SerialSettings::from_params(&config.name, &params)?,
            protocol,
        })
    }

    async fn acg_pressure(&self, link: &mut Link) -> Result<f64, DeviceError> {
        link.drain(DRAIN_WINDOW).await;
        let window = link.read_exact(ACG_WINDOW).await?;
        let frame = find_acg_frame(&window)
            .ok_or_else(|| DeviceError::malformed("no valid frame in the received bytes"))?;
        decode_acg(frame)
    }

    async fn cu100_pressure(&self, link: &mut Link) -> Result<f64, DeviceError> {
        link.drain(Duration::ZERO).await;
        link.send(&cu100_request()).await?;
        tokio::time::sleep(CU100_SETTLE).await;
        let response = link.read_available(DRAIN_WINDOW, 64).await;
        decode_cu100(&response)
    }
}

/// Latest complete frame in `bytes`, checksum verified.
fn find_acg_frame(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < ACG_FRAME_LEN {
        return None;
    }
    (0..=bytes.len() - ACG_FRAME_LEN).rev().find_map(|i| {
        let frame = &bytes[i..i + ACG_FRAME_LEN];
        let sum = frame[1..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        (frame[0] == ACG_START && sum == frame[8]).then_some(frame)
    })
}

fn decode_acg(frame: &[u8]) -> Result<f64, DeviceError> {
    let status = frame[3];
    if status & ACG_ERROR_MASK != 0 {
        return Err(DeviceError::malformed(format!(
            "gauge reports error status {:#010b}",
            status
        )));
    }
    let raw = u16::from_be_bytes([frame[4], frame[5]]);
    let fsr = frame[7];
    let mantissa = ACG_MANTISSA
        .get(usize::from(fsr & 0x0F))
        .ok_or_else(|| DeviceError::malformed(format!("unknown full-scale code {:#04x}", fsr)))?;
    let exponent = i32::from(fsr >> 4) - 3;
    Ok(f64::from(raw) / 3.2e4 * mantissa * 10f64.powi(exponent))
}

fn cu100_request() -> Vec<u8> {
    let crc = MODBUS_CRC.checksum(&CU100_REQUEST);
    let mut request = CU100_REQUEST.to_vec();
    request.extend_from_slice(&crc.to_le_bytes());
    request
}

fn decode_cu100(response: &[u8]) -> Result<f64, DeviceError> {
    if response.is_empty() {
        return Err(DeviceError::transient("no response received"));
    }
    if response.len() < 22 {
        return Err(DeviceError::malformed(format!(
            "response of {} bytes is too short",
            response.len()
        )));
    }
    let text = std::str::from_utf8(&response[6..22])
        .map_err(|_| DeviceError::malformed("pressure field is not ASCII"))?;
    parse_f64(text.trim_end_matches('\0'))
}

#[async_trait]
impl DeviceDriver for BinarySerialDriver {
    type Session = BinarySession;

    async fn open(&self) -> Result<BinarySession, DeviceError> {
        let stream = open_serial(&self.path, self.serial, &self.device).await?;
        Ok(BinarySession {
            link: Link::new(stream),
        })
    }

    async fn read_channel(
        &self,
        session: &mut BinarySession,
        _channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        let value = match self.protocol {
            Protocol::KjlcAcg => self.acg_pressure(&mut session.link).await?,
            Protocol::VacomCu100 => self.cu100_pressure(&mut session.link).await?,
        };
        Ok(FieldValue::Float(value))
    }

    async fn close(&self, _session: BinarySession) {
        debug!(device = %self.device, "Serial session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::testing::frame_instrument;

    fn acg_frame(status: u8, raw: u16, fsr: u8) -> Vec<u8> {
        let [hi, lo] = raw.to_be_bytes();
        let mut frame = vec![ACG_START, 0x01, 0x00, status, hi, lo, 0x00, fsr];
        let sum = frame[1..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        frame.push(sum);
        frame
    }

    #[test]
    fn acg_decoding() {
        // Half of full scale, 2.0 x 10^0 Torr range.
        let frame = acg_frame(0, 16000, 0x32);
        assert_eq!(decode_acg(&frame).unwrap(), 1.0);

        // 1.0 x 10^-2 Torr range.
        let frame = acg_frame(0b0001_1000, 32000, 0x10);
        assert!((decode_acg(&frame).unwrap() - 0.01).abs() < 1e-15);

        assert!(decode_acg(&acg_frame(0b0000_0001, 1, 0x30)).is_err());
        assert!(decode_acg(&acg_frame(0, 1, 0x39)).is_err());
    }

    #[test]
    fn acg_frame_search_skips_partial_and_corrupt_frames() {
        let good = acg_frame(0, 16000, 0x32);
        let mut corrupt = acg_frame(0, 20000, 0x32);
        corrupt[8] ^= 0xFF;

        let mut stream = good[5..].to_vec();
        stream.extend_from_slice(&good);
        stream.extend_from_slice(&corrupt[..4]);
        assert_eq!(find_acg_frame(&stream).unwrap(), &good[..]);

        let mut stream = good.clone();
        stream.extend_from_slice(&corrupt);
        assert_eq!(find_acg_frame(&stream).unwrap(), &good[..]);

        assert!(find_acg_frame(&corrupt).is_none());
    }

    #[test]
    fn cu100_request_carries_modbus_crc() {
        let request = cu100_request();
        assert_eq!(request.len(), 24);
        assert_eq!(&request[..22], &CU100_REQUEST);
        let crc = MODBUS_CRC.checksum(&CU100_REQUEST).to_le_bytes();
        assert_eq!(&request[22..], &crc);
    }

    #[test]
    fn cu100_decoding() {
        let mut response = vec![0xA5, 0x50, 0x00, 0x00, 0x20, 0x10];
        response.extend_from_slice(b"1.2E-09\0\0\0\0\0\0\0\0\0");
        response.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(decode_cu100(&response).unwrap(), 1.2e-9);
        assert!(decode_cu100(&[]).unwrap_err().is_transient());
        assert!(!decode_cu100(&response[..10]).unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn cu100_session_round_trip() {
        let devices = crate::config::parse_devices(
            r#"[{"Device": "CC", "Model": "Vacom CU-100", "Address": "/dev/ttyUSB3",
                 "measurement": "vacuum", "Channels": {"p": {"Type": "Pressure", "field-key": "p"}}}]"#,
            Duration::from_secs(1),
        )
        .unwrap();
        let d = BinarySerialDriver::from_config(&devices[0]).unwrap();
        assert_eq!(d.serial.baud_rate, 19200);

        let (link, log) = frame_instrument(24, |_| {
            let mut response = vec![0xA5, 0x50, 0x00, 0x00, 0x20, 0x10];
            response.extend_from_slice(b"5.0E-08\0\0\0\0\0\0\0\0\0\0\0");
            Some(response)
        });
        let mut session = BinarySession { link };
        assert_eq!(
            d.read_channel(&mut session, 0).await.unwrap(),
            FieldValue::Float(5.0e-8)
        );
        assert_eq!(log.lock()[0], cu100_request());
    }
}
