//! KJLC XCG convection gauges read through an ADS1115 ADC on an I2C bus.
//!
//! The gauge's analog output is sampled in single-shot mode: write the config
//! register (0x01) with the OS bit set, wait for the conversion, read the signed
//! 16-bit result from the conversion register (0x00). Volts are returned; the
//! pressure curve is left to the channel's `Converter`.
//!
//! Channel extras: `I2CAddress` (hexadecimal, `"0x48"` or `"48"`), `Pins {Signal,
//! Reference}` (a missing reference selects single-ended input) and `Gain` (2/3, 1, 2, 4, 8, 16).
//! The entry's `Address` is the bus device, `/dev/i2c-1` when empty.

#![cfg_attr(
    not(all(feature = "instrument_i2c", target_os = "linux")),
    allow(dead_code)
)]

use super::{unknown_channel, DeviceDriver};
use crate::config::{ChannelConfig, DeviceConfig};
use crate::error::{ConfigError, DeviceError};
use crate::reading::FieldValue;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BUS: &str = "/dev/i2c-1";
const DEFAULT_ADS_ADDRESS: u16 = 0x48;

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

const OS_SINGLE: u16 = 1 << 15;
const MODE_SINGLE_SHOT: u16 = 1 << 8;
/// 860 samples per second.
const DATA_RATE_860: u16 = 0b111 << 5;
const COMPARATOR_DISABLED: u16 = 0b11;

/// Conversion time at 860 SPS is about 1.2 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(2);

/// Programmable gain setting and its full-scale range in volts.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Gain {
    bits: u16,
    full_scale: f64,
}

impl Gain {
    fn from_value(gain: f64) -> Option<Self> {
        const TABLE: [(f64, u16, f64); 6] = [
            (2.0 / 3.0, 0b000, 6.144),
            (1.0, 0b001, 4.096),
            (2.0, 0b010, 2.048),
            (4.0, 0b011, 1.024),
            (8.0, 0b100, 0.512),
            (16.0, 0b101, 0.256),
        ];
        TABLE
            .iter()
            .find(|(g, _, _)| (g - gain).abs() < 1e-3)
            .map(|&(_, bits, full_scale)| Gain { bits, full_scale })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AdcChannel {
    address: u16,
    mux: u16,
    gain: Gain,
}

impl AdcChannel {
    fn config_word(&self) -> u16 {
        OS_SINGLE
            | (self.mux << 12)
            | (self.gain.bits << 9)
            | MODE_SINGLE_SHOT
            | DATA_RATE_860
            | COMPARATOR_DISABLED
    }

    fn volts(&self, raw: i16) -> f64 {
        f64::from(raw) * self.gain.full_scale / 32768.0
    }
}

/// Input multiplexer code for a signal/reference pin pair.
fn mux_bits(signal: u8, reference: Option<u8>) -> Option<u16> {
    match (signal, reference) {
        (0, Some(1)) => Some(0b000),
        (0, Some(3)) => Some(0b001),
        (1, Some(3)) => Some(0b010),
        (2, Some(3)) => Some(0b011),
        (n @ 0..=3, None) => Some(0b100 + u16::from(n)),
        _ => None,
    }
}

/// I2C ADC driver.
#[derive(Debug)]
pub struct I2cDriver {
    device: String,
    bus: String,
    channels: Vec<AdcChannel>,
}

/// Open bus handles, one per ADC address.
pub struct I2cSession {
    #[cfg(all(feature = "instrument_i2c", target_os = "linux"))]
    adcs: HashMap<u16, i2cdev::linux::LinuxI2CDevice>,
    #[cfg(not(all(feature = "instrument_i2c", target_os = "linux")))]
    adcs: HashMap<u16, ()>,
}

impl std::fmt::Debug for I2cSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I2cSession")
            .field("adcs", &self.adcs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl I2cDriver {
    /// Build from a device entry.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let channels = config
            .channels
            .iter()
            .map(|channel| adc_channel(config, channel))
            .collect::<Result<Vec<_>, _>>()?;
        let bus = if config.address.is_empty() {
            DEFAULT_BUS.to_string()
        } else {
            config.address.clone()
        };
        Ok(Self {
            device: config.name.clone(),
            bus,
            channels,
        })
    }
}

fn adc_channel(config: &DeviceConfig, channel: &ChannelConfig) -> Result<AdcChannel, ConfigError> {
    if channel.selector() != "Pressure" {
        return Err(unknown_channel(config, channel));
    }
    let invalid = |message: String| ConfigError::channel(&config.name, &channel.key, message);

    let address = match channel.extra_str("I2CAddress") {
        None => DEFAULT_ADS_ADDRESS,
        Some(text) => parse_address(&text)
            .ok_or_else(|| invalid(format!("invalid I2CAddress '{}'", text)))?,
    };

    let pins = channel.extra_value("Pins");
    let pin = |name: &str| -> Option<u8> {
        pins.and_then(|p| p.get(name))
            .and_then(Value::as_u64)
            .and_then(|n| u8::try_from(n).ok())
    };
    let signal = pin("Signal").unwrap_or(0);
    let reference = pin("Reference");
    let mux = mux_bits(signal, reference).ok_or_else(|| {
        invalid(format!(
            "unsupported pin pair Signal={} Reference={:?}",
            signal, reference
        ))
    })?;

    let gain_value = channel.extra_f64("Gain").unwrap_or(1.0);
    let gain = Gain::from_value(gain_value)
        .ok_or_else(|| invalid(format!("unsupported Gain {}", gain_value)))?;

    Ok(AdcChannel { address, mux, gain })
}

/// Bus addresses are hexadecimal, with or without the `0x` prefix.
fn parse_address(text: &str) -> Option<u16> {
    let text = text.trim();
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u16::from_str_radix(hex, 16).ok()
}

#[cfg(all(feature = "instrument_i2c", target_os = "linux"))]
mod bus {
    use super::{AdcChannel, CONVERSION_WAIT, REG_CONFIG, REG_CONVERSION};
    use crate::error::DeviceError;
    use i2cdev::core::I2CDevice;
    use i2cdev::linux::LinuxI2CDevice;

    pub(super) fn open(path: &str, address: u16) -> Result<LinuxI2CDevice, DeviceError> {
        LinuxI2CDevice::new(path, address)
            .map_err(|e| DeviceError::connection(format!("{} @ {:#04x}: {}", path, address, e)))
    }

    /// Blocking single-shot conversion.
    pub(super) fn convert(dev: &mut LinuxI2CDevice, channel: &AdcChannel) -> Result<i16, DeviceError> {
        let [hi, lo] = channel.config_word().to_be_bytes();
        dev.write(&[REG_CONFIG, hi, lo])
            .map_err(|e| DeviceError::transient(format!("config write failed: {}", e)))?;
        std::thread::sleep(CONVERSION_WAIT);
        dev.write(&[REG_CONVERSION])
            .map_err(|e| DeviceError::transient(format!("register select failed: {}", e)))?;
        let mut buf = [0u8; 2];
        dev.read(&mut buf)
            .map_err(|e| DeviceError::transient(format!("conversion read failed: {}", e)))?;
        Ok(i16::from_be_bytes(buf))
    }
}

#[async_trait]
impl DeviceDriver for I2cDriver {
    type Session = I2cSession;

    #[cfg(all(feature = "instrument_i2c", target_os = "linux"))]
    async fn open(&self) -> Result<I2cSession, DeviceError> {
        let mut adcs = HashMap::new();
        for channel in &self.channels {
            if !adcs.contains_key(&channel.address) {
                let dev = bus::open(&self.bus, channel.address)?;
                adcs.insert(channel.address, dev);
            }
        }
        tracing::debug!(device = %self.device, bus = %self.bus, adcs = adcs.len(), "I2C bus opened");
        Ok(I2cSession { adcs })
    }

    #[cfg(not(all(feature = "instrument_i2c", target_os = "linux")))]
    async fn open(&self) -> Result<I2cSession, DeviceError> {
        Err(DeviceError::connection(format!(
            "{}: I2C support not enabled in this build (feature instrument_i2c, Linux only); bus {}",
            self.device, self.bus
        )))
    }

    #[cfg(all(feature = "instrument_i2c", target_os = "linux"))]
    async fn read_channel(
        &self,
        session: &mut I2cSession,
        channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        let input = self
            .channels
            .get(channel)
            .cloned()
            .ok_or_else(|| DeviceError::malformed(format!("no channel {}", channel)))?;
        let mut dev = session
            .adcs
            .remove(&input.address)
            .ok_or_else(|| DeviceError::connection("ADC handle missing from session"))?;
        let (dev, raw) = tokio::task::spawn_blocking(move || {
            let raw = bus::convert(&mut dev, &input);
            (dev, raw.map(|r| input.volts(r)))
        })
        .await
        .map_err(|e| DeviceError::connection(format!("I2C task failed: {}", e)))?;
        session.adcs.insert(self.channels[channel].address, dev);
        Ok(FieldValue::Float(raw?))
    }

    #[cfg(not(all(feature = "instrument_i2c", target_os = "linux")))]
    async fn read_channel(
        &self,
        _session: &mut I2cSession,
        _channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        Err(DeviceError::connection("I2C support not enabled in this build"))
    }

    async fn close(&self, session: I2cSession) {
        drop(session.adcs);
    }
}
