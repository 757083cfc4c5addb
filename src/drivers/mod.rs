//! Instrument drivers.
//!
//! Each transport family implements [`DeviceDriver`]: open a session, optionally read
//! the whole device once per cycle, read one channel, close. [`Driver`] is the closed
//! set of families, selected from the entry's `Model` key when the configuration
//! loads, so the poller and scheduler never see protocol details.
//!
//! | Family          | Models                                                        |
//! |-----------------|---------------------------------------------------------------|
//! | `scpi`          | Keysight DAQ973A, Thorlabs PM100, Red Pitaya Lockbox, generic SCPI |
//! | `ascii_serial`  | KJLC 354, SMC HRS012, SRS CTC100, Met One DR-528, Thorlabs MDT693B, Burleigh WA-1000 |
//! | `binary_serial` | KJLC ACG, Vacom CU-100                                        |
//! | `http`          | PurpleAir                                                     |
//! | `i2c`           | KJLC XCG (ADS1115 front-end)                                  |
//! | `vendor_tcp`    | Pfeiffer TPG366, Cryomech CPA1110                             |
//! | `simulated`     | Simulated                                                     |

pub mod ascii_serial;
pub mod binary_serial;
pub mod http;
pub mod i2c;
pub mod scpi;
pub mod simulated;
pub mod vendor_tcp;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::{ChannelConfig, DeviceConfig};
use crate::error::{ConfigError, DeviceError};
use crate::reading::FieldValue;
use async_trait::async_trait;

pub use ascii_serial::AsciiSerialDriver;
pub use binary_serial::BinarySerialDriver;
pub use http::HttpDriver;
pub use i2c::I2cDriver;
pub use scpi::ScpiDriver;
pub use simulated::SimulatedDriver;
pub use vendor_tcp::VendorTcpDriver;

/// Capability set of one transport family.
///
/// `channel` arguments index the device's channels in document order.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Live transport handle, owned by exactly one poller.
    type Session: Send;

    /// Establish the transport.
    async fn open(&self) -> Result<Self::Session, DeviceError>;

    /// Whole-device readout executed once per cycle before the channel reads.
    async fn prepare_cycle(&self, _session: &mut Self::Session) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Query one channel and parse its raw value.
    async fn read_channel(
        &self,
        session: &mut Self::Session,
        channel: usize,
    ) -> Result<FieldValue, DeviceError>;

    /// Release the transport. Errors are logged, never returned.
    async fn close(&self, session: Self::Session);
}

/// Driver selected for one device entry.
#[derive(Debug)]
pub enum Driver {
    /// SCPI over VISA-style resources
    Scpi(ScpiDriver),
    /// ASCII line protocols on serial ports
    AsciiSerial(AsciiSerialDriver),
    /// Binary frame protocols on serial ports
    BinarySerial(BinarySerialDriver),
    /// HTTP/REST sources
    Http(HttpDriver),
    /// I2C analog front-ends
    I2c(I2cDriver),
    /// Vendor TCP control protocols
    VendorTcp(VendorTcpDriver),
    /// In-process simulation
    Simulated(SimulatedDriver),
}

/// Session of a [`Driver`]; the variant always matches the driver's.
#[derive(Debug)]
pub enum DeviceSession {
    /// SCPI session
    Scpi(scpi::ScpiSession),
    /// ASCII serial session
    AsciiSerial(ascii_serial::AsciiSession),
    /// Binary serial session
    BinarySerial(binary_serial::BinarySession),
    /// HTTP session
    Http(http::HttpSession),
    /// I2C session
    I2c(i2c::I2cSession),
    /// Vendor TCP session
    VendorTcp(vendor_tcp::VendorSession),
    /// Simulated session
    Simulated(simulated::SimSession),
}

macro_rules! with_session {
    ($driver:expr, $session:expr, |$d:ident, $s:ident| $body:expr) => {
        match ($driver, $session) {
            (Driver::Scpi($d), DeviceSession::Scpi($s)) => $body,
            (Driver::AsciiSerial($d), DeviceSession::AsciiSerial($s)) => $body,
            (Driver::BinarySerial($d), DeviceSession::BinarySerial($s)) => $body,
            (Driver::Http($d), DeviceSession::Http($s)) => $body,
            (Driver::I2c($d), DeviceSession::I2c($s)) => $body,
            (Driver::VendorTcp($d), DeviceSession::VendorTcp($s)) => $body,
            (Driver::Simulated($d), DeviceSession::Simulated($s)) => $body,
            _ => Err(DeviceError::connection(
                "session does not belong to this driver",
            )),
        }
    };
}

impl Driver {
    /// Select and configure the driver for a device entry.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let driver = match config.model.as_str() {
            "Keysight DAQ973A" | "Thorlabs PM100" | "Red Pitaya Lockbox" | "SCPI" => {
                Driver::Scpi(ScpiDriver::from_config(config)?)
            }
            "KJLC 354" | "SMC HRS012" | "SRS CTC100" | "Met One DR-528" | "Thorlabs MDT693B"
            | "Burleigh WA-1000" => Driver::AsciiSerial(AsciiSerialDriver::from_config(config)?),
            "KJLC ACG" | "Vacom CU-100" => {
                Driver::BinarySerial(BinarySerialDriver::from_config(config)?)
            }
            "PurpleAir" => Driver::Http(HttpDriver::from_config(config)?),
            "KJLC XCG" => Driver::I2c(I2cDriver::from_config(config)?),
            "Pfeiffer TPG366" | "Cryomech CPA1110" => {
                Driver::VendorTcp(VendorTcpDriver::from_config(config)?)
            }
            "Simulated" => Driver::Simulated(SimulatedDriver::from_config(config)?),
            other => {
                return Err(ConfigError::UnknownModel {
                    device: config.name.clone(),
                    model: other.to_string(),
                })
            }
        };
        Ok(driver)
    }

    /// Transport family label for logs.
    pub fn family(&self) -> &'static str {
        match self {
            Driver::Scpi(_) => "scpi",
            Driver::AsciiSerial(_) => "ascii_serial",
            Driver::BinarySerial(_) => "binary_serial",
            Driver::Http(_) => "http",
            Driver::I2c(_) => "i2c",
            Driver::VendorTcp(_) => "vendor_tcp",
            Driver::Simulated(_) => "simulated",
        }
    }

    /// Establish the transport.
    pub async fn open(&self) -> Result<DeviceSession, DeviceError> {
        Ok(match self {
            Driver::Scpi(d) => DeviceSession::Scpi(d.open().await?),
            Driver::AsciiSerial(d) => DeviceSession::AsciiSerial(d.open().await?),
            Driver::BinarySerial(d) => DeviceSession::BinarySerial(d.open().await?),
            Driver::Http(d) => DeviceSession::Http(d.open().await?),
            Driver::I2c(d) => DeviceSession::I2c(d.open().await?),
            Driver::VendorTcp(d) => DeviceSession::VendorTcp(d.open().await?),
            Driver::Simulated(d) => DeviceSession::Simulated(d.open().await?),
        })
    }

    /// Whole-device readout for this cycle.
    pub async fn prepare_cycle(&self, session: &mut DeviceSession) -> Result<(), DeviceError> {
        with_session!(self, session, |d, s| d.prepare_cycle(s).await)
    }

    /// Read one channel.
    pub async fn read_channel(
        &self,
        session: &mut DeviceSession,
        channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        with_session!(self, session, |d, s| d.read_channel(s, channel).await)
    }

    /// Release the transport.
    pub async fn close(&self, session: DeviceSession) {
        let result: Result<(), DeviceError> = with_session!(self, session, |d, s| {
            d.close(s).await;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "Dropped session of a different driver");
        }
    }
}

/// Reject a channel `Type` the model does not understand.
pub(crate) fn unknown_channel(
    config: &DeviceConfig,
    channel: &ChannelConfig,
) -> ConfigError {
    ConfigError::channel(
        &config.name,
        &channel.key,
        format!(
            "unknown channel Type '{}' for model '{}'",
            channel.selector(),
            config.model
        ),
    )
}

/// Parse a numeric instrument response.
pub(crate) fn parse_f64(text: &str) -> Result<f64, DeviceError> {
    let trimmed = text.trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| DeviceError::malformed(format!("'{}' is not a number", trimmed)))
}
