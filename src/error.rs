//! Error types for the logger.
//!
//! Errors fall into two groups with different propagation rules:
//!
//! 1. **Startup errors** - [`ConfigError`] and the I/O or parse failures wrapped by
//!    [`LoggerError`]. These are the only fatal errors: the process exits non-zero.
//!
//! 2. **Steady-state errors** - [`DeviceError`] (connection, read, conversion, timeout)
//!    and [`WriteError`]. They are contained at the poller or writer boundary and only
//!    surface as log output and error-tracker state. A device that is offline, or a
//!    database that is unreachable, never stops collection for the other devices.
//!
//! By using `#[from]`, `LoggerError` can be created from the underlying error types,
//! so startup code can use the `?` operator throughout.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LoggerError>;

/// Primary error type for startup and configuration.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// The runtime or device configuration is malformed or incomplete.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Runtime configuration could not be extracted from file/environment.
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Device document is not valid JSON.
    #[error("Device configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Standard I/O operation failed (e.g. reading the device document).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The database client could not be constructed.
    #[error("Database client error: {0}")]
    Write(#[from] WriteError),
}

impl From<figment::Error> for LoggerError {
    fn from(err: figment::Error) -> Self {
        LoggerError::Figment(Box::new(err))
    }
}

/// Fatal configuration problems detected at startup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A value passed parsing but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Invalid(String),

    /// A device entry could not be turned into a driver.
    #[error("Device '{device}': {message}")]
    Device {
        /// Device name from the `Device` key.
        device: String,
        /// What is wrong with the entry.
        message: String,
    },

    /// A channel entry could not be understood by the device's driver.
    #[error("Device '{device}', channel '{channel}': {message}")]
    Channel {
        /// Device name from the `Device` key.
        device: String,
        /// Channel key within `Channels`.
        channel: String,
        /// What is wrong with the entry.
        message: String,
    },

    /// Two device entries share a name.
    #[error("Duplicate device name: {0}")]
    DuplicateDevice(String),

    /// The `Model` key does not select any known driver.
    #[error("Device '{device}': unknown model '{model}'")]
    UnknownModel {
        /// Device name from the `Device` key.
        device: String,
        /// Unrecognised model string.
        model: String,
    },
}

impl ConfigError {
    /// Error attached to a whole device entry.
    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Device {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Error attached to a single channel entry.
    pub fn channel(
        device: impl Into<String>,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ConfigError::Channel {
            device: device.into(),
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// Whether a failed read is worth retrying on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// Timeout or no response. Usually clears up by itself.
    Transient,
    /// A response arrived but could not be parsed or is out of range.
    Malformed,
}

impl std::fmt::Display for ReadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ReadErrorKind::Transient => "transient",
            ReadErrorKind::Malformed => "malformed",
        };
        write!(f, "{}", label)
    }
}

/// Recoverable device-side failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The transport could not be opened; the session stays closed until the next tick.
    #[error("connection error: {0}")]
    Connection(String),

    /// A channel query failed.
    #[error("{kind} read error: {message}")]
    Read {
        /// Transient or malformed.
        kind: ReadErrorKind,
        /// Protocol-level description.
        message: String,
    },

    /// The raw value could not be converted (non-numeric with a numeric transform).
    #[error("conversion error: {0}")]
    Conversion(String),

    /// The per-device cycle deadline passed before the channel was read.
    #[error("cycle timed out after {0:.3} s")]
    Timeout(f64),

    /// The cycle task died before reporting (a driver panicked).
    #[error("cycle aborted: {0}")]
    Aborted(String),
}

impl DeviceError {
    /// Transient read failure (timeout, no response, broken link).
    pub fn transient(message: impl Into<String>) -> Self {
        DeviceError::Read {
            kind: ReadErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Malformed response (parse failure, error reply, checksum mismatch).
    pub fn malformed(message: impl Into<String>) -> Self {
        DeviceError::Read {
            kind: ReadErrorKind::Malformed,
            message: message.into(),
        }
    }

    /// Connection failure.
    pub fn connection(message: impl Into<String>) -> Self {
        DeviceError::Connection(message.into())
    }

    /// True when retrying on the next tick has a reasonable chance of success.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeviceError::Connection(_)
                | DeviceError::Timeout(_)
                | DeviceError::Read {
                    kind: ReadErrorKind::Transient,
                    ..
                }
        )
    }

    /// Short label for structured log fields.
    pub fn kind_label(&self) -> &'static str {
        match self {
            DeviceError::Connection(_) => "connection",
            DeviceError::Read {
                kind: ReadErrorKind::Transient,
                ..
            } => "read_transient",
            DeviceError::Read {
                kind: ReadErrorKind::Malformed,
                ..
            } => "read_malformed",
            DeviceError::Conversion(_) => "conversion",
            DeviceError::Timeout(_) => "timeout",
            DeviceError::Aborted(_) => "aborted",
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidData => DeviceError::malformed(err.to_string()),
            _ => DeviceError::transient(err.to_string()),
        }
    }
}

/// Failure to persist a batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    /// Network or service unavailable; retried with backoff.
    #[error("transient write error: {0}")]
    Transient(String),
    /// Rejected by the database (bad request, auth); dropped without retry.
    #[error("permanent write error: {0}")]
    Permanent(String),
}

impl WriteError {
    /// True when the write should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Transient(_))
    }
}
