//! Configuration: the runtime settings file and the device document.

pub mod device;
pub mod runtime;

pub use device::{load_devices, parse_devices, ChannelConfig, DeviceConfig, SerialConnectionParams};
pub use runtime::{
    DatabaseConfig, DevicesConfig, LoggingConfig, RuntimeConfig, UpdateConfig, WriterConfig,
    DEFAULT_CONFIG_PATH,
};
