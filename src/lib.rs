//! # Lab Logger Core Library
//!
//! Continuously polls a heterogeneous set of laboratory instruments on a fixed
//! interval, normalizes every value into a tagged time-series reading, and writes each
//! tick's readings to an InfluxDB-compatible database in one batch.
//!
//! ## Crate Structure
//!
//! - **`config`**: runtime configuration (TOML + environment, via `figment`) and the
//!   JSON device document.
//! - **`converter`**: multiplier and polynomial conversion of raw values.
//! - **`drivers`**: the closed set of instrument driver families behind the
//!   `DeviceDriver` trait.
//! - **`transport`**: byte-stream links (TCP, serial, USB-TMC) and VISA-style
//!   resource resolution.
//! - **`poller`**: one device's read cycle under a deadline, with per-channel error
//!   isolation.
//! - **`scheduler`**: fixed-interval ticking, overlap control and ordered flushing.
//! - **`writer`**: line-protocol batches with bounded retry and backoff.
//! - **`error_tracker`**: consecutive-failure bookkeeping and log throttling.
//! - **`reading`**: the normalized reading and its line-protocol encoding.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: error taxonomy.

pub mod config;
pub mod converter;
pub mod drivers;
pub mod error;
pub mod error_tracker;
pub mod logging;
pub mod poller;
pub mod reading;
pub mod scheduler;
pub mod transport;
pub mod writer;

use crate::config::DeviceConfig;
use crate::error::ConfigError;
use crate::poller::Poller;

/// Select a driver for every device entry.
///
/// Fails on the first entry no driver accepts; nothing is opened.
pub fn build_pollers(
    devices: Vec<DeviceConfig>,
    reconnect_threshold: u32,
) -> Result<Vec<Poller>, ConfigError> {
    devices
        .into_iter()
        .map(|config| Poller::new(config, reconnect_threshold))
        .collect()
}
