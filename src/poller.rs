//! One device's read cycle.
//!
//! A [`Poller`] owns a device's driver, its session and its error state. Each call
//! to [`Poller::poll`] runs one cycle under a single deadline (the device `Timeout`)
//! covering open, the whole-device readout and every channel read:
//!
//! 1. Open the session if there is none. A failed open ends the cycle with one
//!    connection error; no channel is touched.
//! 2. Run the driver's per-cycle readout. If it fails, every channel fails with
//!    that error.
//! 3. Read the channels in document order. A failed channel is recorded and the next
//!    one is attempted. When the deadline passes, the readings gathered so far are
//!    kept and each unattempted channel gets a timeout error.
//! 4. Normalize each raw value: multiplier, converter, merged tags, field key.
//!
//! The session survives channel errors. It is closed when the driver reports a lost
//! connection, when a read was cut off by the deadline (a late answer would be taken
//! for the next query's), and before the next cycle once the reconnect threshold of
//! consecutive failed cycles is reached.

use crate::config::{ChannelConfig, DeviceConfig};
use crate::converter::convert;
use crate::drivers::{DeviceSession, Driver};
use crate::error::{ConfigError, DeviceError};
use crate::error_tracker::ErrorState;
use crate::reading::{merge_tags, FieldValue, Reading};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

/// Upper bound on closing a session. A cycle cut off by its deadline may overrun the
/// deadline by at most this much while its transport is released.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Failure of one channel, or of the whole device when `channel` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelError {
    /// Channel key, absent for device-level failures such as a failed open.
    pub channel: Option<String>,
    /// What went wrong.
    pub error: DeviceError,
}

impl ChannelError {
    fn device(error: DeviceError) -> Self {
        Self {
            channel: None,
            error,
        }
    }

    fn channel(channel: &ChannelConfig, error: DeviceError) -> Self {
        Self {
            channel: Some(channel.key.clone()),
            error,
        }
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.channel {
            Some(channel) => write!(f, "{}: {}", channel, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Result of one device cycle.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// Device name.
    pub device: String,
    /// Wall-clock start of the cycle.
    pub started: DateTime<Utc>,
    /// Wall-clock end of the cycle.
    pub finished: DateTime<Utc>,
    /// Monotonic cycle duration.
    pub elapsed: Duration,
    /// Readings in channel order.
    pub readings: Vec<Reading>,
    /// Errors in channel order.
    pub errors: Vec<ChannelError>,
}

impl PollOutcome {
    /// A cycle succeeds when it produced at least one reading.
    pub fn is_success(&self) -> bool {
        !self.readings.is_empty()
    }

    /// Stable one-line summary of the errors, used to detect repeated failures.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Outcome for a device whose cycle never reported back.
    pub fn missed(device: &str, started: DateTime<Utc>, waited: Duration) -> Self {
        Self::failed(
            device,
            started,
            waited,
            DeviceError::Timeout(waited.as_secs_f64()),
        )
    }

    /// Outcome carrying a single device-level error.
    pub fn failed(
        device: &str,
        started: DateTime<Utc>,
        elapsed: Duration,
        error: DeviceError,
    ) -> Self {
        Self {
            device: device.to_string(),
            started,
            finished: Utc::now(),
            elapsed,
            readings: Vec::new(),
            errors: vec![ChannelError::device(error)],
        }
    }
}

/// Driver, session and error state of one device.
#[derive(Debug)]
pub struct Poller {
    config: DeviceConfig,
    driver: Driver,
    session: Option<DeviceSession>,
    state: ErrorState,
    reconnect_threshold: u32,
}

impl Poller {
    /// Select the driver for `config`.
    pub fn new(config: DeviceConfig, reconnect_threshold: u32) -> Result<Self, ConfigError> {
        let driver = Driver::from_config(&config)?;
        Ok(Self::with_driver(config, driver, reconnect_threshold))
    }

    /// Poller around an already configured driver.
    pub fn with_driver(config: DeviceConfig, driver: Driver, reconnect_threshold: u32) -> Self {
        Self {
            config,
            driver,
            session: None,
            state: ErrorState::default(),
            reconnect_threshold,
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The device's driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Failure bookkeeping driving reconnects.
    pub fn state(&self) -> &ErrorState {
        &self.state
    }

    /// Run one cycle. Never fails; errors are part of the outcome.
    ///
    /// Ends within the device timeout, plus up to [`CLOSE_TIMEOUT`] when a cut-off
    /// session has to be released.
    pub async fn poll(&mut self) -> PollOutcome {
        let started = Utc::now();
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        if self.session.is_some() && self.state.should_reconnect(self.reconnect_threshold) {
            info!(
                device = %self.config.name,
                failures = self.state.consecutive_failures,
                "Reopening session after consecutive failed cycles"
            );
            self.close_session(deadline.min(Instant::now() + CLOSE_TIMEOUT))
                .await;
        }

        let (readings, errors) = self.run_cycle(deadline).await;
        let outcome = PollOutcome {
            device: self.config.name.clone(),
            started,
            finished: Utc::now(),
            elapsed: start.elapsed(),
            readings,
            errors,
        };
        self.state.record(&outcome);
        trace!(
            device = %self.config.name,
            readings = outcome.readings.len(),
            errors = outcome.errors.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Cycle finished"
        );
        outcome
    }

    /// Count a cycle that died inside the driver instead of returning from [`Poller::poll`].
    pub fn record_aborted(&mut self, outcome: &PollOutcome) {
        self.state.record(outcome);
    }

    /// Close the session, if any.
    pub async fn shutdown(&mut self) {
        self.close_session(Instant::now() + CLOSE_TIMEOUT).await;
    }

    async fn close_session(&mut self, until: Instant) {
        if let Some(session) = self.session.take() {
            if timeout_at(until, self.driver.close(session)).await.is_err() {
                warn!(device = %self.config.name, "Closing session timed out");
            }
            debug!(device = %self.config.name, "Session closed");
        }
    }

    async fn run_cycle(&mut self, deadline: Instant) -> (Vec<Reading>, Vec<ChannelError>) {
        let timeout_secs = self.config.timeout.as_secs_f64();
        let mut readings = Vec::with_capacity(self.config.channels.len());
        let mut errors = Vec::new();

        let mut session = match self.session.take() {
            Some(session) => session,
            None => match timeout_at(deadline, self.driver.open()).await {
                Ok(Ok(session)) => {
                    debug!(
                        device = %self.config.name,
                        family = self.driver.family(),
                        address = %self.config.address,
                        "Session opened"
                    );
                    session
                }
                Ok(Err(e)) => {
                    errors.push(ChannelError::device(e));
                    return (readings, errors);
                }
                Err(_) => {
                    errors.push(ChannelError::device(DeviceError::connection(format!(
                        "open did not complete within {:.3} s",
                        timeout_secs
                    ))));
                    return (readings, errors);
                }
            },
        };

        let prepared = match timeout_at(deadline, self.driver.prepare_cycle(&mut session)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(timeout_secs)),
        };
        if let Err(e) = prepared {
            let keep = !matches!(e, DeviceError::Connection(_) | DeviceError::Timeout(_));
            errors.extend(
                self.config
                    .channels
                    .iter()
                    .map(|channel| ChannelError::channel(channel, e.clone())),
            );
            self.release(session, keep).await;
            return (readings, errors);
        }

        let mut keep = true;
        for (index, channel) in self.config.channels.iter().enumerate() {
            let raw = match timeout_at(deadline, self.driver.read_channel(&mut session, index)).await
            {
                Ok(raw) => raw,
                Err(_) => {
                    errors.extend(
                        self.config.channels[index..]
                            .iter()
                            .map(|c| ChannelError::channel(c, DeviceError::Timeout(timeout_secs))),
                    );
                    keep = false;
                    break;
                }
            };

            match raw.and_then(|value| self.normalize(channel, value)) {
                Ok(reading) => readings.push(reading),
                Err(e @ DeviceError::Connection(_)) => {
                    errors.extend(
                        self.config.channels[index..]
                            .iter()
                            .map(|c| ChannelError::channel(c, e.clone())),
                    );
                    keep = false;
                    break;
                }
                Err(e) => errors.push(ChannelError::channel(channel, e)),
            }
        }

        self.release(session, keep).await;
        (readings, errors)
    }

    /// Keep the session for the next cycle, or close it within [`CLOSE_TIMEOUT`].
    async fn release(&mut self, session: DeviceSession, keep: bool) {
        if keep {
            self.session = Some(session);
        } else {
            if timeout(CLOSE_TIMEOUT, self.driver.close(session)).await.is_err() {
                warn!(device = %self.config.name, "Closing session timed out");
            }
            debug!(device = %self.config.name, "Session dropped; reopening next cycle");
        }
    }

    fn normalize(&self, channel: &ChannelConfig, raw: FieldValue) -> Result<Reading, DeviceError> {
        let value = convert(raw, channel.multiplier, channel.converter.as_ref())?;
        if let FieldValue::Float(v) = value {
            if !v.is_finite() {
                return Err(DeviceError::Conversion(format!(
                    "value {} is not finite",
                    v
                )));
            }
        }
        debug!(
            device = %self.config.name,
            channel = %channel.key,
            field = %channel.field_key,
            value = %value,
            "Channel read"
        );
        Ok(Reading {
            timestamp: Utc::now(),
            measurement: self.config.measurement.clone(),
            tags: merge_tags(&self.config.tags, &channel.tags),
            fields: BTreeMap::from([(channel.field_key.clone(), value)]),
            device: self.config.name.clone(),
            channel: channel.key.clone(),
        })
    }
}
