//! In-process simulated instrument.
//!
//! Useful for dry runs of a new configuration and as the instrument behind the
//! scheduler tests. Device parameters:
//!
//! - `Latency`: seconds spent on every channel read
//! - `CloseLatency`: seconds spent releasing the session
//! - `FailureMode`: `none`, `transient`, `malformed` or `connection`
//! - `FailFirstCycles`: apply the failure mode only to the first N cycles (or opens,
//!   for `connection`); without it the failure is permanent
//!
//! Channel types: `Constant` (extra `Value`), `Random` (extras `Min`, `Max`) and
//! `Counter` (integer incremented on every read).

use super::DeviceDriver;
use crate::config::DeviceConfig;
use crate::error::{ConfigError, DeviceError};
use crate::reading::FieldValue;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Failure injected by a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Always answers
    None,
    /// Every channel read times out
    Transient,
    /// Every channel read returns garbage
    Malformed,
    /// The session cannot be opened
    Connection,
}

#[derive(Debug, Clone, PartialEq)]
enum SimChannel {
    Constant(FieldValue),
    Random { min: f64, max: f64 },
    Counter,
}

/// Open/close bookkeeping, shared so tests can observe reconnects.
#[derive(Debug, Default)]
pub struct SimStats {
    opens: AtomicU64,
    closes: AtomicU64,
    cycles: AtomicU64,
}

impl SimStats {
    /// Number of `open` calls so far.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of `close` calls so far.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of cycles started on an open session.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }
}

/// Simulated instrument driver.
#[derive(Debug)]
pub struct SimulatedDriver {
    latency: Duration,
    close_latency: Duration,
    failure: FailureMode,
    fail_first: Option<u64>,
    channels: Vec<SimChannel>,
    stats: Arc<SimStats>,
}

/// Live simulated session.
#[derive(Debug)]
pub struct SimSession {
    counters: Vec<i64>,
    failing: bool,
}

impl SimulatedDriver {
    /// Build from a device entry.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let latency = seconds_param(config, "Latency")?;
        let close_latency = seconds_param(config, "CloseLatency")?;

        let failure = match config
            .param_str("FailureMode")
            .unwrap_or_else(|| "none".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "none" => FailureMode::None,
            "transient" => FailureMode::Transient,
            "malformed" => FailureMode::Malformed,
            "connection" => FailureMode::Connection,
            other => {
                return Err(ConfigError::device(
                    &config.name,
                    format!("unknown FailureMode '{}'", other),
                ))
            }
        };

        let fail_first = config.param_f64("FailFirstCycles").map(|n| n.max(0.0) as u64);

        let mut channels = Vec::with_capacity(config.channels.len());
        for channel in &config.channels {
            let kind = match channel.channel_type.as_deref().unwrap_or("Constant") {
                "Constant" => {
                    let value = match channel.extra_value("Value") {
                        Some(Value::Number(n)) => match n.as_i64() {
                            Some(i) if !n.is_f64() => FieldValue::Integer(i),
                            _ => FieldValue::Float(n.as_f64().unwrap_or_default()),
                        },
                        Some(Value::String(s)) => FieldValue::Text(s.clone()),
                        Some(Value::Bool(b)) => FieldValue::Boolean(*b),
                        None => FieldValue::Float(0.0),
                        Some(other) => {
                            return Err(ConfigError::channel(
                                &config.name,
                                &channel.key,
                                format!("unsupported Value {}", other),
                            ))
                        }
                    };
                    SimChannel::Constant(value)
                }
                "Random" => {
                    let min = channel.extra_f64("Min").unwrap_or(0.0);
                    let max = channel.extra_f64("Max").unwrap_or(1.0);
                    if min.is_nan() || max.is_nan() || min >= max {
                        return Err(ConfigError::channel(
                            &config.name,
                            &channel.key,
                            "Min must be below Max",
                        ));
                    }
                    SimChannel::Random { min, max }
                }
                "Counter" => SimChannel::Counter,
                other => {
                    return Err(ConfigError::channel(
                        &config.name,
                        &channel.key,
                        format!("unknown channel Type '{}'", other),
                    ))
                }
            };
            channels.push(kind);
        }

        Ok(Self {
            latency,
            close_latency,
            failure,
            fail_first,
            channels,
            stats: Arc::new(SimStats::default()),
        })
    }

    /// Shared open/close counters.
    pub fn stats(&self) -> Arc<SimStats> {
        Arc::clone(&self.stats)
    }

    fn failing(&self, n: u64) -> bool {
        self.fail_first.map_or(true, |k| n < k)
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    type Session = SimSession;

    async fn open(&self) -> Result<SimSession, DeviceError> {
        let attempt = self.stats.opens.fetch_add(1, Ordering::SeqCst);
        if self.failure == FailureMode::Connection && self.failing(attempt) {
            return Err(DeviceError::connection("simulated device unreachable"));
        }
        Ok(SimSession {
            counters: vec![0; self.channels.len()],
            failing: false,
        })
    }

    async fn prepare_cycle(&self, session: &mut SimSession) -> Result<(), DeviceError> {
        let cycle = self.stats.cycles.fetch_add(1, Ordering::SeqCst);
        session.failing = matches!(self.failure, FailureMode::Transient | FailureMode::Malformed)
            && self.failing(cycle);
        Ok(())
    }

    async fn read_channel(
        &self,
        session: &mut SimSession,
        channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if session.failing {
            return Err(match self.failure {
                FailureMode::Malformed => DeviceError::malformed("simulated garbled response"),
                _ => DeviceError::transient("simulated device did not answer"),
            });
        }

        let kind = self
            .channels
            .get(channel)
            .ok_or_else(|| DeviceError::malformed(format!("no channel {}", channel)))?;
        Ok(match kind {
            SimChannel::Constant(value) => value.clone(),
            SimChannel::Random { min, max } => {
                FieldValue::Float(rand::thread_rng().gen_range(*min..*max))
            }
            SimChannel::Counter => {
                let counter = &mut session.counters[channel];
                let value = *counter;
                *counter += 1;
                FieldValue::Integer(value)
            }
        })
    }

    async fn close(&self, _session: SimSession) {
        if !self.close_latency.is_zero() {
            tokio::time::sleep(self.close_latency).await;
        }
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn seconds_param(config: &DeviceConfig, key: &str) -> Result<Duration, ConfigError> {
    match config.param_f64(key) {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        Some(secs) => Err(ConfigError::device(
            &config.name,
            format!("{} must be non-negative, got {}", key, secs),
        )),
        None => Ok(Duration::ZERO),
    }
}
