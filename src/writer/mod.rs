//! Batched writes to the time-series database.
//!
//! [`BatchWriter::flush`] turns one tick's readings into line-protocol points and
//! hands them to a [`PointSink`] in a single write. Transient failures are retried
//! with exponential backoff up to [`RetryPolicy::max_attempts`] total attempts;
//! permanent failures and exhausted batches are logged and dropped. Nothing is
//! buffered across ticks: a database outage costs data, never liveness.
//!
//! Sinks:
//! - [`influx::InfluxSink`]: InfluxDB v2 HTTP write API
//! - [`LogSink`]: logs every point instead of writing it (dry runs)

pub mod influx;

use crate::config::WriterConfig;
use crate::error::WriteError;
use crate::reading::{Precision, Reading};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use influx::InfluxSink;

/// Destination for encoded points.
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Short name for log output.
    fn name(&self) -> &str;

    /// Write one batch of newline-separated line-protocol points.
    async fn write(&self, body: &str, points: usize) -> Result<(), WriteError>;
}

/// Sink that logs points instead of persisting them.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl PointSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn write(&self, body: &str, points: usize) -> Result<(), WriteError> {
        for line in body.lines() {
            info!(target: "lab_logger::points", "{}", line);
        }
        debug!(points, "Dry run, batch not persisted");
        Ok(())
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Growth factor between consecutive delays, greater than 1.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&WriterConfig::default())
    }
}

impl From<&WriterConfig> for RetryPolicy {
    fn from(config: &WriterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            backoff_factor: config.backoff_factor,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        self.initial_backoff
            .mul_f64(self.backoff_factor.powi(exponent))
    }

    /// Every delay the policy can produce, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|retry| self.delay(retry))
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing to write.
    Empty,
    /// The batch was accepted.
    Written {
        /// Points in the batch.
        points: usize,
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// The batch was given up on.
    Dropped {
        /// Points lost.
        points: usize,
        /// Attempts made.
        attempts: u32,
        /// The last error.
        error: WriteError,
    },
    /// The batch was still waiting for the writer when a newer tick replaced it.
    Superseded {
        /// Points lost.
        points: usize,
        /// Tick whose batch took its place.
        by_tick: u64,
    },
}

/// Encodes readings and writes them with retries.
#[derive(Clone)]
pub struct BatchWriter {
    sink: Arc<dyn PointSink>,
    policy: RetryPolicy,
    precision: Precision,
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("sink", &self.sink.name())
            .field("policy", &self.policy)
            .field("precision", &self.precision)
            .finish()
    }
}

impl BatchWriter {
    /// Writer over `sink`.
    pub fn new(sink: Arc<dyn PointSink>, policy: RetryPolicy, precision: Precision) -> Self {
        Self {
            sink,
            policy,
            precision,
        }
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Encode readings as newline-separated line protocol.
    pub fn encode(&self, readings: &[Reading]) -> String {
        readings
            .iter()
            .map(|r| r.to_line_protocol(self.precision))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Write one tick's readings. Never fails; the outcome says what happened.
    pub async fn flush(&self, readings: &[Reading]) -> FlushOutcome {
        if readings.is_empty() {
            return FlushOutcome::Empty;
        }
        let points = readings.len();
        let body = self.encode(readings);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.sink.write(&body, points).await {
                Ok(()) => {
                    info!(sink = self.sink.name(), points, attempt, "Batch written");
                    return FlushOutcome::Written {
                        points,
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                error!(
                    sink = self.sink.name(),
                    points,
                    error = %error,
                    "Batch rejected, dropping"
                );
                return FlushOutcome::Dropped {
                    points,
                    attempts: attempt,
                    error,
                };
            }
            if attempt >= self.policy.max_attempts {
                error!(
                    sink = self.sink.name(),
                    points,
                    attempts = attempt,
                    error = %error,
                    "Batch dropped after retries were exhausted"
                );
                return FlushOutcome::Dropped {
                    points,
                    attempts: attempt,
                    error,
                };
            }

            let delay = self.policy.delay(attempt - 1);
            warn!(
                sink = self.sink.name(),
                attempt,
                max_attempts = self.policy.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Write failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Sink that records batches and fails on a script.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) script: Mutex<VecDeque<WriteError>>,
        pub(crate) attempts: Mutex<Vec<Instant>>,
        pub(crate) batches: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub(crate) fn failing(errors: impl IntoIterator<Item = WriteError>) -> Arc<Self> {
            let sink = Self::default();
            sink.script.lock().extend(errors);
            Arc::new(sink)
        }
    }

    #[async_trait]
    impl PointSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn write(&self, body: &str, _points: usize) -> Result<(), WriteError> {
            self.attempts.lock().push(Instant::now());
            if let Some(e) = self.script.lock().pop_front() {
                return Err(e);
            }
            self.batches.lock().push(body.to_string());
            Ok(())
        }
    }
}
