//! Rolling per-device failure state.
//!
//! [`ErrorState`] is the bookkeeping for one device: consecutive failed cycles, the
//! last error seen, and when the device last produced data. Each poller owns one
//! to decide when to force a reconnect. The scheduler keeps an [`ErrorTracker`]
//! with a copy per device for diagnostics and log throttling: the first failure,
//! a changed error and a recovery are worth a warning; the same error on every tick
//! is not.
//!
//! A device is never removed from scheduling because of its failures. Instruments are
//! power-cycled externally all the time and must resume on their own.

use crate::poller::PollOutcome;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// What changed with a recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Clean cycle on a healthy device.
    Healthy,
    /// First failing cycle after a clean one.
    FirstFailure,
    /// Failing again with the same errors as last time.
    Repeated,
    /// Failing with different errors than last time.
    Changed,
    /// Clean cycle after failures.
    Recovered {
        /// Failed cycles before the recovery.
        after: u32,
    },
}

impl Transition {
    /// Whether this transition deserves an operator-visible log line.
    pub fn is_notable(&self) -> bool {
        !matches!(self, Transition::Healthy | Transition::Repeated)
    }
}

/// Failure bookkeeping of one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorState {
    /// Cycles in a row that produced no reading.
    pub consecutive_failures: u32,
    /// Summary of the errors of the most recent cycle that had any.
    pub last_error: Option<String>,
    /// When the device last produced at least one reading.
    pub last_success: Option<DateTime<Utc>>,
    /// When the device last had a cycle with errors.
    pub last_failure: Option<DateTime<Utc>>,
}

impl ErrorState {
    /// Fold one cycle outcome into the state.
    pub fn record(&mut self, outcome: &PollOutcome) -> Transition {
        if outcome.errors.is_empty() {
            let failures = self.consecutive_failures;
            let had_errors = self.last_error.take().is_some();
            self.consecutive_failures = 0;
            self.last_success = Some(outcome.finished);
            return if failures > 0 || had_errors {
                Transition::Recovered { after: failures }
            } else {
                Transition::Healthy
            };
        }

        let signature = outcome.error_summary();
        let transition = match &self.last_error {
            None => Transition::FirstFailure,
            Some(previous) if *previous == signature => Transition::Repeated,
            Some(_) => Transition::Changed,
        };
        self.last_error = Some(signature);
        self.last_failure = Some(outcome.finished);
        if outcome.is_success() {
            self.consecutive_failures = 0;
            self.last_success = Some(outcome.finished);
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        transition
    }

    /// Whether the session should be closed and reopened before the next cycle.
    pub fn should_reconnect(&self, threshold: u32) -> bool {
        threshold > 0 && self.consecutive_failures >= threshold
    }
}

/// Error state of every device, written only by the scheduler.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    states: RwLock<HashMap<String, ErrorState>>,
}

impl ErrorTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one device cycle.
    pub fn record(&self, outcome: &PollOutcome) -> Transition {
        let mut states = self.states.write();
        states
            .entry(outcome.device.clone())
            .or_default()
            .record(outcome)
    }

    /// Current state of one device.
    pub fn state(&self, device: &str) -> Option<ErrorState> {
        self.states.read().get(device).cloned()
    }

    /// Devices whose last cycles all failed, with their failure counts.
    pub fn failing(&self) -> Vec<(String, u32)> {
        let mut failing: Vec<_> = self
            .states
            .read()
            .iter()
            .filter(|(_, s)| s.consecutive_failures > 0)
            .map(|(name, s)| (name.clone(), s.consecutive_failures))
            .collect();
        failing.sort();
        failing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::poller::{ChannelError, PollOutcome};
    use crate::reading::{FieldValue, Reading};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn outcome(readings: usize, errors: &[&str]) -> PollOutcome {
        let now = Utc::now();
        PollOutcome {
            device: "Gauge".into(),
            started: now,
            finished: now,
            elapsed: Duration::ZERO,
            readings: (0..readings)
                .map(|i| Reading {
                    timestamp: now,
                    measurement: "m".into(),
                    tags: BTreeMap::new(),
                    fields: BTreeMap::from([(format!("f{i}"), FieldValue::Float(1.0))]),
                    device: "Gauge".into(),
                    channel: format!("c{i}"),
                })
                .collect(),
            errors: errors
                .iter()
                .map(|message| ChannelError {
                    channel: None,
                    error: DeviceError::transient(*message),
                })
                .collect(),
        }
    }

    #[test]
    fn counts_consecutive_failed_cycles() {
        let mut state = ErrorState::default();
        assert_eq!(state.record(&outcome(0, &["no answer"])), Transition::FirstFailure);
        assert_eq!(state.record(&outcome(0, &["no answer"])), Transition::Repeated);
        assert_eq!(state.record(&outcome(0, &["port gone"])), Transition::Changed);
        assert_eq!(state.consecutive_failures, 3);
        assert!(state.should_reconnect(3));
        assert!(!state.should_reconnect(4));

        assert_eq!(state.record(&outcome(2, &[])), Transition::Recovered { after: 3 });
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
        assert!(state.last_success.is_some());
        assert_eq!(state.record(&outcome(2, &[])), Transition::Healthy);
    }

    #[test]
    fn partial_success_resets_the_counter() {
        let mut state = ErrorState::default();
        state.record(&outcome(0, &["timeout"]));
        state.record(&outcome(0, &["timeout"]));
        assert_eq!(state.record(&outcome(1, &["timeout"])), Transition::Repeated);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_some());
    }

    #[test]
    fn tracker_keeps_one_state_per_device() {
        let tracker = ErrorTracker::new();
        assert!(tracker.state("Gauge").is_none());
        assert!(tracker.record(&outcome(0, &["x"])).is_notable());
        assert!(!tracker.record(&outcome(0, &["x"])).is_notable());
        assert_eq!(tracker.failing(), vec![("Gauge".to_string(), 2)]);
        assert_eq!(tracker.state("Gauge").unwrap().consecutive_failures, 2);
    }
}
