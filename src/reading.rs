//! Normalized readings and their line-protocol encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// Tag set of a reading; sorted keys keep the encoded line stable.
pub type TagSet = BTreeMap<String, String>;

/// Typed value of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Floating-point value (the common case).
    Float(f64),
    /// Integer value, encoded with the `i` suffix.
    Integer(i64),
    /// String value, e.g. a power-meter unit.
    Text(String),
    /// Boolean value, e.g. an auto-range flag.
    Boolean(bool),
}

impl FieldValue {
    /// Numeric view used by the converter.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Text(_) | FieldValue::Boolean(_) => None,
        }
    }

    /// Encode as a line-protocol field value.
    fn write_line_value(&self, out: &mut String) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(out, "{v}"),
            FieldValue::Integer(v) => write!(out, "{v}i"),
            FieldValue::Text(v) => write!(
                out,
                "\"{}\"",
                v.replace('\\', "\\\\").replace('"', "\\\"")
            ),
            FieldValue::Boolean(v) => write!(out, "{v}"),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
            FieldValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

/// Timestamp precision of written points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Nanoseconds
    #[default]
    Ns,
    /// Microseconds
    Us,
    /// Milliseconds
    Ms,
    /// Seconds
    S,
}

impl Precision {
    /// Query-string value understood by the write endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Ns => "ns",
            Precision::Us => "us",
            Precision::Ms => "ms",
            Precision::S => "s",
        }
    }

    fn encode(self, ts: &DateTime<Utc>) -> Option<i64> {
        match self {
            Precision::Ns => ts.timestamp_nanos_opt(),
            Precision::Us => Some(ts.timestamp_micros()),
            Precision::Ms => Some(ts.timestamp_millis()),
            Precision::S => Some(ts.timestamp()),
        }
    }
}

/// One normalized observation.
///
/// Created by a poller right after a successful channel read and never mutated after.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Collection time.
    pub timestamp: DateTime<Utc>,
    /// Measurement name.
    pub measurement: String,
    /// Device tags merged with channel tags.
    pub tags: TagSet,
    /// Field key to value.
    pub fields: BTreeMap<String, FieldValue>,
    /// Device that produced the reading.
    pub device: String,
    /// Channel key within the device.
    pub channel: String,
}

impl Reading {
    /// Encode as one line of InfluxDB line protocol.
    pub fn to_line_protocol(&self, precision: Precision) -> String {
        let mut line = String::with_capacity(64);
        // Writing into a String cannot fail.
        let _ = self.write_line(&mut line, precision);
        line
    }

    fn write_line(&self, out: &mut String, precision: Precision) -> fmt::Result {
        out.push_str(&escape_measurement(&self.measurement));
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            write!(out, ",{}={}", escape_key(key), escape_key(value))?;
        }

        out.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write!(out, "{}=", escape_key(key))?;
            value.write_line_value(out)?;
        }

        if let Some(ts) = precision.encode(&self.timestamp) {
            write!(out, " {ts}")?;
        }
        Ok(())
    }
}

/// Merge channel tags over device tags; the channel wins on collisions.
pub fn merge_tags(device: &TagSet, channel: &TagSet) -> TagSet {
    let mut merged = device.clone();
    merged.extend(channel.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
