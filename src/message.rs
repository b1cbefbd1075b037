//! Monitoring message model for hailerter.
//!
//! One JSON object per input line. Only the fields the tracker reads are
//! modelled; a line that does not match this shape is dropped.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a stream: the aspect plus the canonical JSON rendering of its
/// location (sorted keys, no whitespace). Two messages belong to the same
/// flow iff their keys compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    /// Symbolic name of the monitored property.
    pub aspect: String,
    /// Canonical JSON of the location object.
    pub location: String,
}

impl FlowKey {
    /// Builds the key from an aspect and a location map. `BTreeMap`
    /// serialisation is already sorted and compact, which is exactly the
    /// canonical form.
    pub fn new(aspect: &str, location: &BTreeMap<String, String>) -> Self {
        let location = serde_json::to_string(location)
            .expect("string map should always be serializable");
        Self {
            aspect: aspect.to_string(),
            location,
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.aspect, self.location)
    }
}

/// Declared severity of a message state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The state is the expected one.
    Expected,
    /// Something looks off but may be tolerated.
    Warning,
    /// The state is an error.
    Error,
    /// Anything unrecognised; treated like an error.
    Other,
}

impl Severity {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "expected" => Severity::Expected,
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            _ => Severity::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    time: i64,
    aspect: String,
    location: BTreeMap<String, String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    severity: Option<String>,
}

/// One parsed monitoring message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Flow identity derived from aspect and location.
    pub key: FlowKey,
    /// Location tags as received.
    pub location: BTreeMap<String, String>,
    /// Message timestamp, epoch seconds.
    pub time: i64,
    /// Declared interval between messages of this stream.
    pub interval: Option<u64>,
    /// Reported state; a message without one carries metrics only.
    pub state: Option<String>,
    /// Reported severity of the state.
    pub severity: Option<Severity>,
}

impl Message {
    /// Converts a syntactically valid JSON value into a message. Returns
    /// `None` when the shape does not match, which drops the line.
    pub fn from_value(value: &Value) -> Option<Self> {
        let raw: RawMessage = serde_json::from_value(value.clone()).ok()?;
        let key = FlowKey::new(&raw.aspect, &raw.location);
        Some(Self {
            key,
            location: raw.location,
            time: raw.time,
            interval: raw.interval,
            state: raw.state,
            severity: raw.severity.as_deref().map(Severity::from_raw),
        })
    }
}

/// One emitted notification line.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// When the decision was made, epoch seconds.
    pub time: i64,
    /// Aspect of the affected stream.
    pub aspect: String,
    /// Location tags of the affected stream.
    pub location: BTreeMap<String, String>,
    /// The newly computed status object.
    pub info: Value,
    /// The previously computed status object, or null.
    pub previous: Option<Value>,
}
