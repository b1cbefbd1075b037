//! # Flow records
//!
//! Per-stream state: the current status, the timestamp of the newest
//! accepted message, the last computed status object, the notification
//! stamp, and a circular-bit flap detector.
use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::message::Severity;

/// Stored status of a flow. Flapping is derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The stream reports an expected state.
    Ok,
    /// The stream reports a degraded state.
    Error,
    /// The stream went silent past its deadline.
    Missing,
}

/// The status that was effectively in force before an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorStatus {
    /// The flow had never carried a status.
    Unset,
    /// The flow was flapping.
    Flapping,
    /// A settled status.
    Known(Status),
}

/// Result of feeding one status observation into a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The observation was older than the flow state; nothing was mutated.
    Discard,
    /// The observation was applied; carries the prior effective status.
    Applied(PriorStatus),
}

/// Fixed-width circular bit buffer with an O(1) running ones count. Each
/// observation contributes one bit: 1 when the computed status differed from
/// the previous one.
#[derive(Debug, Clone)]
pub struct FlapDetector {
    bits: Vec<bool>,
    pos: usize,
    ones: usize,
    threshold: f64,
}

impl FlapDetector {
    /// Creates a detector over `window` observations firing above
    /// `threshold`.
    pub fn new(window: usize, threshold: f64) -> Self {
        Self {
            bits: vec![false; window.max(1)],
            pos: 0,
            ones: 0,
            threshold,
        }
    }

    /// Pops the oldest bit, pushes the new one, maintains the ones count.
    pub fn update(&mut self, changed: bool) {
        if self.bits[self.pos] {
            self.ones -= 1;
        }
        self.bits[self.pos] = changed;
        if changed {
            self.ones += 1;
        }
        self.pos = (self.pos + 1) % self.bits.len();
    }

    /// Whether the change density exceeds the threshold.
    pub fn is_flapping(&self) -> bool {
        self.ones as f64 / self.bits.len() as f64 > self.threshold
    }

    /// Zeroes the window.
    pub fn reset(&mut self) {
        self.bits.fill(false);
        self.pos = 0;
        self.ones = 0;
    }

    /// Window width.
    pub fn window(&self) -> usize {
        self.bits.len()
    }

    /// Number of set bits in the live window.
    pub fn changes(&self) -> usize {
        self.ones
    }
}

/// Per-stream record.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Aspect as received.
    pub aspect: String,
    /// Location tags as received.
    pub location: BTreeMap<String, String>,
    status: Option<Status>,
    status_time: i64,
    status_info: Option<Value>,
    notified: i64,
    flap: FlapDetector,
}

impl Flow {
    /// Creates a fresh record with an unset status.
    pub fn new(
        aspect: &str,
        location: BTreeMap<String, String>,
        flap_window: usize,
        flap_threshold: f64,
    ) -> Self {
        Self {
            aspect: aspect.to_string(),
            location,
            status: None,
            status_time: 0,
            status_info: None,
            notified: 0,
            flap: FlapDetector::new(flap_window, flap_threshold),
        }
    }

    /// Current stored status.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Timestamp of the newest accepted message.
    pub fn status_time(&self) -> i64 {
        self.status_time
    }

    /// The last computed status object, used as the `previous` field of the
    /// next notification.
    pub fn status_info(&self) -> Option<&Value> {
        self.status_info.as_ref()
    }

    /// Replaces the stored status object.
    pub fn set_status_info(&mut self, info: Value) {
        self.status_info = Some(info);
    }

    /// When the flow last notified (0 = never).
    pub fn notified(&self) -> i64 {
        self.notified
    }

    /// Stamps the notification time.
    pub fn notification_sent(&mut self, timestamp: i64) {
        self.notified = timestamp;
    }

    /// Zeroes the notification stamp, forcing the next non-ok decision to
    /// notify.
    pub fn reset_notified(&mut self) {
        self.notified = 0;
    }

    /// Whether the flap detector currently fires.
    pub fn is_flapping(&self) -> bool {
        self.flap.is_flapping()
    }

    /// Flap window width.
    pub fn flap_window(&self) -> usize {
        self.flap.window()
    }

    /// Set bits in the flap window.
    pub fn flap_changes(&self) -> usize {
        self.flap.changes()
    }

    /// Zeroes the flap detector.
    pub fn reset_flapping(&mut self) {
        self.flap.reset();
    }

    /// Applies one status observation, returning the status that was in
    /// force before it, honoring flapping.
    ///
    /// A repeated `missing` resets the flap detector first, so a stream that
    /// resumes after a long silence is not immediately declared flapping.
    /// `missing` observations keep `status_time` untouched: it always names
    /// the newest accepted message, which is what `last_seen` reports.
    pub fn update(&mut self, status: Status, timestamp: i64) -> UpdateOutcome {
        if timestamp < self.status_time {
            return UpdateOutcome::Discard;
        }

        if status == Status::Missing && self.status == Some(Status::Missing) {
            self.flap.reset();
        }

        let prior = if self.flap.is_flapping() {
            PriorStatus::Flapping
        } else {
            match self.status {
                Some(status) => PriorStatus::Known(status),
                None => PriorStatus::Unset,
            }
        };

        let changed = match self.status {
            Some(previous) => previous != status,
            None => false,
        };
        self.flap.update(changed);

        self.status = Some(status);
        if status != Status::Missing {
            self.status_time = timestamp;
        }

        UpdateOutcome::Applied(prior)
    }
}

/// Status object for a stream in an expected state.
pub fn ok_info(state: &str, severity: Option<Severity>) -> Value {
    let severity = match severity {
        Some(Severity::Warning) => "warning",
        _ => "expected",
    };
    json!({"status": "ok", "state": state, "severity": severity})
}

/// Status object for a degraded stream.
pub fn degraded_info(state: &str, severity: Option<Severity>) -> Value {
    let severity = match severity {
        Some(Severity::Warning) => "warning",
        _ => "error",
    };
    json!({"status": "degraded", "state": state, "severity": severity})
}

/// Status object for a flapping stream.
pub fn flapping_info(window: usize, changes: usize) -> Value {
    json!({"status": "flapping", "window": window, "changes": changes})
}

/// Status object for a silent stream.
pub fn missing_info(last_seen: i64) -> Value {
    json!({"status": "missing", "last_seen": last_seen})
}
