//! # Stream status tracking
//!
//! Owns the map of flows, the timeout queue driving missing-detection and
//! reminders, and the mute queue. Decisions are pure over explicit
//! timestamps; the main loop feeds in wall time.
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::hash::Hash;

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::constants::{
    DEFAULT_FLAP_THRESHOLD, DEFAULT_FLAP_WINDOW, FUTURE_MESSAGE_MARGIN,
};
use crate::flow::{
    Flow, PriorStatus, Status, UpdateOutcome, degraded_info, flapping_info,
    missing_info, ok_info,
};
use crate::message::{FlowKey, Message, Notification, Severity};

/// Priority queue mapping keys to deadlines, with at most one live deadline
/// per key. Stale heap entries are invalidated lazily against the map.
#[derive(Debug)]
pub struct DeadlineQueue<K> {
    deadlines: HashMap<K, i64>,
    heap: BinaryHeap<Reverse<(i64, K)>>,
}

impl<K: Ord + Hash + Eq + Clone> DeadlineQueue<K> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Sets or replaces the deadline for a key.
    pub fn set(&mut self, key: K, at: i64) {
        self.deadlines.insert(key.clone(), at);
        self.heap.push(Reverse((at, key)));
    }

    /// Drops a key's deadline.
    pub fn remove(&mut self, key: &K) {
        self.deadlines.remove(key);
    }

    /// The live deadline for a key.
    pub fn get(&self, key: &K) -> Option<i64> {
        self.deadlines.get(key).copied()
    }

    /// Pops the next entry whose deadline has passed.
    pub fn pop_due(&mut self, now: i64) -> Option<(K, i64)> {
        while let Some(Reverse((at, key))) = self.heap.peek() {
            if *at > now {
                return None;
            }
            let at = *at;
            let key = key.clone();
            self.heap.pop();
            if self.deadlines.get(&key) == Some(&at) {
                self.deadlines.remove(&key);
                return Some((key, at));
            }
        }
        None
    }

    /// Live entries, sorted by key.
    pub fn entries(&self) -> Vec<(K, i64)> {
        let mut entries: Vec<(K, i64)> = self
            .deadlines
            .iter()
            .map(|(key, at)| (key.clone(), *at))
            .collect();
        entries.sort();
        entries
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether no deadline is armed.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Tunables from the command line.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Stay silent about a stream whose first known status is an error.
    pub skip_initial_error: bool,
    /// Re-notify a still-degraded stream after this many seconds.
    pub remind_interval: Option<i64>,
    /// Treat warning severity as ok.
    pub warning_expected: bool,
    /// Assumed interval for streams that declare none.
    pub default_interval: Option<i64>,
    /// Declare a stream missing after this many intervals of silence.
    pub missing: Option<u32>,
    /// Flap detector window width.
    pub flap_window: usize,
    /// Flap detector firing threshold.
    pub flap_threshold: f64,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            skip_initial_error: false,
            remind_interval: None,
            warning_expected: false,
            default_interval: None,
            missing: None,
            flap_window: DEFAULT_FLAP_WINDOW,
            flap_threshold: DEFAULT_FLAP_THRESHOLD,
        }
    }
}

fn bad_request() -> Value {
    json!({"error": "bad request"})
}

/// The stateful tracker: flows, timeout queue, mute queue.
pub struct StateTracker {
    options: TrackerOptions,
    flows: HashMap<FlowKey, Flow>,
    timeouts: DeadlineQueue<FlowKey>,
    mutes: DeadlineQueue<FlowKey>,
}

impl StateTracker {
    /// Creates an empty tracker.
    pub fn new(options: TrackerOptions) -> Self {
        Self {
            options,
            flows: HashMap::new(),
            timeouts: DeadlineQueue::new(),
            mutes: DeadlineQueue::new(),
        }
    }

    fn map_severity(&self, severity: Option<Severity>) -> Status {
        match severity {
            None | Some(Severity::Expected) => Status::Ok,
            Some(Severity::Warning) if self.options.warning_expected => Status::Ok,
            Some(Severity::Warning) => Status::Error,
            Some(Severity::Error) | Some(Severity::Other) => Status::Error,
        }
    }

    fn is_muted(&self, key: &FlowKey, now: i64) -> bool {
        self.mutes.get(key).is_some_and(|expires| expires > now)
    }

    fn remind_due(remind: Option<i64>, notified: i64, now: i64) -> bool {
        match remind {
            Some(interval) => now - notified >= interval,
            None => false,
        }
    }

    /// Processes one input message, returning the notifications to emit.
    pub fn process_message(
        &mut self,
        message: &Message,
        now: i64,
    ) -> Vec<Notification> {
        // Messages without a state carry metrics only.
        let Some(state) = message.state.clone() else {
            return Vec::new();
        };

        if message.time > now + FUTURE_MESSAGE_MARGIN {
            debug!(flow = %message.key, "dropping future-dated message");
            return Vec::new();
        }

        // Out-of-order input leaves the flow and every queue unchanged.
        if let Some(flow) = self.flows.get(&message.key)
            && message.time < flow.status_time()
        {
            debug!(flow = %message.key, "dropping out-of-order message");
            return Vec::new();
        }

        let status = self.map_severity(message.severity);

        if let Some(count) = self.options.missing {
            let interval = message
                .interval
                .map(|i| i as i64)
                .or(self.options.default_interval);
            if let Some(interval) = interval {
                self.timeouts.set(
                    message.key.clone(),
                    message.time + interval * count as i64,
                );
            }
        }

        let muted = self.is_muted(&message.key, now);
        let remind = self.options.remind_interval;
        let skip_initial = self.options.skip_initial_error;
        let flap_window = self.options.flap_window;
        let flap_threshold = self.options.flap_threshold;

        let flow = self.flows.entry(message.key.clone()).or_insert_with(|| {
            Flow::new(
                &message.key.aspect,
                message.location.clone(),
                flap_window,
                flap_threshold,
            )
        });

        let prior = match flow.update(status, message.time) {
            UpdateOutcome::Discard => return Vec::new(),
            UpdateOutcome::Applied(prior) => prior,
        };

        let mut out = Vec::new();

        if flow.is_flapping() {
            let suppressed = prior == PriorStatus::Flapping
                && flow.notified() != 0
                && !Self::remind_due(remind, flow.notified(), now);
            if !suppressed {
                let info = flapping_info(flow.flap_window(), flow.flap_changes());
                publish(flow, message.time, info, muted, now, &mut out);
            }
        } else if status == Status::Ok {
            match prior {
                // A first-ever ok stays silent; so does an unchanged ok.
                PriorStatus::Unset | PriorStatus::Known(Status::Ok) => {}
                _ => {
                    let info = ok_info(&state, message.severity);
                    publish(flow, message.time, info, muted, now, &mut out);
                }
            }
        } else {
            let first_error = prior == PriorStatus::Unset;
            if first_error && skip_initial {
                flow.set_status_info(degraded_info(&state, message.severity));
                flow.notification_sent(now);
            } else if prior == PriorStatus::Known(Status::Error)
                && flow.notified() != 0
                && !Self::remind_due(remind, flow.notified(), now)
            {
                // Unchanged error with no reminder due.
            } else {
                let info = degraded_info(&state, message.severity);
                publish(flow, message.time, info, muted, now, &mut out);
            }
        }

        out
    }

    /// Wall-clock sweep: evicts expired mutes and fires due timeout entries,
    /// declaring their flows missing.
    pub fn sweep(&mut self, now: i64) -> Vec<Notification> {
        while let Some((key, _)) = self.mutes.pop_due(now) {
            debug!(flow = %key, "mute expired");
        }

        let mut out = Vec::new();
        while let Some((key, _deadline)) = self.timeouts.pop_due(now) {
            let muted = self.is_muted(&key, now);
            let remind = self.options.remind_interval;
            let Some(flow) = self.flows.get_mut(&key) else {
                continue;
            };

            let last_seen = flow.status_time();
            if flow.update(Status::Missing, now) == UpdateOutcome::Discard {
                continue;
            }

            let info = missing_info(last_seen);
            let previous = flow.status_info().cloned();
            flow.set_status_info(info.clone());
            flow.notification_sent(now);
            if !muted && !flow.is_flapping() {
                out.push(Notification {
                    time: now,
                    aspect: flow.aspect.clone(),
                    location: flow.location.clone(),
                    info,
                    previous,
                });
            }

            if let Some(interval) = remind {
                self.timeouts.set(key, now + interval);
            }
        }
        out
    }

    /// Executes one control request. Validation failures reply
    /// `{"error":"bad request"}`.
    pub fn control(&mut self, request: &Value, now: i64) -> Value {
        let Some(object) = request.as_object() else {
            return bad_request();
        };
        let Some(command) = object.get("command").and_then(Value::as_str) else {
            return bad_request();
        };

        match command {
            "list" => {
                let mut keys: Vec<&FlowKey> = self.flows.keys().collect();
                keys.sort();
                let rows: Vec<Value> = keys
                    .into_iter()
                    .map(|key| {
                        let flow = &self.flows[key];
                        json!({
                            "aspect": flow.aspect,
                            "location": flow.location,
                            "info": flow.status_info(),
                        })
                    })
                    .collect();
                json!({"result": rows})
            }
            "list_muted" => {
                let rows: Vec<Value> = self
                    .mutes
                    .entries()
                    .into_iter()
                    .filter(|(_, expires)| *expires > now)
                    .map(|(key, expires)| {
                        let location: Value = serde_json::from_str(&key.location)
                            .unwrap_or(Value::Null);
                        json!([key.aspect, location, expires])
                    })
                    .collect();
                json!({"result": rows})
            }
            "forget" | "mute" | "unmute" | "reset_flapping" | "reset_reminder" => {
                let Some(key) = parse_target(object) else {
                    return bad_request();
                };
                match command {
                    "forget" => {
                        // Mutes may predate a flow's first message, so a
                        // forget leaves them in place.
                        self.flows.remove(&key);
                        self.timeouts.remove(&key);
                    }
                    "mute" => {
                        let Some(duration) = object
                            .get("duration")
                            .and_then(Value::as_i64)
                            .filter(|duration| *duration > 0)
                        else {
                            return bad_request();
                        };
                        self.mutes.set(key, now + duration);
                    }
                    "unmute" => {
                        self.mutes.remove(&key);
                    }
                    "reset_flapping" => {
                        if let Some(flow) = self.flows.get_mut(&key) {
                            flow.reset_flapping();
                        }
                    }
                    "reset_reminder" => {
                        if let Some(flow) = self.flows.get_mut(&key) {
                            flow.reset_notified();
                        }
                    }
                    _ => unreachable!(),
                }
                json!({"result": "ok"})
            }
            _ => bad_request(),
        }
    }

    /// Number of tracked flows.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Read access for tests and diagnostics.
    pub fn flow(&self, key: &FlowKey) -> Option<&Flow> {
        self.flows.get(key)
    }

    /// Deadline of the flow's missing timer, if armed.
    pub fn timeout_at(&self, key: &FlowKey) -> Option<i64> {
        self.timeouts.get(key)
    }
}

fn publish(
    flow: &mut Flow,
    time: i64,
    info: Value,
    muted: bool,
    now: i64,
    out: &mut Vec<Notification>,
) {
    let previous = flow.status_info().cloned();
    flow.set_status_info(info.clone());
    flow.notification_sent(now);
    if muted {
        debug!(aspect = %flow.aspect, "notification suppressed by mute");
        return;
    }
    out.push(Notification {
        time,
        aspect: flow.aspect.clone(),
        location: flow.location.clone(),
        info,
        previous,
    });
}

fn parse_target(object: &Map<String, Value>) -> Option<FlowKey> {
    let aspect = object.get("aspect")?.as_str()?;
    let location = object.get("location")?.as_object()?;
    let mut tags = BTreeMap::new();
    for (name, value) in location {
        tags.insert(name.clone(), value.as_str()?.to_string());
    }
    Some(FlowKey::new(aspect, &tags))
}
