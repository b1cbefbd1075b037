//! # Restart queue
//!
//! A per-daemon state machine plus a priority queue keyed on
//! `(next_restart_at, start_priority, name)`. Every start, including boot and
//! reload, goes through the queue with a zero delay, so simultaneously
//! eligible daemons always launch in ascending priority with name ties broken
//! alphabetically.
//!
//! Stale heap entries are invalidated by a per-daemon epoch counter: any
//! operation that schedules or cancels bumps the epoch, and popped items with
//! an old epoch are discarded.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use strum_macros::AsRefStr;
use tracing::debug;

/// Lifecycle state of one supervised daemon. `dying` and `stopping` from the
/// transition table are instantaneous and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DaemonState {
    /// Not running and not scheduled.
    Stopped,
    /// A start attempt was released; the child should be alive.
    Running,
    /// Scheduled to start when the timer fires.
    Waiting,
}

struct Entry {
    backoff: Vec<u64>,
    priority: i32,
    state: DaemonState,
    backoff_index: usize,
    due: Option<Instant>,
    epoch: u64,
}

impl Entry {
    fn current_delay(&self) -> u64 {
        self.backoff[self.backoff_index.min(self.backoff.len() - 1)]
    }

    fn advance_backoff(&mut self) {
        self.backoff_index = (self.backoff_index + 1).min(self.backoff.len() - 1);
    }
}

type HeapItem = Reverse<(Instant, i32, String, u64)>;

/// Restart scheduling for the whole daemon set.
#[derive(Default)]
pub struct RestartQueue {
    entries: HashMap<String, Entry>,
    heap: BinaryHeap<HeapItem>,
}

impl RestartQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a daemon with its backoff schedule and start priority.
    /// Re-registering resets the machine to `stopped`.
    pub fn register(&mut self, name: &str, backoff: &[u64], priority: i32) {
        let backoff = if backoff.is_empty() {
            vec![0]
        } else {
            backoff.to_vec()
        };
        let epoch = self
            .entries
            .get(name)
            .map(|entry| entry.epoch + 1)
            .unwrap_or(0);
        self.entries.insert(
            name.to_string(),
            Entry {
                backoff,
                priority,
                state: DaemonState::Stopped,
                backoff_index: 0,
                due: None,
                epoch,
            },
        );
    }

    /// Drops a daemon from the queue entirely.
    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Current state, if the daemon is known.
    pub fn state(&self, name: &str) -> Option<DaemonState> {
        self.entries.get(name).map(|entry| entry.state)
    }

    /// Pending restart deadline while waiting.
    pub fn restart_at(&self, name: &str) -> Option<Instant> {
        let entry = self.entries.get(name)?;
        match entry.state {
            DaemonState::Waiting => entry.due,
            _ => None,
        }
    }

    /// Schedules a start with zero delay. No-op unless the daemon is
    /// currently `stopped`.
    pub fn request_start(&mut self, name: &str, now: Instant) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        if entry.state != DaemonState::Stopped {
            return;
        }
        entry.state = DaemonState::Waiting;
        entry.due = Some(now);
        entry.epoch += 1;
        self.heap.push(Reverse((
            now,
            entry.priority,
            name.to_string(),
            entry.epoch,
        )));
    }

    /// Re-schedules an immediate start, preserving the backoff position.
    /// While waiting this clears the pending timer; while stopped it behaves
    /// like a plain start request. The caller stops a running child first.
    pub fn request_restart(&mut self, name: &str, now: Instant) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        entry.state = DaemonState::Waiting;
        entry.due = Some(now);
        entry.epoch += 1;
        self.heap.push(Reverse((
            now,
            entry.priority,
            name.to_string(),
            entry.epoch,
        )));
    }

    /// Records a successful start released from the queue.
    pub fn note_started(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.state = DaemonState::Running;
            entry.due = None;
        }
    }

    /// Records a death (or a failed start attempt) and arms the restart
    /// timer. Returns the applied delay in seconds.
    pub fn note_died(
        &mut self,
        name: &str,
        now: Instant,
        uptime: Option<Duration>,
    ) -> Option<u64> {
        let entry = self.entries.get_mut(name)?;

        // A child that stayed up at least as long as the current backoff
        // interval earns a fresh sequence.
        if let Some(uptime) = uptime
            && uptime >= Duration::from_secs(entry.current_delay())
        {
            entry.backoff_index = 0;
        }

        let delay = entry.current_delay();
        let due = now + Duration::from_secs(delay);
        entry.state = DaemonState::Waiting;
        entry.due = Some(due);
        entry.advance_backoff();
        entry.epoch += 1;
        self.heap.push(Reverse((
            due,
            entry.priority,
            name.to_string(),
            entry.epoch,
        )));

        debug!(daemon = name, delay, "restart scheduled");
        Some(delay)
    }

    /// Cancels any pending restart and resets the backoff position. Used for
    /// `stop` and `cancel_restart`.
    pub fn cancel(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            debug!(daemon = name, from = entry.state.as_ref(), "restart cancelled");
            entry.state = DaemonState::Stopped;
            entry.due = None;
            entry.backoff_index = 0;
            entry.epoch += 1;
        }
    }

    /// Pops every daemon whose timer has fired, in `(due, priority, name)`
    /// order. The caller attempts the starts and reports back through
    /// `note_started` or `note_died`.
    pub fn due_daemons(&mut self, now: Instant) -> Vec<String> {
        let mut released = Vec::new();
        while let Some(Reverse((due, _priority, name, epoch))) = self.heap.peek() {
            if *due > now {
                break;
            }
            let due = *due;
            let name = name.clone();
            let epoch = *epoch;
            self.heap.pop();

            let Some(entry) = self.entries.get_mut(&name) else {
                continue;
            };
            if entry.epoch != epoch || entry.state != DaemonState::Waiting {
                continue;
            }
            debug_assert_eq!(entry.due, Some(due));
            entry.due = None;
            released.push(name);
        }
        released
    }

    /// Deadline of the nearest pending restart, for the poll timeout.
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((due, _priority, name, epoch))) = self.heap.peek() {
            let valid = self
                .entries
                .get(name)
                .is_some_and(|entry| {
                    entry.epoch == *epoch && entry.state == DaemonState::Waiting
                });
            if valid {
                return Some(*due);
            }
            self.heap.pop();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(names: &[(&str, &[u64], i32)]) -> RestartQueue {
        let mut queue = RestartQueue::new();
        for (name, backoff, priority) in names {
            queue.register(name, backoff, *priority);
        }
        queue
    }

    #[test]
    fn backoff_escalates_and_repeats_the_tail() {
        let mut queue = queue_with(&[("crashy", &[0, 2, 5], 10)]);
        let t0 = Instant::now();

        queue.request_start("crashy", t0);
        assert_eq!(queue.due_daemons(t0), vec!["crashy"]);
        queue.note_started("crashy");

        // Immediate deaths never earn a reset (dwell threshold grows).
        let mut now = t0;
        let mut delays = Vec::new();
        for _ in 0..4 {
            let delay = queue
                .note_died("crashy", now, Some(Duration::from_millis(10)))
                .unwrap();
            delays.push(delay);
            now += Duration::from_secs(delay);
            assert_eq!(queue.due_daemons(now), vec!["crashy"]);
            queue.note_started("crashy");
        }
        assert_eq!(delays, vec![0, 2, 5, 5]);
    }

    #[test]
    fn long_uptime_resets_the_backoff_position() {
        let mut queue = queue_with(&[("steady", &[0, 2, 5], 10)]);
        let t0 = Instant::now();

        queue.request_start("steady", t0);
        queue.due_daemons(t0);
        queue.note_started("steady");

        // Two quick deaths advance the schedule.
        assert_eq!(
            queue.note_died("steady", t0, Some(Duration::from_millis(1))),
            Some(0)
        );
        queue.due_daemons(t0);
        queue.note_started("steady");
        assert_eq!(
            queue.note_died("steady", t0, Some(Duration::from_millis(1))),
            Some(2)
        );
        let t1 = t0 + Duration::from_secs(2);
        queue.due_daemons(t1);
        queue.note_started("steady");

        // Staying up past the current backoff interval resets the sequence,
        // so this death restarts immediately.
        assert_eq!(
            queue.note_died("steady", t1, Some(Duration::from_secs(30))),
            Some(0)
        );
    }

    #[test]
    fn cancel_resets_and_leaves_the_daemon_stopped() {
        let mut queue = queue_with(&[("crashy", &[0, 2, 5], 10)]);
        let t0 = Instant::now();

        queue.request_start("crashy", t0);
        queue.due_daemons(t0);
        queue.note_started("crashy");
        queue.note_died("crashy", t0, Some(Duration::from_millis(1)));
        queue.note_died("crashy", t0, None);

        assert_eq!(queue.state("crashy"), Some(DaemonState::Waiting));
        queue.cancel("crashy");
        assert_eq!(queue.state("crashy"), Some(DaemonState::Stopped));
        assert_eq!(queue.restart_at("crashy"), None);

        // The armed timer must not fire any more.
        let much_later = t0 + Duration::from_secs(3600);
        assert!(queue.due_daemons(much_later).is_empty());

        // A fresh start begins at the head of the schedule again.
        queue.request_start("crashy", much_later);
        queue.due_daemons(much_later);
        queue.note_started("crashy");
        assert_eq!(
            queue.note_died("crashy", much_later, Some(Duration::from_millis(1))),
            Some(0)
        );
    }

    #[test]
    fn restart_while_waiting_preserves_backoff_position() {
        let mut queue = queue_with(&[("crashy", &[0, 10, 60], 10)]);
        let t0 = Instant::now();

        queue.request_start("crashy", t0);
        queue.due_daemons(t0);
        queue.note_started("crashy");
        queue.note_died("crashy", t0, Some(Duration::from_millis(1)));
        queue.note_died("crashy", t0, None);
        // Now waiting 10 s with the index pointing at 60.
        assert_eq!(queue.state("crashy"), Some(DaemonState::Waiting));

        queue.request_restart("crashy", t0);
        assert_eq!(queue.due_daemons(t0), vec!["crashy"]);
        queue.note_started("crashy");

        // Position was preserved: the next death waits 60 s.
        assert_eq!(
            queue.note_died("crashy", t0, Some(Duration::from_millis(1))),
            Some(60)
        );
    }

    #[test]
    fn simultaneous_starts_are_ordered_by_priority_then_name() {
        let mut queue = queue_with(&[
            ("zeta", &[0], 1),
            ("alpha", &[0], 5),
            ("beta", &[0], 5),
            ("omega", &[0], 20),
        ]);
        let t0 = Instant::now();
        for name in ["omega", "beta", "zeta", "alpha"] {
            queue.request_start(name, t0);
        }

        assert_eq!(
            queue.due_daemons(t0),
            vec!["zeta", "alpha", "beta", "omega"]
        );
    }

    #[test]
    fn next_due_skips_cancelled_entries() {
        let mut queue = queue_with(&[("a", &[5], 10), ("b", &[30], 10)]);
        let t0 = Instant::now();

        queue.request_start("a", t0);
        queue.due_daemons(t0);
        queue.note_started("a");
        queue.note_died("a", t0, None);

        queue.request_start("b", t0);
        queue.due_daemons(t0);
        queue.note_started("b");
        queue.note_died("b", t0, None);

        assert_eq!(queue.next_due(), Some(t0 + Duration::from_secs(5)));
        queue.cancel("a");
        assert_eq!(queue.next_due(), Some(t0 + Duration::from_secs(30)));
        queue.cancel("b");
        assert_eq!(queue.next_due(), None);
    }

    #[test]
    fn due_release_consumes_the_entry_exactly_once() {
        let mut queue = queue_with(&[("one", &[0], 10)]);
        let t0 = Instant::now();
        queue.request_start("one", t0);

        assert_eq!(queue.due_daemons(t0), vec!["one"]);
        assert!(queue.due_daemons(t0).is_empty());
    }
}
