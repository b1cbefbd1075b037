//! Default values shared by both programs.

use std::time::Duration;

/// Backoff schedule applied when a daemon declares no `restart` list.
pub const DEFAULT_RESTART_BACKOFF: &[u64] = &[0, 5, 15, 30, 60];

/// Start priority applied when a daemon declares none. Lower starts earlier.
pub const DEFAULT_START_PRIORITY: i32 = 10;

/// Upper bound on the controller poll sleep.
pub const POLL_TICK: Duration = Duration::from_secs(1);

/// How long a stopped child may linger before it is force-killed.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Polling step used while waiting out the stop grace.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Command names reserved for lifecycle hooks; they are not listed by
/// `list-commands` and cannot be invoked through `admin_command`.
pub const RESERVED_COMMANDS: &[&str] = &["stop", "before-start", "after-crash"];

/// Hook executed synchronously before each start attempt.
pub const HOOK_BEFORE_START: &str = "before-start";

/// Hook executed after an unexpected exit, before the restart timer arms.
pub const HOOK_AFTER_CRASH: &str = "after-crash";

/// Environment variable exported to administrative commands.
pub const ENV_DAEMON_PID: &str = "DAEMON_PID";

/// Environment variable exported to `after-crash` on a normal exit.
pub const ENV_DAEMON_EXIT_CODE: &str = "DAEMON_EXIT_CODE";

/// Environment variable exported to `after-crash` on a signal death.
pub const ENV_DAEMON_SIGNAL: &str = "DAEMON_SIGNAL";

/// Messages dated further than this into the future are discarded.
pub const FUTURE_MESSAGE_MARGIN: i64 = 300;

/// Flap detector window width when `--flapping-window` is omitted.
pub const DEFAULT_FLAP_WINDOW: usize = 12;

/// Flap detector threshold when `--flapping-threshold` is omitted.
pub const DEFAULT_FLAP_THRESHOLD: f64 = 0.5;
