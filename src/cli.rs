//! Command-line interfaces for daemonshepherd and hailerter.
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Parses a duration argument: plain seconds or an integer with an
/// `s`/`m`/`h` suffix. Zero and negative values are rejected.
pub fn parse_duration(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("duration cannot be empty".into());
    }

    let (number_part, factor) = match trimmed.chars().last() {
        Some('s') => (&trimmed[..trimmed.len() - 1], 1),
        Some('m') => (&trimmed[..trimmed.len() - 1], 60),
        Some('h') => (&trimmed[..trimmed.len() - 1], 3600),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => return Err(format!("invalid duration '{trimmed}'")),
    };

    let seconds = number_part
        .parse::<u64>()
        .map_err(|_| format!("invalid duration '{trimmed}'"))?
        .checked_mul(factor)
        .ok_or_else(|| format!("duration '{trimmed}' is out of range"))?;

    if seconds == 0 {
        return Err("duration must be positive".into());
    }

    Ok(seconds)
}

/// Parses a fraction argument: a real number in `[0.0, 1.0]`.
pub fn parse_fraction(value: &str) -> Result<f64, String> {
    let fraction = value
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("invalid fraction '{value}'"))?;

    if !(0.0..=1.0).contains(&fraction) {
        return Err(format!("fraction '{value}' is outside [0.0, 1.0]"));
    }

    Ok(fraction)
}

/// Command-line interface for the daemonshepherd supervisor and client.
#[derive(Parser)]
#[command(name = "daemonshepherd", version, author)]
#[command(about = "Start and supervise a declared set of daemons", long_about = None)]
pub struct ShepherdCli {
    /// Path to the daemons spec file. Required in supervisor mode.
    #[arg(long, value_name = "FILE")]
    pub daemons: Option<PathBuf>,

    /// Path of the administrative control socket.
    #[arg(long, value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Write the supervisor PID to this file.
    #[arg(long = "pid-file", value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Detach from the terminal and run in the background.
    #[arg(long)]
    pub background: bool,

    /// Run the supervisor as this user (requires root).
    #[arg(long, value_name = "USER")]
    pub user: Option<String>,

    /// Run the supervisor as this group (requires root).
    #[arg(long, value_name = "GROUP")]
    pub group: Option<String>,

    /// Append supervisor logs to this file.
    #[arg(long, value_name = "FILE", conflicts_with_all = ["stderr", "syslog", "silent"])]
    pub logging: Option<PathBuf>,

    /// Log to standard error (the default in the foreground).
    #[arg(long, conflicts_with_all = ["syslog", "silent"])]
    pub stderr: bool,

    /// Log to the local syslog daemon.
    #[arg(long, conflicts_with = "silent")]
    pub syslog: bool,

    /// Disable logging output.
    #[arg(long)]
    pub silent: bool,

    /// Client-mode command to send to a running supervisor.
    #[command(subcommand)]
    pub command: Option<ShepherdCommand>,
}

/// Client-mode commands for daemonshepherd.
#[derive(Subcommand)]
pub enum ShepherdCommand {
    /// Ask the supervisor to re-read its spec file.
    Reload,

    /// List daemons with their PIDs and restart timers.
    List,

    /// Start a stopped daemon.
    Start {
        /// Daemon name from the spec file.
        name: String,
    },

    /// Stop a daemon and cancel any pending restart.
    Stop {
        /// Daemon name from the spec file.
        name: String,
    },

    /// Stop a daemon and start it again immediately.
    Restart {
        /// Daemon name from the spec file.
        name: String,
    },

    /// Cancel a pending restart, leaving the daemon stopped.
    CancelRestart {
        /// Daemon name from the spec file.
        name: String,
    },

    /// List the administrative commands a daemon declares.
    ListCommands {
        /// Daemon name from the spec file.
        name: String,
    },

    /// Run one of a daemon's administrative commands.
    Command {
        /// Daemon name from the spec file.
        name: String,
        /// Declared administrative command name.
        command: String,
    },
}

/// Command-line interface for the hailerter tracker and client.
#[derive(Parser)]
#[command(name = "hailerter", version, author)]
#[command(
    about = "Track monitoring streams and emit notifications on status changes",
    long_about = None
)]
pub struct HailerterCli {
    /// Path of the administrative control socket.
    #[arg(long, value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Stay silent about a stream whose first known status is an error.
    #[arg(long = "skip-initial-error")]
    pub skip_initial_error: bool,

    /// Re-send a notification for a still-degraded stream this often.
    #[arg(long = "remind-interval", value_name = "DURATION", value_parser = parse_duration)]
    pub remind_interval: Option<u64>,

    /// Treat warning severity as an expected (ok) state.
    #[arg(long = "warning-expected")]
    pub warning_expected: bool,

    /// Assumed message interval for streams that do not declare one.
    #[arg(long = "default-interval", value_name = "DURATION", value_parser = parse_duration)]
    pub default_interval: Option<u64>,

    /// Declare a stream missing after this many intervals without a message.
    #[arg(long, value_name = "COUNT")]
    pub missing: Option<u32>,

    /// Number of messages the flap detector looks back over.
    #[arg(long = "flapping-window", value_name = "COUNT")]
    pub flapping_window: Option<usize>,

    /// Fraction of status changes within the window that counts as flapping.
    #[arg(long = "flapping-threshold", value_name = "FRACTION", value_parser = parse_fraction)]
    pub flapping_threshold: Option<f64>,

    /// Client-mode command to send to a running tracker.
    #[command(subcommand)]
    pub command: Option<HailerterCommand>,
}

/// Client-mode commands for hailerter.
#[derive(Subcommand)]
pub enum HailerterCommand {
    /// List all tracked streams with their current status.
    List,

    /// Drop a stream's record; the next message recreates it.
    Forget {
        /// Aspect name of the stream.
        aspect: String,
        /// Location as a JSON object of string tags.
        location: String,
    },

    /// List muted streams with their expiry times.
    ListMuted,

    /// Suppress notifications for a stream for a while.
    Mute {
        /// Aspect name of the stream.
        aspect: String,
        /// Location as a JSON object of string tags.
        location: String,
        /// How long to mute, e.g. `600`, `30m`, `2h`.
        #[arg(value_parser = parse_duration)]
        duration: u64,
    },

    /// Lift a mute before it expires.
    Unmute {
        /// Aspect name of the stream.
        aspect: String,
        /// Location as a JSON object of string tags.
        location: String,
    },

    /// Zero a stream's flap detector.
    ResetFlapping {
        /// Aspect name of the stream.
        aspect: String,
        /// Location as a JSON object of string tags.
        location: String,
    },

    /// Clear a stream's notification stamp so the next non-ok message fires.
    ResetReminder {
        /// Aspect name of the stream.
        aspect: String,
        /// Location as a JSON object of string tags.
        location: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_accepts_plain_seconds() {
        assert_eq!(parse_duration("90").unwrap(), 90);
    }

    #[test]
    fn duration_accepts_suffixes() {
        assert_eq!(parse_duration("45s").unwrap(), 45);
        assert_eq!(parse_duration("15m").unwrap(), 900);
        assert_eq!(parse_duration("2h").unwrap(), 7200);
    }

    #[test]
    fn duration_rejects_zero_and_garbage() {
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("0m").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-5").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn fraction_bounds() {
        assert_eq!(parse_fraction("0").unwrap(), 0.0);
        assert_eq!(parse_fraction("1.0").unwrap(), 1.0);
        assert_eq!(parse_fraction("0.25").unwrap(), 0.25);
        assert!(parse_fraction("1.01").is_err());
        assert!(parse_fraction("-0.1").is_err());
        assert!(parse_fraction("half").is_err());
    }

    #[test]
    fn shepherd_cli_parses_client_commands() {
        let cli = ShepherdCli::parse_from([
            "daemonshepherd",
            "--socket",
            "/tmp/shepherd.sock",
            "restart",
            "webapp",
        ]);
        assert!(matches!(
            cli.command,
            Some(ShepherdCommand::Restart { ref name }) if name == "webapp"
        ));
    }

    #[test]
    fn hailerter_cli_parses_tracker_flags() {
        let cli = HailerterCli::parse_from([
            "hailerter",
            "--remind-interval",
            "10m",
            "--missing",
            "3",
            "--flapping-window",
            "4",
            "--flapping-threshold",
            "0.5",
        ]);
        assert_eq!(cli.remind_interval, Some(600));
        assert_eq!(cli.missing, Some(3));
        assert_eq!(cli.flapping_window, Some(4));
        assert_eq!(cli.flapping_threshold, Some(0.5));
        assert!(cli.command.is_none());
    }
}
