//! Spec file management for daemonshepherd.
//!
//! The spec file is a YAML document with an optional `defaults` section and a
//! `daemons` mapping. Defaults fill in any field a daemon entry leaves unset.
//! Reload diffing compares resolved specs structurally through a content
//! hash, so YAML key order never matters.
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, env, fs, path::Path};

use crate::constants::{
    DEFAULT_RESTART_BACKOFF, DEFAULT_START_PRIORITY, RESERVED_COMMANDS,
};
use crate::error::ConfigError;

/// Represents the structure of the spec file.
#[derive(Debug, Clone, Deserialize)]
pub struct SpecFile {
    /// Field values applied to every daemon that leaves them unset.
    #[serde(default)]
    pub defaults: Option<DaemonSpec>,
    /// Map of daemon names to their declarations.
    #[serde(default)]
    pub daemons: BTreeMap<String, DaemonSpec>,
}

/// A command to launch: a shell string or an argv vector.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Launched through `sh -c`.
    Shell(String),
    /// Executed directly.
    Argv(Vec<String>),
}

/// A signal written as a name (`TERM`, `SIGTERM`) or a number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SignalSpec {
    /// Numeric signal value.
    Number(i32),
    /// Symbolic signal name, `SIG` prefix optional, case-insensitive.
    Name(String),
}

impl SignalSpec {
    /// Resolves the declared value to a concrete signal.
    pub fn resolve(&self) -> Option<nix::sys::signal::Signal> {
        match self {
            SignalSpec::Number(number) => {
                nix::sys::signal::Signal::try_from(*number).ok()
            }
            SignalSpec::Name(name) => {
                let upper = name.trim().to_ascii_uppercase();
                let full = if upper.starts_with("SIG") {
                    upper
                } else {
                    format!("SIG{upper}")
                };
                full.parse().ok()
            }
        }
    }

    fn display(&self) -> String {
        match self {
            SignalSpec::Number(number) => number.to_string(),
            SignalSpec::Name(name) => name.clone(),
        }
    }
}

/// Group credentials: a single group, or a primary group followed by
/// supplementary ones.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum GroupSpec {
    /// A single primary group.
    One(String),
    /// Primary group first, supplementary groups after.
    Many(Vec<String>),
}

impl GroupSpec {
    /// The primary group name, if any was declared.
    pub fn primary(&self) -> Option<&str> {
        match self {
            GroupSpec::One(name) => Some(name.as_str()),
            GroupSpec::Many(names) => names.first().map(String::as_str),
        }
    }

    /// Supplementary group names beyond the primary.
    pub fn supplementary(&self) -> &[String] {
        match self {
            GroupSpec::One(_) => &[],
            GroupSpec::Many(names) if names.len() > 1 => &names[1..],
            GroupSpec::Many(_) => &[],
        }
    }
}

/// How a daemon stops: an explicit command, a signal, or the default
/// termination signal to the whole process group. `command` wins when both
/// are declared.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct StopSpec {
    /// Command spawned to stop the daemon.
    pub command: Option<CommandLine>,
    /// Signal delivered instead of running a command.
    pub signal: Option<SignalSpec>,
    /// Whether the signal targets the whole process group.
    pub process_group: Option<bool>,
}

/// Destination of a daemon's standard output and error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutMode {
    /// Inherit the supervisor's descriptors.
    #[default]
    Console,
    /// Wire both streams to `/dev/null`.
    Devnull,
    /// Capture both streams through a pipe and re-emit lines via the logger.
    Log,
}

/// An administrative command declared under a daemon's `commands` mapping.
/// Unset fields inherit from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct AdminCommandSpec {
    /// Command to spawn.
    pub command: Option<CommandLine>,
    /// Signal delivered instead of running a command.
    pub signal: Option<SignalSpec>,
    /// Whether the signal targets the whole process group.
    pub process_group: Option<bool>,
    /// User to run the command as.
    pub user: Option<String>,
    /// Group(s) to run the command as.
    pub group: Option<GroupSpec>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Environment for the command; replaces the parent environment.
    pub environment: Option<BTreeMap<String, String>>,
    /// Override of the zeroth argv.
    pub argv0: Option<String>,
}

/// The declared configuration of one supervised daemon.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct DaemonSpec {
    /// Command that launches the daemon. Required after defaults merging.
    pub start_command: Option<CommandLine>,
    /// Override of the zeroth argv.
    pub argv0: Option<String>,
    /// Stop procedure; `commands.stop` takes precedence when declared.
    pub stop: Option<StopSpec>,
    /// Environment for the daemon; REPLACES the parent environment.
    pub environment: Option<BTreeMap<String, String>>,
    /// Working directory.
    pub cwd: Option<String>,
    /// User to run the daemon as; applied only when running privileged.
    pub user: Option<String>,
    /// Group(s) to run the daemon as; applied only when running privileged.
    pub group: Option<GroupSpec>,
    /// Where the daemon's output goes.
    pub stdout: Option<StdoutMode>,
    /// Backoff schedule in seconds; the last value repeats indefinitely.
    pub restart: Option<Vec<u64>>,
    /// Start ordering; lower starts earlier.
    pub start_priority: Option<i32>,
    /// Administrative commands, including the reserved lifecycle hooks.
    #[serde(default)]
    pub commands: BTreeMap<String, AdminCommandSpec>,
}

impl DaemonSpec {
    /// Fills unset fields from the spec file's `defaults` section.
    pub fn merge_defaults(&mut self, defaults: &DaemonSpec) {
        if self.start_command.is_none() {
            self.start_command = defaults.start_command.clone();
        }
        if self.argv0.is_none() {
            self.argv0 = defaults.argv0.clone();
        }
        if self.stop.is_none() {
            self.stop = defaults.stop.clone();
        }
        if self.environment.is_none() {
            self.environment = defaults.environment.clone();
        }
        if self.cwd.is_none() {
            self.cwd = defaults.cwd.clone();
        }
        if self.user.is_none() {
            self.user = defaults.user.clone();
        }
        if self.group.is_none() {
            self.group = defaults.group.clone();
        }
        if self.stdout.is_none() {
            self.stdout = defaults.stdout;
        }
        if self.restart.is_none() {
            self.restart = defaults.restart.clone();
        }
        if self.start_priority.is_none() {
            self.start_priority = defaults.start_priority;
        }
        for (name, command) in &defaults.commands {
            self.commands
                .entry(name.clone())
                .or_insert_with(|| command.clone());
        }
    }

    /// Checks the resolved spec for errors that must fail the load.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.start_command.is_none() {
            return Err(ConfigError::MissingStartCommand {
                daemon: name.to_string(),
            });
        }

        if let Some(restart) = &self.restart
            && restart.is_empty()
        {
            return Err(ConfigError::EmptyRestartList {
                daemon: name.to_string(),
            });
        }

        if let Some(stop) = &self.stop
            && let Some(signal) = &stop.signal
            && signal.resolve().is_none()
        {
            return Err(ConfigError::UnknownSignal {
                daemon: name.to_string(),
                value: signal.display(),
            });
        }

        for command in self.commands.values() {
            if let Some(signal) = &command.signal
                && signal.resolve().is_none()
            {
                return Err(ConfigError::UnknownSignal {
                    daemon: name.to_string(),
                    value: signal.display(),
                });
            }
        }

        Ok(())
    }

    /// Computes a stable hash of this spec. Reload diffing treats two specs
    /// as equal iff their hashes are equal; live state never participates.
    pub fn compute_hash(&self) -> String {
        let json = serde_json::to_string(self)
            .expect("DaemonSpec should always be serializable");

        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        let result = hasher.finalize();

        format!(
            "{:016x}",
            u64::from_be_bytes(result[0..8].try_into().unwrap())
        )
    }

    /// The backoff schedule, falling back to the built-in default.
    pub fn restart_backoff(&self) -> &[u64] {
        self.restart.as_deref().unwrap_or(DEFAULT_RESTART_BACKOFF)
    }

    /// The start priority, falling back to the built-in default.
    pub fn start_priority(&self) -> i32 {
        self.start_priority.unwrap_or(DEFAULT_START_PRIORITY)
    }

    /// Where the daemon's output goes.
    pub fn stdout_mode(&self) -> StdoutMode {
        self.stdout.unwrap_or_default()
    }

    /// Resolves an administrative command with daemon inheritance applied:
    /// unset `user`/`group`/`cwd`/`environment`/`argv0` fall back to the
    /// daemon's own values.
    pub fn resolved_command(&self, name: &str) -> Option<AdminCommandSpec> {
        let declared = self.commands.get(name)?;
        Some(AdminCommandSpec {
            command: declared.command.clone(),
            signal: declared.signal.clone(),
            process_group: declared.process_group,
            user: declared.user.clone().or_else(|| self.user.clone()),
            group: declared.group.clone().or_else(|| self.group.clone()),
            cwd: declared.cwd.clone().or_else(|| self.cwd.clone()),
            environment: declared
                .environment
                .clone()
                .or_else(|| self.environment.clone()),
            argv0: declared.argv0.clone().or_else(|| self.argv0.clone()),
        })
    }

    /// Administrative command names a client may invoke. The reserved
    /// lifecycle hooks are reachable only through their lifecycle events.
    pub fn listable_commands(&self) -> Vec<String> {
        self.commands
            .keys()
            .filter(|name| !RESERVED_COMMANDS.contains(&name.as_str()))
            .cloned()
            .collect()
    }
}

/// Expands `${VAR}` references from the supervisor environment. An unset
/// variable fails the load.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    let mut missing: Option<String> = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        match env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            }
        }
    });

    if let Some(name) = missing {
        return Err(ConfigError::UnknownEnvVar { name });
    }

    Ok(result.into_owned())
}

/// Loads and validates a spec file, expanding environment variables and
/// merging `defaults` into every daemon entry.
pub fn load_spec(path: &Path) -> Result<SpecFile, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        ConfigError::ReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let mut spec: SpecFile = serde_yaml::from_str(&expanded)?;

    if let Some(defaults) = spec.defaults.clone() {
        for daemon in spec.daemons.values_mut() {
            daemon.merge_defaults(&defaults);
        }
    }

    for (name, daemon) in &spec.daemons {
        daemon.validate(name)?;
    }

    Ok(spec)
}
