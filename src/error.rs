//! Error handling for the toolbox.
use thiserror::Error;

/// Errors raised while loading or validating a daemons spec file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing the spec file.
    #[error("failed to read spec file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing YAML.
    #[error("invalid YAML format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A daemon entry ended up without a start command after defaults merging.
    #[error("daemon '{daemon}' has no start_command")]
    MissingStartCommand {
        /// The daemon entry at fault.
        daemon: String,
    },

    /// The restart backoff list was present but empty.
    #[error("daemon '{daemon}' declares an empty restart list")]
    EmptyRestartList {
        /// The daemon entry at fault.
        daemon: String,
    },

    /// A stop or admin command named a signal that does not exist.
    #[error("daemon '{daemon}' names unknown signal '{value}'")]
    UnknownSignal {
        /// The daemon entry at fault.
        daemon: String,
        /// The signal name or number as written.
        value: String,
    },

    /// A `${VAR}` reference in the spec file has no value in the environment.
    #[error("missing environment variable: {name}")]
    UnknownEnvVar {
        /// The referenced variable name.
        name: String,
    },

    /// Credentials declared for a daemon could not be resolved.
    #[error("daemon '{daemon}': {source}")]
    Credentials {
        /// The daemon entry at fault.
        daemon: String,
        /// The underlying resolution failure.
        #[source]
        source: PrivilegeError,
    },
}

/// Errors raised while resolving or applying user/group credentials.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    /// The named user does not exist.
    #[error("user '{0}' not found")]
    UnknownUser(String),

    /// The named group does not exist.
    #[error("group '{0}' not found")]
    UnknownGroup(String),

    /// Credentials were requested without the privileges to apply them.
    #[error("user/group switching requires running as root")]
    NotRoot,

    /// System call failure during lookup or switch.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

/// Errors raised while managing a supervised child process.
#[derive(Debug, Error)]
pub enum ChildError {
    /// Error spawning the daemon process.
    #[error("failed to start daemon '{daemon}': {source}")]
    SpawnError {
        /// The daemon that failed to start.
        daemon: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Error delivering the stop procedure.
    #[error("failed to stop daemon '{daemon}': {source}")]
    StopError {
        /// The daemon that failed to stop.
        daemon: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A lifecycle hook exited non-zero.
    #[error("daemon '{daemon}' hook '{hook}' exited with status {status}")]
    HookFailed {
        /// The daemon whose hook failed.
        daemon: String,
        /// Hook name (`before-start` or `after-crash`).
        hook: String,
        /// Raw exit status.
        status: i32,
    },

    /// An administrative command failed to spawn.
    #[error("daemon '{daemon}' command '{command}' failed: {source}")]
    CommandError {
        /// The daemon the command belongs to.
        daemon: String,
        /// The administrative command name.
        command: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An administrative command exited non-zero.
    #[error("daemon '{daemon}' command '{command}' exited with status {status}")]
    CommandFailed {
        /// The daemon the command belongs to.
        daemon: String,
        /// The administrative command name.
        command: String,
        /// Raw exit status.
        status: i32,
    },

    /// An administrative command is not declared for the daemon.
    #[error("daemon '{daemon}' has no command '{command}'")]
    UnknownCommand {
        /// The daemon the request named.
        daemon: String,
        /// The undeclared command name.
        command: String,
    },

    /// Credential errors surfaced while preparing a spawn.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// System call failure.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error serializing or deserializing control messages.
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),

    /// The server replied with an error object.
    #[error("server reported error: {0}")]
    Server(String),

    /// Control socket not available or server not running.
    #[error("control socket not available")]
    NotAvailable,
}

/// Errors fatal to the daemonshepherd supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Spec file error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Child management error.
    #[error(transparent)]
    Child(#[from] ChildError),

    /// Control channel error.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// System call failure.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),

    /// A control request named a daemon that is not in the spec.
    #[error("unknown daemon '{daemon}'")]
    UnknownDaemon {
        /// The daemon the request named.
        daemon: String,
    },
}

/// Errors fatal to the hailerter main loop.
#[derive(Debug, Error)]
pub enum AlerterError {
    /// I/O error on stdin, stdout, or the control socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Control channel error.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// System call failure.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}
