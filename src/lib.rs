//! Process supervision and monitoring-stream alerting tools.

#![warn(unused_crate_dependencies)]
// chrono is only used in the binaries (src/bin/).
use chrono as _;
// assert_cmd and predicates drive the integration test binaries only.
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
use strum as _;

/// hailerter main loop.
pub mod alerter;

/// Child process handle.
pub mod child;

/// CLI parsing.
pub mod cli;

/// Daemons spec file loading.
pub mod config;

/// Constants.
pub mod constants;

/// Control sockets.
pub mod control;

/// Errors.
pub mod error;

/// Per-stream flow records.
pub mod flow;

/// Logging setup.
pub mod logging;

/// Monitoring message model.
pub mod message;

/// Poll multiplexer and signal plumbing.
pub mod poller;

/// Privilege dropping.
pub mod privilege;

/// Restart queue.
pub mod restart;

/// Supervisor daemon.
pub mod supervisor;

/// Stream status tracking.
pub mod tracker;
