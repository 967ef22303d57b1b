// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use crate::{daemon::WaitOutcome, lifecycle::LifecyclePhase};

/// Errors produced by the orchestration library.
///
/// The variants follow the failure classes a test run has to tell apart: configuration mistakes
/// are fatal before anything destructive happens, remote command failures carry the command that
/// failed, timeouts carry the last state observed so that a failed poll still explains itself,
/// and daemon exits are kept distinct from every other failure so that fault-injection code can
/// match on them specifically.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("cannot {transition} daemon {role}: it is {state}")]
    InvalidState {
        role: String,
        transition: &'static str,
        state: String,
    },

    #[error("daemon {role} exited unexpectedly: {outcome}")]
    DaemonExited { role: String, outcome: WaitOutcome },

    #[error("cannot move cluster from {from} to {to}")]
    InvalidPhase {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    #[error("command {args:?} on host {host} failed with exit status {exit_status}")]
    RemoteCommand {
        host: String,
        args: Vec<String>,
        exit_status: i32,
    },

    #[error("timed out after {elapsed:?} waiting for {what} (last observed: {last_observed})")]
    Timeout {
        what: String,
        elapsed: Duration,
        last_observed: String,
    },

    #[error("reached reject state '{state}' while waiting for '{goal}'")]
    RejectState { goal: String, state: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("could not parse output of {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected output from {what}: {output}")]
    UnexpectedOutput { what: String, output: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn assertion(msg: impl Into<String>) -> Self {
        Error::Assertion(msg.into())
    }

    /// True for the failure of a bounded poll, whichever kind of poll it was.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// The exit status of a failed remote command, if this is one.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Error::RemoteCommand { exit_status, .. } => Some(*exit_status),
            _ => None,
        }
    }
}

/// Assert a condition inside a scenario, producing an `Error::Assertion` instead of panicking so
/// that the scenario runner still gets to clean up injected faults.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::Assertion(format!($($arg)+)));
        }
    };
}
