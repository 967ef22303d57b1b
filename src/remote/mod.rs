// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Execution of commands on the hosts of a test cluster.
//!
//! The orchestration code only ever talks to hosts through [`RemoteExecutor`]. The production
//! implementation is [`ssh::SshExecutor`]; tests use the simulated cluster in
//! [`crate::test_env`].

use std::fmt;

use async_trait::async_trait;

use crate::error::{Error, Result};

pub mod ssh;

/// Options for a single foreground command.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub args: Vec<String>,
    /// Prefix the command with `sudo`.
    pub sudo: bool,
    /// Data fed to the command's standard input, which is then closed.
    pub stdin: Option<Vec<u8>>,
    /// When false, a non-zero exit status is returned to the caller instead of becoming an
    /// error.
    pub check_status: bool,
}

impl RunOptions {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RunOptions {
            args: args.into_iter().map(Into::into).collect(),
            sudo: false,
            stdin: None,
            check_status: true,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn unchecked(mut self) -> Self {
        self.check_status = false;
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// The full argument vector, including the privilege prefix if requested.
    pub fn command_line(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        if self.sudo {
            args.push("sudo".to_string());
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Check the exit status the way `check_status` does for foreground commands.
    pub fn check(self, host: &str, args: &[String]) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::RemoteCommand {
                host: host.to_string(),
                args: args.to_vec(),
                exit_status: self.exit_status,
            })
        }
    }
}

/// How a background process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit status {code}"),
            ExitStatus::Signal(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// A process started in the background on a remote host.
///
/// Closing standard input is the termination handle: remote daemons run under a helper that
/// shuts the daemon down when its stdin reaches EOF.
#[async_trait]
pub trait RemoteProcess: Send + fmt::Debug {
    /// Close stdin, asking the process to terminate.
    async fn close_stdin(&mut self) -> Result<()>;

    /// Terminate the process with a hard signal, without waiting for it.
    async fn kill(&mut self) -> Result<()>;

    /// Wait until the process exits.
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Return the exit status if the process has already exited.
    fn try_wait(&mut self) -> Result<Option<ExitStatus>>;
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync + fmt::Debug {
    /// Run a command to completion on `host`.
    ///
    /// Fails with `Error::RemoteCommand` when `opts.check_status` is set and the exit status is
    /// non-zero.
    async fn run(&self, host: &str, opts: RunOptions) -> Result<CommandOutput>;

    /// Start a command on `host` without waiting for it.
    async fn spawn(&self, host: &str, args: Vec<String>) -> Result<Box<dyn RemoteProcess>>;
}

/// Fan a single command out to many hosts, then wait for all of them.
///
/// Every host is attempted even if some fail; the first failure (in host order) is returned.
pub async fn run_on_all(
    executor: &dyn RemoteExecutor,
    hosts: &[String],
    opts: RunOptions,
) -> Result<Vec<CommandOutput>> {
    let futures = hosts
        .iter()
        .map(|host| executor.run(host, opts.clone()));
    futures::future::join_all(futures)
        .await
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_with_sudo() {
        let opts = RunOptions::new(["ceph", "health"]).sudo();
        assert_eq!(opts.command_line(), vec!["sudo", "ceph", "health"]);
        assert!(opts.check_status);
        assert!(!RunOptions::new(["true"]).unchecked().check_status);
    }

    #[test]
    fn check_reports_command() {
        let out = CommandOutput {
            exit_status: 22,
            stdout: String::new(),
        };
        let err = out
            .check("mon0", &["ceph".to_string(), "osd".to_string()])
            .unwrap_err();
        assert_eq!(err.exit_status(), Some(22));
    }
}
