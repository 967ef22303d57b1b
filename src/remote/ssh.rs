// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! ssh.rs
//!
//! Runs commands on cluster hosts through the system `ssh` client.

use std::process::Stdio;

use {
    async_trait::async_trait,
    log::debug,
    tokio::{
        io::AsyncWriteExt,
        process::{Child, ChildStdin, Command},
    },
};

use super::{CommandOutput, ExitStatus, RemoteExecutor, RemoteProcess, RunOptions};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SshExecutor {
    /// Login user, if different from the local user.
    pub user: Option<String>,
    /// Extra options passed to every ssh invocation, e.g. `["-o", "BatchMode=yes"]`.
    pub ssh_options: Vec<String>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        SshExecutor {
            user: None,
            ssh_options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
            ],
        }
    }
}

impl SshExecutor {
    fn command(&self, host: &str, args: &[String]) -> Command {
        let target = match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        };
        let remote_command = args
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");

        let mut command = Command::new("ssh");
        command
            .args(&self.ssh_options)
            .arg(target)
            .arg(remote_command);
        command
    }
}

/// Quote an argument for the remote shell. Arguments made only of safe characters are passed
/// through so that logged command lines stay readable.
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn convert_status(status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => ExitStatus::Code(code),
        None => ExitStatus::Signal(status.signal().unwrap_or(0)),
    }
}

/// Write `input` to the child's stdin while draining its stdout. Doing one after the other
/// deadlocks once both pipes fill, e.g. `tee` on a large file.
async fn feed_and_collect(
    mut child: Child,
    input: Option<&[u8]>,
) -> std::io::Result<std::process::Output> {
    let stdin = child.stdin.take();
    let feed = async move {
        if let (Some(mut stdin), Some(data)) = (stdin, input) {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    fed?;
    Ok(output)
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &str, opts: RunOptions) -> Result<CommandOutput> {
        let args = opts.command_line();
        debug!("{host}> {}", args.join(" "));

        let mut child = self
            .command(host, &args)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .spawn()?;

        let output = feed_and_collect(child, opts.stdin.as_deref()).await?;
        let exit_status = match convert_status(output.status) {
            ExitStatus::Code(code) => code,
            // Report signals the way a shell would.
            ExitStatus::Signal(sig) => 128 + sig,
        };

        let output = CommandOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        };
        if opts.check_status {
            output.check(host, &args)
        } else {
            Ok(output)
        }
    }

    async fn spawn(&self, host: &str, args: Vec<String>) -> Result<Box<dyn RemoteProcess>> {
        debug!("{host}> {} &", args.join(" "));
        let mut child = self
            .command(host, &args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(Box::new(SshProcess { child, stdin }))
    }
}

#[derive(Debug)]
struct SshProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl RemoteProcess for SshProcess {
    async fn close_stdin(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(convert_status(self.child.wait().await?))
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?.map(convert_status))
    }
}

#[cfg(test)]
mod tests {
    use std::{process::Stdio, time::Duration};

    use tokio::process::Command;

    use super::{feed_and_collect, shell_quote};

    #[tokio::test]
    async fn large_input_is_echoed_back() {
        // Far beyond what a pipe buffers, so stdin and stdout have to move together.
        let input = vec![b'x'; 4 << 20];
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let collect = feed_and_collect(child, Some(&input));
        let output = tokio::time::timeout(Duration::from_secs(30), collect)
            .await
            .expect("cat stalled")
            .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), input.len());
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("osd.0"), "osd.0");
        assert_eq!(shell_quote("--name=client.0"), "--name=client.0");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote(r"\[ERR\]|\[WRN\]"), r"'\[ERR\]|\[WRN\]'");
    }
}
