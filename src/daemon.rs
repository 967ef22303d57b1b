// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};

use {
    futures::future,
    log::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    remote::{ExitStatus, RemoteExecutor, RemoteProcess},
    role::{Role, RoleType},
};

/// Default bound on how long a graceful stop may take before it is reported as a timeout.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotStarted,
    Running,
    /// Exited after a graceful stop, or on its own with a clean status.
    Stopped,
    /// Killed, or exited on its own with a non-zero status or a signal.
    Failed,
    /// Transient state while a restart stops the old process.
    Restarting,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DaemonState::NotStarted => "not-started",
                DaemonState::Running => "running",
                DaemonState::Stopped => "stopped",
                DaemonState::Failed => "failed",
                DaemonState::Restarting => "restarting",
            }
        )
    }
}

/// The result of waiting on a daemon. Expected and unexpected exits are both plain values here;
/// it is up to the caller to decide which outcome it wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    ExitedCleanly,
    ExitedWithStatus(i32),
    ExitedWithSignal(i32),
    StillRunning,
}

impl WaitOutcome {
    pub fn is_clean(&self) -> bool {
        *self == WaitOutcome::ExitedCleanly
    }

    pub fn has_exited(&self) -> bool {
        *self != WaitOutcome::StillRunning
    }

    /// Treat anything but a clean exit as an error.
    pub fn into_result(self, role: &Role) -> Result<()> {
        match self {
            WaitOutcome::ExitedCleanly => Ok(()),
            outcome => Err(Error::DaemonExited {
                role: role.to_string(),
                outcome,
            }),
        }
    }
}

impl From<ExitStatus> for WaitOutcome {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Code(0) => WaitOutcome::ExitedCleanly,
            ExitStatus::Code(code) => WaitOutcome::ExitedWithStatus(code),
            ExitStatus::Signal(sig) => WaitOutcome::ExitedWithSignal(sig),
        }
    }
}

impl fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitOutcome::ExitedCleanly => write!(f, "exited cleanly"),
            WaitOutcome::ExitedWithStatus(code) => write!(f, "exited with status {code}"),
            WaitOutcome::ExitedWithSignal(sig) => write!(f, "killed by signal {sig}"),
            WaitOutcome::StillRunning => write!(f, "still running"),
        }
    }
}

/// How to launch a daemon: the command line, without any `sudo` prefix handling; the launch
/// command is passed to the executor verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LaunchSpec {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The standard launch line for a storage daemon: run in the foreground under a helper that
    /// delivers `signal` to the daemon when stdin closes.
    pub fn ceph_daemon(role: &Role, signal: &str, coverage_dir: &str) -> Self {
        LaunchSpec::new([
            "sudo".to_string(),
            "adjust-ulimits".to_string(),
            "ceph-coverage".to_string(),
            coverage_dir.to_string(),
            "daemon-helper".to_string(),
            signal.to_string(),
            format!("ceph-{}", role.kind),
            "-f".to_string(),
            "-i".to_string(),
            role.id.clone(),
        ])
    }
}

/// One daemon process bound to a role on a host.
#[derive(Debug)]
pub struct DaemonHandle {
    role: Role,
    host: String,
    launch: LaunchSpec,
    state: DaemonState,
    process: Option<Box<dyn RemoteProcess>>,
    last_exit: Option<WaitOutcome>,
    executor: Arc<dyn RemoteExecutor>,
}

impl DaemonHandle {
    pub fn new(role: Role, host: &str, launch: LaunchSpec, executor: Arc<dyn RemoteExecutor>) -> Self {
        DaemonHandle {
            role,
            host: host.to_string(),
            launch,
            state: DaemonState::NotStarted,
            process: None,
            last_exit: None,
            executor,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn running(&self) -> bool {
        self.state == DaemonState::Running
    }

    pub fn last_exit(&self) -> Option<WaitOutcome> {
        self.last_exit
    }

    fn invalid(&self, transition: &'static str) -> Error {
        Error::InvalidState {
            role: self.role.to_string(),
            transition,
            state: self.state.to_string(),
        }
    }

    fn record_exit(&mut self, outcome: WaitOutcome) {
        self.process = None;
        self.last_exit = Some(outcome);
        self.state = if outcome.is_clean() {
            DaemonState::Stopped
        } else {
            DaemonState::Failed
        };
    }

    /// Check whether a running daemon has exited on its own since it was last looked at.
    pub fn poll_exit(&mut self) -> Result<DaemonState> {
        if self.state == DaemonState::Running {
            if let Some(process) = self.process.as_mut() {
                if let Some(status) = process.try_wait()? {
                    warn!("daemon {} exited on its own: {status}", self.role);
                    self.record_exit(status.into());
                }
            }
        }
        Ok(self.state)
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_with_args(&[]).await
    }

    async fn start_with_args(&mut self, extra_args: &[String]) -> Result<()> {
        match self.state {
            DaemonState::Running => return Ok(()),
            DaemonState::Restarting => return Err(self.invalid("start")),
            DaemonState::NotStarted | DaemonState::Stopped | DaemonState::Failed => {}
        }

        let mut args = self.launch.args.clone();
        args.extend_from_slice(extra_args);
        let process = self.executor.spawn(&self.host, args).await?;
        self.process = Some(process);
        self.state = DaemonState::Running;
        info!("started {} on {}", self.role, self.host);
        Ok(())
    }

    /// Gracefully stop the daemon by closing its stdin, waiting up to `timeout` for it to exit.
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        match self.state {
            DaemonState::Stopped => return Ok(()),
            DaemonState::Running | DaemonState::Restarting => {}
            DaemonState::NotStarted | DaemonState::Failed => return Err(self.invalid("stop")),
        }

        let Some(process) = self.process.as_mut() else {
            self.state = DaemonState::Stopped;
            return Ok(());
        };
        process.close_stdin().await?;
        debug!("waiting for {} to exit", self.role);
        let status = match tokio::time::timeout(timeout, process.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                return Err(Error::Timeout {
                    what: format!("{} to stop", self.role),
                    elapsed: timeout,
                    last_observed: DaemonState::Running.to_string(),
                })
            }
        };

        let outcome = WaitOutcome::from(status);
        if !outcome.is_clean() {
            debug!("{} {outcome} while stopping", self.role);
        }
        // A requested stop is a stop, whatever status the helper reported.
        self.process = None;
        self.last_exit = Some(outcome);
        self.state = DaemonState::Stopped;
        info!("stopped {}", self.role);
        Ok(())
    }

    /// Hard-kill the daemon. This is a fault-injection primitive: the daemon ends up `Failed`.
    pub async fn kill(&mut self) -> Result<()> {
        match self.state {
            DaemonState::Failed => return Ok(()),
            DaemonState::Running => {}
            _ => return Err(self.invalid("kill")),
        }

        if let Some(process) = self.process.as_mut() {
            process.kill().await?;
            let status = process.wait().await?;
            self.process = None;
            self.last_exit = Some(status.into());
        }
        self.state = DaemonState::Failed;
        info!("killed {}", self.role);
        Ok(())
    }

    /// Stop the daemon if it is running, then start it again.
    pub async fn restart(&mut self) -> Result<()> {
        self.restart_with_args(&[]).await
    }

    /// Restart with extra arguments appended to the launch command for this run only.
    pub async fn restart_with_args(&mut self, extra_args: &[String]) -> Result<()> {
        if self.state == DaemonState::Restarting {
            return Err(self.invalid("restart"));
        }
        info!("restarting {}", self.role);
        if self.state == DaemonState::Running {
            self.state = DaemonState::Restarting;
            if let Err(e) = self.stop(STOP_TIMEOUT).await {
                self.state = DaemonState::Running;
                return Err(e);
            }
        }
        self.start_with_args(extra_args).await
    }

    /// Wait until the daemon is no longer running.
    ///
    /// With a timeout, returns `WaitOutcome::StillRunning` if the daemon outlives it. For a
    /// daemon that already exited, returns how it exited.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        match self.state {
            DaemonState::NotStarted => return Err(self.invalid("wait for")),
            DaemonState::Stopped | DaemonState::Failed => {
                return Ok(self.last_exit.unwrap_or(WaitOutcome::ExitedCleanly))
            }
            DaemonState::Running | DaemonState::Restarting => {}
        }

        let Some(process) = self.process.as_mut() else {
            return Err(self.invalid("wait for"));
        };
        let status = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, process.wait()).await {
                Ok(status) => status?,
                Err(_) => return Ok(WaitOutcome::StillRunning),
            },
            None => process.wait().await?,
        };

        let outcome = WaitOutcome::from(status);
        self.record_exit(outcome);
        info!("{} {outcome}", self.role);
        Ok(outcome)
    }
}

/// Owns every daemon handle in the cluster, keyed by role type and id.
///
/// The registry is only touched from the orchestrating task. Operations on several daemons
/// fan out concurrently and merge their results back here.
#[derive(Debug, Default)]
pub struct DaemonRegistry {
    daemons: BTreeMap<RoleType, BTreeMap<String, DaemonHandle>>,
}

impl DaemonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a daemon. An existing daemon for the same role is stopped and replaced.
    pub async fn add(
        &mut self,
        role: Role,
        host: &str,
        launch: LaunchSpec,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Result<&mut DaemonHandle> {
        let by_id = self.daemons.entry(role.kind).or_default();
        let handle = DaemonHandle::new(role, host, launch, executor);
        match by_id.entry(handle.role.id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().running() {
                    entry.get_mut().stop(STOP_TIMEOUT).await?;
                }
                entry.insert(handle);
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => Ok(entry.insert(handle)),
        }
    }

    pub fn get(&self, kind: RoleType, id: &str) -> Result<&DaemonHandle> {
        self.daemons
            .get(&kind)
            .and_then(|by_id| by_id.get(id))
            .ok_or_else(|| Error::not_found("daemon", format!("{kind}.{id}")))
    }

    pub fn get_mut(&mut self, kind: RoleType, id: &str) -> Result<&mut DaemonHandle> {
        self.daemons
            .get_mut(&kind)
            .and_then(|by_id| by_id.get_mut(id))
            .ok_or_else(|| Error::not_found("daemon", format!("{kind}.{id}")))
    }

    pub fn get_role(&self, role: &Role) -> Result<&DaemonHandle> {
        self.get(role.kind, &role.id)
    }

    pub fn get_role_mut(&mut self, role: &Role) -> Result<&mut DaemonHandle> {
        self.get_mut(role.kind, &role.id)
    }

    pub fn iter_of_type(&self, kind: RoleType) -> impl Iterator<Item = &DaemonHandle> {
        self.daemons.get(&kind).into_iter().flat_map(|by_id| by_id.values())
    }

    pub fn ids_of_type(&self, kind: RoleType) -> Vec<String> {
        self.iter_of_type(kind).map(|d| d.role.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DaemonHandle> {
        self.daemons.values().flat_map(|by_id| by_id.values())
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Resolve a role selection into concrete roles.
    ///
    /// - `None` selects every registered daemon of the given types.
    /// - `"all"` does the same.
    /// - `"osd.*"` selects every registered daemon of that type.
    /// - `"osd.0"` is passed through as-is.
    ///
    /// Entries that are malformed or whose type is not in `types` are configuration errors.
    pub fn resolve(&self, patterns: Option<&[String]>, types: &[RoleType]) -> Result<Vec<Role>> {
        let all_of = |kind: RoleType| self.iter_of_type(kind).map(|d| d.role.clone());

        let Some(patterns) = patterns else {
            return Ok(types.iter().flat_map(|t| all_of(*t)).collect());
        };

        let mut resolved = Vec::new();
        for pattern in patterns {
            if pattern == "all" {
                resolved.extend(types.iter().flat_map(|t| all_of(*t)));
                continue;
            }
            let Some((kind, id)) = pattern.split_once('.') else {
                return Err(Error::config(format!(
                    "invalid role '{pattern}', roles must be of format <type>.<id>"
                )));
            };
            let kind: RoleType = kind.parse()?;
            if !types.contains(&kind) {
                return Err(Error::config(format!(
                    "invalid role type '{kind}' in role '{pattern}'"
                )));
            }
            if id == "*" {
                resolved.extend(all_of(kind));
            } else {
                resolved.push(pattern.parse()?);
            }
        }
        Ok(resolved)
    }

    /// Start every daemon of a type concurrently.
    pub async fn start_type(&mut self, kind: RoleType) -> Result<()> {
        let Some(by_id) = self.daemons.get_mut(&kind) else {
            return Ok(());
        };
        let results = future::join_all(by_id.values_mut().map(|d| d.start())).await;
        results.into_iter().collect()
    }

    /// Stop every running daemon of a type concurrently. All daemons are attempted; the errors of
    /// those that failed to stop are returned.
    pub async fn stop_type(&mut self, kind: RoleType, timeout: Duration) -> Vec<Error> {
        let Some(by_id) = self.daemons.get_mut(&kind) else {
            return Vec::new();
        };
        let futures = by_id
            .values_mut()
            .filter(|d| matches!(d.state(), DaemonState::Running | DaemonState::Restarting))
            .map(|d| d.stop(timeout));
        future::join_all(futures)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect()
    }

    /// Run `op` on each selected daemon concurrently.
    ///
    /// Every role must be registered or nothing runs. All operations are attempted even if some
    /// fail; the first error in registry order is returned.
    pub async fn fan_out<'a, F, Fut>(&'a mut self, roles: &[Role], mut op: F) -> Result<()>
    where
        F: FnMut(&'a mut DaemonHandle) -> Fut,
        Fut: Future<Output = Result<()>> + 'a,
    {
        for role in roles {
            self.get_role(role)?;
        }
        let futures = self
            .daemons
            .values_mut()
            .flat_map(|by_id| by_id.values_mut())
            .filter(|d| roles.contains(&d.role))
            .map(|d| op(d));
        future::join_all(futures).await.into_iter().collect()
    }

    pub async fn start_roles(&mut self, roles: &[Role]) -> Result<()> {
        for role in roles {
            self.get_role_mut(role)?.start().await?;
        }
        Ok(())
    }

    pub async fn stop_roles(&mut self, roles: &[Role]) -> Result<()> {
        for role in roles {
            let daemon = self.get_role_mut(role)?;
            if daemon.running() {
                daemon.stop(STOP_TIMEOUT).await?;
            } else {
                warn!("tried to stop non-running daemon {role}");
            }
        }
        Ok(())
    }

    pub async fn restart_roles(&mut self, roles: &[Role]) -> Result<()> {
        for role in roles {
            self.get_role_mut(role)?.restart().await?;
        }
        Ok(())
    }

    pub async fn kill_roles(&mut self, roles: &[Role]) -> Result<()> {
        for role in roles {
            self.get_role_mut(role)?.kill().await?;
        }
        Ok(())
    }

    /// Wait for each selected daemon to fail on its own.
    ///
    /// This is the one place where a non-clean exit is the expected result: it succeeds only if
    /// every daemon exits with a failure status, and fails with `Error::Assertion` for a daemon
    /// that exits cleanly or is still running after `timeout`.
    pub async fn wait_for_failure(&mut self, roles: &[Role], timeout: Option<Duration>) -> Result<()> {
        for role in roles {
            let outcome = self.get_role_mut(role)?.wait(timeout).await?;
            match outcome {
                WaitOutcome::ExitedWithStatus(_) | WaitOutcome::ExitedWithSignal(_) => {
                    info!("saw expected failure of {role}: {outcome}");
                }
                other => {
                    return Err(Error::assertion(format!(
                        "daemon {role} did not fail: {other}"
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::{test_config, SimCluster};

    const COVERAGE: &str = "/tmp/cephtest/archive/coverage";

    fn sim() -> SimCluster {
        SimCluster::new(&test_config(&[("node0", &["mon.a", "osd.0", "osd.1"])]).unwrap())
    }

    fn handle(sim: &SimCluster, role: &str) -> DaemonHandle {
        let role: Role = role.parse().unwrap();
        let launch = LaunchSpec::ceph_daemon(&role, "kill", COVERAGE);
        DaemonHandle::new(role, "node0", launch, sim.executor())
    }

    async fn registry(sim: &SimCluster) -> DaemonRegistry {
        let mut registry = DaemonRegistry::new();
        for name in ["mon.a", "osd.0", "osd.1"] {
            let role: Role = name.parse().unwrap();
            let launch = LaunchSpec::ceph_daemon(&role, "kill", COVERAGE);
            registry
                .add(role, "node0", launch, sim.executor())
                .await
                .unwrap();
        }
        registry
    }

    fn assert_invalid(err: Error, expected: &str, from: DaemonState) {
        match err {
            Error::InvalidState {
                transition, state, ..
            } => {
                assert_eq!(transition, expected);
                assert_eq!(state, from.to_string());
            }
            other => panic!("expected a refused {expected}, got {other}"),
        }
    }

    #[test]
    fn wait_outcome_from_status() {
        assert_eq!(WaitOutcome::from(ExitStatus::Code(0)), WaitOutcome::ExitedCleanly);
        assert_eq!(
            WaitOutcome::from(ExitStatus::Code(1)),
            WaitOutcome::ExitedWithStatus(1)
        );
        assert_eq!(
            WaitOutcome::from(ExitStatus::Signal(9)),
            WaitOutcome::ExitedWithSignal(9)
        );
    }

    #[test]
    fn unclean_exit_is_daemon_exited() {
        let role = Role::osd(1);
        assert!(WaitOutcome::ExitedCleanly.into_result(&role).is_ok());
        match WaitOutcome::ExitedWithSignal(9).into_result(&role) {
            Err(Error::DaemonExited { role, outcome }) => {
                assert_eq!(role, "osd.1");
                assert_eq!(outcome, WaitOutcome::ExitedWithSignal(9));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn launch_line() {
        let spec = LaunchSpec::ceph_daemon(&Role::mds("a"), "kill", "/tmp/cephtest/archive/coverage");
        assert_eq!(
            spec.args[4..],
            ["daemon-helper", "kill", "ceph-mds", "-f", "-i", "a"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_from_the_wrong_state_are_refused() {
        let sim = sim();
        let mut osd = handle(&sim, "osd.0");
        assert_invalid(osd.kill().await.unwrap_err(), "kill", DaemonState::NotStarted);
        assert_invalid(
            osd.stop(STOP_TIMEOUT).await.unwrap_err(),
            "stop",
            DaemonState::NotStarted,
        );
        assert_invalid(osd.wait(None).await.unwrap_err(), "wait for", DaemonState::NotStarted);

        osd.start().await.unwrap();
        osd.start().await.unwrap();
        assert_eq!(sim.count_commands("ceph-osd -f -i 0"), 1);

        osd.kill().await.unwrap();
        assert_eq!(osd.state(), DaemonState::Failed);
        assert_eq!(osd.last_exit(), Some(WaitOutcome::ExitedWithSignal(9)));
        osd.kill().await.unwrap();
        assert_invalid(
            osd.stop(STOP_TIMEOUT).await.unwrap_err(),
            "stop",
            DaemonState::Failed,
        );

        osd.restart().await.unwrap();
        assert!(osd.running());
        osd.stop(STOP_TIMEOUT).await.unwrap();
        osd.stop(STOP_TIMEOUT).await.unwrap();
        assert_eq!(osd.state(), DaemonState::Stopped);
        assert!(!sim.is_running(osd.role()));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_reports_how_the_daemon_exited() {
        let sim = sim();
        sim.fail_command("ceph-osd -f -i 1", 1);
        let mut osd0 = handle(&sim, "osd.0");
        let mut osd1 = handle(&sim, "osd.1");
        osd0.start().await.unwrap();
        osd1.start().await.unwrap();

        assert_eq!(osd1.wait(None).await.unwrap(), WaitOutcome::ExitedWithStatus(1));
        assert_eq!(osd1.state(), DaemonState::Failed);
        assert_eq!(osd1.wait(None).await.unwrap(), WaitOutcome::ExitedWithStatus(1));

        assert_eq!(
            osd0.wait(Some(Duration::from_secs(5))).await.unwrap(),
            WaitOutcome::StillRunning
        );
        assert!(osd0.running());
        sim.crash(osd0.role(), 6);
        assert_eq!(osd0.poll_exit().unwrap(), DaemonState::Failed);
        assert_eq!(osd0.wait(None).await.unwrap(), WaitOutcome::ExitedWithSignal(6));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_and_selection() {
        let sim = sim();
        let registry = registry(&sim).await;
        assert!(matches!(
            registry.get(RoleType::Osd, "7"),
            Err(Error::NotFound { .. })
        ));

        let everything = registry
            .resolve(Some(&["all".to_string()]), &RoleType::DAEMONS)
            .unwrap();
        assert_eq!(everything.len(), 3);
        assert_eq!(everything, registry.resolve(None, &RoleType::DAEMONS).unwrap());
        assert_eq!(
            registry
                .resolve(Some(&["osd.*".to_string()]), &[RoleType::Osd])
                .unwrap(),
            vec![Role::osd(0), Role::osd(1)]
        );
        for bad in ["client.0", "osd0"] {
            let err = registry
                .resolve(Some(&[bad.to_string()]), &RoleType::DAEMONS)
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad}: {err}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_an_unclean_exit_counts_as_failure() {
        let sim = sim();
        sim.fail_command("ceph-osd -f -i 1", 1);
        let mut registry = registry(&sim).await;
        registry.start_type(RoleType::Mon).await.unwrap();
        registry.start_type(RoleType::Osd).await.unwrap();

        registry.wait_for_failure(&[Role::osd(1)], None).await.unwrap();

        let mon = Role::new(RoleType::Mon, "a");
        let err = registry
            .wait_for_failure(&[mon], Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Assertion(_)), "{err}");

        registry.stop_roles(&[Role::osd(0)]).await.unwrap();
        let err = registry
            .wait_for_failure(&[Role::osd(0)], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited cleanly"), "{err}");
    }
}
