// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Fault-injection scenarios run against a live cluster.
//!
//! Every scenario follows the same shape: inject a fault, poll for the transient state the fault
//! should cause, then trigger or await recovery and check the terminal state within a bound.
//! Faults are recorded in a [`FaultLedger`] as they are injected, and the runner clears whatever
//! is left in the ledger after the scenario body whether it passed or not, so a failed scenario
//! does not poison the next one.

use std::{fmt, str::FromStr, time::Duration};

use log::{debug, info, warn};

use crate::{
    config::{Config, RecoveryTolerance},
    error::{Error, Result},
    fs::{mount::ClientMount, FilesystemDriver},
    lifecycle::LiveCluster,
    poll::PollPolicy,
    role::{Role, RoleType},
};

pub mod client_recovery;
pub mod divergent;

/// How long to wait for the `is_full` flag to clear, per `osd_mon_report_interval_max`.
const FULL_CLEAR_FACTOR: u32 = 5;
const FULL_POLL: Duration = Duration::from_secs(5);

/// A fault that a scenario has injected and not yet healed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Firewall rules rejecting client traffic to an MDS, or to every MDS when `mds_id` is None.
    ClientsBlocked { mds_id: Option<String> },
    /// An OSD option changed with injectargs. `restore` is the value put back on cleanup.
    ConfigOverride {
        osd: u32,
        key: String,
        restore: String,
    },
    /// A client whose fuse process was killed without unmounting.
    MountKilled { client_id: String },
    /// A daemon killed with the hard signal.
    DaemonKilled { role: Role },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::ClientsBlocked { mds_id: Some(id) } => write!(f, "clients blocked from mds.{id}"),
            Fault::ClientsBlocked { mds_id: None } => write!(f, "clients blocked from all mds"),
            Fault::ConfigOverride { osd, key, .. } => write!(f, "osd.{osd} {key} overridden"),
            Fault::MountKilled { client_id } => write!(f, "client.{client_id} killed"),
            Fault::DaemonKilled { role } => write!(f, "{role} killed"),
        }
    }
}

/// The faults currently in effect, in the order they were injected.
#[derive(Debug, Default)]
pub struct FaultLedger {
    faults: Vec<Fault>,
}

impl FaultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, fault: Fault) {
        debug!("fault injected: {fault}");
        self.faults.push(fault);
    }

    /// Drop a fault that the scenario healed itself.
    pub fn heal(&mut self, fault: &Fault) {
        if let Some(pos) = self.faults.iter().rposition(|f| f == fault) {
            debug!("fault healed: {fault}");
            self.faults.remove(pos);
        }
    }

    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// Undo every recorded fault, newest first. Cleanup continues past a failing step; the
    /// failures are returned and the ledger is left empty.
    pub async fn clear(&mut self, cluster: &mut LiveCluster, mounts: &mut [ClientMount]) -> Vec<Error> {
        let mut errors = Vec::new();
        let fs = cluster.filesystem();

        while let Some(fault) = self.faults.pop() {
            info!("clearing fault: {fault}");
            let res = match &fault {
                Fault::ClientsBlocked { mds_id } => fs.set_clients_block(false, mds_id.as_deref()).await,
                Fault::ConfigOverride { osd, key, restore } => {
                    cluster.manager.set_config(*osd, key, restore).await
                }
                Fault::MountKilled { client_id } => match mounts
                    .iter_mut()
                    .find(|m| m.client_id() == client_id)
                {
                    Some(mount) => mount.kill_cleanup().await,
                    None => Err(Error::not_found("mount", client_id.clone())),
                },
                Fault::DaemonKilled { role } => match cluster.registry.get_role_mut(role) {
                    Ok(daemon) if !daemon.running() => daemon.start().await,
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = res {
                warn!("failed to clear fault '{fault}': {e}");
                errors.push(e);
            }
        }
        errors
    }
}

/// MDS timeouts read from the running daemon, against which recovery is measured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FsTimeouts {
    pub session_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub ms_max_backoff: Duration,
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| Error::UnexpectedOutput {
            what: format!("config get {key}"),
            output: value.to_string(),
        })
}

/// A freshly created filesystem with a set of mounted clients, the starting point for the
/// client recovery scenarios.
pub struct FsFixture<'a> {
    pub cluster: &'a mut LiveCluster,
    pub fs: FilesystemDriver,
    pub mounts: Vec<ClientMount>,
    pub ledger: FaultLedger,
    pub timeouts: FsTimeouts,
    pub tolerance: RecoveryTolerance,
}

impl<'a> FsFixture<'a> {
    /// Rebuild the filesystem and mount `clients` clients.
    ///
    /// Fails with a configuration error when the cluster does not have the roles needed.
    pub async fn set_up(cluster: &'a mut LiveCluster, clients: usize) -> Result<FsFixture<'a>> {
        let fs = cluster.filesystem();
        let client_ids = cluster.cluster().ids_of_type(RoleType::Client);
        if client_ids.len() < clients {
            return Err(Error::config(format!(
                "needs {clients} client roles, cluster has {}",
                client_ids.len()
            )));
        }
        if fs.mds_ids().is_empty() {
            return Err(Error::config("needs at least one mds role"));
        }

        let mut mounts = client_ids
            .iter()
            .take(clients)
            .map(|id| cluster.client_mount(id))
            .collect::<Result<Vec<_>>>()?;

        fs.clear_firewall().await?;

        for mount in mounts.iter_mut() {
            if mount.is_mounted().await? {
                mount.umount_wait(false).await?;
            }
        }

        fs.mds_stop(&mut cluster.registry, None).await?;
        fs.mds_fail(None).await?;
        fs.delete().await?;
        fs.create().await?;

        // Deleting pools can leave the full flag set until the osds report in again.
        let report_interval = parse_secs(
            "osd_mon_report_interval_max",
            &fs.get_config("osd_mon_report_interval_max", RoleType::Osd).await?,
        )?;
        PollPolicy::new(FULL_POLL, report_interval * FULL_CLEAR_FACTOR)
            .until("osd map full flag to clear", || async { Ok(!fs.is_full().await?) })
            .await?;

        fs.mds_restart(&mut cluster.registry, None).await?;
        fs.wait_for_daemons(None).await?;

        for mount in mounts.iter_mut() {
            mount.mount().await?;
            mount.wait_until_mounted().await?;
        }

        let timeouts = FsTimeouts {
            session_timeout: Self::mds_setting(&fs, "mds_session_timeout").await?,
            reconnect_timeout: Self::mds_setting(&fs, "mds_reconnect_timeout").await?,
            ms_max_backoff: Self::mds_setting(&fs, "ms_max_backoff").await?,
        };
        debug!("filesystem timeouts: {timeouts:?}");

        let tolerance = cluster.config().recovery;
        Ok(FsFixture {
            cluster,
            fs,
            mounts,
            ledger: FaultLedger::new(),
            timeouts,
            tolerance,
        })
    }

    async fn mds_setting(fs: &FilesystemDriver, key: &str) -> Result<Duration> {
        parse_secs(key, &fs.get_config(key, RoleType::Mds).await?)
    }

    /// Clear leftover faults, unblock all clients and tear every mount down.
    pub async fn tear_down(mut self) -> Vec<Error> {
        let mut errors = self
            .ledger
            .clear(self.cluster, &mut self.mounts)
            .await;
        if let Err(e) = self.fs.clear_firewall().await {
            warn!("failed to clear firewall: {e}");
            errors.push(e);
        }
        for mount in self.mounts.iter_mut() {
            if let Err(e) = mount.teardown().await {
                warn!("failed to tear down client.{}: {e}", mount.client_id());
                errors.push(e);
            }
        }
        errors
    }

    pub fn mount(&mut self, index: usize) -> Result<&mut ClientMount> {
        self.mounts
            .get_mut(index)
            .ok_or_else(|| Error::not_found("mount", index.to_string()))
    }
}

/// The scenarios the runner knows by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    Basic,
    Restart,
    ReconnectTimeout,
    ReconnectEviction,
    StaleCaps,
    EvictedCaps,
    NetworkDeath,
    DivergentPriors,
}

impl Scenario {
    pub const ALL: [Scenario; 8] = [
        Scenario::Basic,
        Scenario::Restart,
        Scenario::ReconnectTimeout,
        Scenario::ReconnectEviction,
        Scenario::StaleCaps,
        Scenario::EvictedCaps,
        Scenario::NetworkDeath,
        Scenario::DivergentPriors,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Basic => "basic",
            Scenario::Restart => "restart",
            Scenario::ReconnectTimeout => "reconnect_timeout",
            Scenario::ReconnectEviction => "reconnect_eviction",
            Scenario::StaleCaps => "stale_caps",
            Scenario::EvictedCaps => "evicted_caps",
            Scenario::NetworkDeath => "network_death",
            Scenario::DivergentPriors => "divergent_priors",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::Basic => "sessions exist for mounted clients and data survives a remount",
            Scenario::Restart => "clients keep working after the MDS is failed and restarted",
            Scenario::ReconnectTimeout => {
                "a dead client holds the MDS in reconnect until the reconnect timeout"
            }
            Scenario::ReconnectEviction => "evicting a dead client cuts the reconnect phase short",
            Scenario::StaleCaps => "caps held by a dead client are released after the session timeout",
            Scenario::EvictedCaps => "caps held by a dead client are released when it is evicted",
            Scenario::NetworkDeath => "a client cut off from the MDS goes stale and then recovers",
            Scenario::DivergentPriors => {
                "a divergent log entry on a revived primary is rolled back"
            }
        }
    }

    /// Roles the scenario needs beyond a working cluster.
    pub fn requirements(&self) -> &'static [(RoleType, Need)] {
        match self {
            Scenario::DivergentPriors => &[(RoleType::Osd, Need::Exactly(divergent::OSDS))],
            _ => &[
                (RoleType::Mds, Need::AtLeast(1)),
                (RoleType::Client, Need::AtLeast(client_recovery::CLIENTS_REQUIRED)),
            ],
        }
    }

    /// Requirements the config does not meet.
    pub fn unmet_requirements(&self, config: &Config) -> Vec<(RoleType, Need)> {
        self.requirements()
            .iter()
            .filter(|(kind, need)| !need.met_by(config.roles_of_type(*kind).count()))
            .copied()
            .collect()
    }

    /// Run the scenario, clearing any fault it leaves behind.
    pub async fn run(self, cluster: &mut LiveCluster) -> Result<()> {
        info!("running scenario {}", self.name());
        match self {
            Scenario::DivergentPriors => divergent::run(cluster).await,
            _ => client_recovery::run(self, cluster).await,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| Error::not_found("scenario", s))
    }
}

/// Combine the result of a scenario body with the errors from cleaning up after it. The body's
/// own error wins, since cleanup failures are usually a consequence of it.
pub(crate) fn with_cleanup(result: Result<()>, mut cleanup: Vec<Error>) -> Result<()> {
    match result {
        Err(e) => {
            for err in cleanup {
                warn!("cleanup after failed scenario: {err}");
            }
            Err(e)
        }
        Ok(()) if cleanup.is_empty() => Ok(()),
        Ok(()) => Err(cleanup.remove(0)),
    }
}

/// How many roles of one type a scenario needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    AtLeast(usize),
    Exactly(usize),
}

impl Need {
    pub fn met_by(&self, count: usize) -> bool {
        match *self {
            Need::AtLeast(n) => count >= n,
            Need::Exactly(n) => count == n,
        }
    }
}

impl fmt::Display for Need {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Need::AtLeast(n) => write!(f, "at least {n}"),
            Need::Exactly(n) => write!(f, "exactly {n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>().unwrap(), scenario);
        }
        assert!(matches!(
            "no_such_scenario".parse::<Scenario>(),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn requirements_against_config() {
        let config = crate::test_env::test_config(&[
            ("node0", &["mon.a", "osd.0", "osd.1", "mds.a"]),
            ("node1", &["client.0"]),
        ])
        .unwrap();
        assert_eq!(
            Scenario::StaleCaps.unmet_requirements(&config),
            vec![(RoleType::Client, Need::AtLeast(2))]
        );
        assert_eq!(
            Scenario::DivergentPriors.unmet_requirements(&config),
            vec![(RoleType::Osd, Need::Exactly(3))]
        );

        let four_osds = crate::test_env::test_config(&[
            ("node0", &["mon.a", "osd.0", "osd.1"]),
            ("node1", &["osd.2", "osd.3"]),
        ])
        .unwrap();
        assert_eq!(
            Scenario::DivergentPriors.unmet_requirements(&four_osds),
            vec![(RoleType::Osd, Need::Exactly(3))]
        );
        assert_eq!(Need::Exactly(3).to_string(), "exactly 3");
    }

    #[test]
    fn ledger_heals_most_recent_match() {
        let mut ledger = FaultLedger::new();
        let blocked = Fault::ClientsBlocked { mds_id: None };
        ledger.record(blocked.clone());
        ledger.record(Fault::MountKilled {
            client_id: "0".to_string(),
        });
        ledger.record(blocked.clone());

        ledger.heal(&blocked);
        assert_eq!(ledger.faults().len(), 2);
        assert_eq!(ledger.faults()[1], Fault::MountKilled { client_id: "0".to_string() });

        ledger.heal(&Fault::DaemonKilled { role: Role::osd(3) });
        assert_eq!(ledger.faults().len(), 2);
    }

    #[test]
    fn cleanup_errors_do_not_mask_body_error() {
        let res = with_cleanup(
            Err(Error::assertion("body")),
            vec![Error::config("cleanup")],
        );
        assert!(matches!(res, Err(Error::Assertion(_))));

        let res = with_cleanup(Ok(()), vec![Error::config("cleanup")]);
        assert!(matches!(res, Err(Error::Config(_))));

        assert!(with_cleanup(Ok(()), Vec::new()).is_ok());
    }

    #[test]
    fn settings_parse_as_seconds() {
        assert_eq!(parse_secs("k", "60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_secs("k", "0.5\n").unwrap(), Duration::from_millis(500));
        assert!(parse_secs("k", "soon").is_err());
        assert!(parse_secs("k", "-1").is_err());
    }
}
