// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The administrative command surface of a live cluster.
//!
//! [`ClusterManager`] only issues commands and parses what comes back. It never owns daemon
//! handles: the primitives that start or kill a daemon borrow the [`DaemonRegistry`] from the
//! caller for the duration of the call.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use log::{debug, info};

use crate::{
    config::Timeouts,
    daemon::DaemonRegistry,
    error::{Error, Result},
    poll::{PollPolicy, Check},
    remote::{CommandOutput, RemoteExecutor, RemoteProcess, RunOptions},
    role::{Role, RoleType},
};

pub mod status;

use status::{
    parse_json, FsListEntry, HealthState, HealthStatus, MdsInfo, MdsMap, OsdDump, OsdStatus,
    PgDump, PgMapping, PgStat, PoolListEntry, QuorumStatus,
};

const CLEAN_POLL: Duration = Duration::from_secs(3);
const QUORUM_POLL: Duration = Duration::from_secs(1);
const OSDS_UP_POLL: Duration = Duration::from_secs(10);
const ADMIN_SOCKET_POLL: Duration = Duration::from_secs(5);
const LOG_TAIL_LINES: usize = 20;

pub const CLUSTER_LOG: &str = "/var/log/ceph/ceph.log";

#[derive(Debug, Clone)]
pub struct ClusterManager {
    executor: Arc<dyn RemoteExecutor>,
    /// Host of the first monitor; cluster-wide commands run here.
    admin_host: String,
    role_hosts: Arc<BTreeMap<Role, String>>,
    coverage_dir: String,
    timeouts: Timeouts,
}

impl ClusterManager {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        admin_host: &str,
        role_hosts: BTreeMap<Role, String>,
        coverage_dir: &str,
        timeouts: Timeouts,
    ) -> Self {
        ClusterManager {
            executor,
            admin_host: admin_host.to_string(),
            role_hosts: Arc::new(role_hosts),
            coverage_dir: coverage_dir.to_string(),
            timeouts,
        }
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    pub fn admin_host(&self) -> &str {
        &self.admin_host
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// The host a role was assigned to.
    pub fn find_remote(&self, role: &Role) -> Result<&str> {
        self.role_hosts
            .get(role)
            .map(String::as_str)
            .ok_or_else(|| Error::not_found("role", role.to_string()))
    }

    /// Every host carrying at least one role, sorted and deduplicated.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.role_hosts.values().cloned().collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Ids of every configured role of a type, sorted.
    pub fn ids_of_type(&self, kind: RoleType) -> Vec<String> {
        let mut ids: Vec<String> = self
            .role_hosts
            .keys()
            .filter(|r| r.kind == kind)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Prefix a command with the coverage wrappers every cluster tool runs under.
    pub fn wrapped<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Vec<String> {
        let mut full = vec![
            "sudo".to_string(),
            "adjust-ulimits".to_string(),
            "ceph-coverage".to_string(),
            self.coverage_dir.clone(),
            program.to_string(),
        ];
        full.extend(args.iter().map(|a| a.as_ref().to_string()));
        full
    }

    /// Run a `ceph` command on the admin host without checking its exit status.
    pub async fn raw_command_output<S: AsRef<str>>(&self, args: &[S]) -> Result<CommandOutput> {
        self.executor
            .run(&self.admin_host, RunOptions::new(self.wrapped("ceph", args)).unchecked())
            .await
    }

    /// Run a `ceph` command on the admin host and return its stdout. A non-zero exit is an error.
    pub async fn raw_command<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let out = self
            .executor
            .run(&self.admin_host, RunOptions::new(self.wrapped("ceph", args)))
            .await?;
        Ok(out.stdout)
    }

    /// Run a `ceph` command and return only its exit status, tolerating failure.
    pub async fn raw_command_result<S: AsRef<str>>(&self, args: &[S]) -> Result<i32> {
        Ok(self.raw_command_output(args).await?.exit_status)
    }

    pub async fn get_health_status(&self) -> Result<(HealthStatus, String)> {
        let line = self.raw_command(&["health"]).await?;
        let status: HealthStatus = line.parse()?;
        let detail = line
            .trim()
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default();
        Ok((status, detail))
    }

    pub async fn get_health(&self) -> Result<HealthState> {
        let (status, detail) = self.get_health_status().await?;
        let pgs = self
            .get_pg_stats()
            .await?
            .into_iter()
            .map(|pg| (pg.pgid, pg.state))
            .collect();
        let tail = self
            .executor
            .run(
                &self.admin_host,
                RunOptions::new(["tail", "-n", &LOG_TAIL_LINES.to_string(), CLUSTER_LOG])
                    .sudo()
                    .unchecked(),
            )
            .await?;
        Ok(HealthState {
            status,
            detail,
            pgs,
            log_tail: tail.stdout.lines().map(str::to_string).collect(),
        })
    }

    /// Poll until the cluster reports `HEALTH_OK`.
    pub async fn wait_until_healthy(&self, timeout: Option<Duration>) -> Result<Duration> {
        info!("waiting until ceph is healthy...");
        let policy = PollPolicy::new(
            self.timeouts.poll_interval(),
            timeout.unwrap_or(self.timeouts.healthy()),
        );
        let (_, elapsed) = policy
            .run("cluster health", || async {
                let health = self.get_health().await?;
                Ok(match health.status {
                    HealthStatus::Ok => Check::Done(()),
                    status => {
                        let clean = health.pgs.iter().filter(|(_, s)| s == PgStat::CLEAN).count();
                        Check::Pending(format!(
                            "{status} {}; {clean}/{} pgs {}",
                            health.detail,
                            health.pgs.len(),
                            PgStat::CLEAN
                        ))
                    }
                })
            })
            .await?;
        Ok(elapsed)
    }

    pub async fn get_pg_stats(&self) -> Result<Vec<PgStat>> {
        let out = self.raw_command(&["pg", "dump", "--format=json"]).await?;
        Ok(parse_json::<PgDump>("pg dump", &out)?.pg_stats)
    }

    /// Poll until every placement group is `active+clean`.
    pub async fn wait_for_clean(&self, timeout: Option<Duration>) -> Result<Duration> {
        info!("waiting for clean");
        let policy = PollPolicy::new(CLEAN_POLL, timeout.unwrap_or(self.timeouts.clean()));
        let (_, elapsed) = policy
            .run("all pgs active+clean", || async {
                let stats = self.get_pg_stats().await?;
                let clean = stats.iter().filter(|pg| pg.is_clean()).count();
                Ok(if clean == stats.len() {
                    Check::Done(())
                } else {
                    Check::Pending(format!("{clean}/{} pgs clean", stats.len()))
                })
            })
            .await?;
        info!("clean!");
        Ok(elapsed)
    }

    /// Poll until every placement group is active and no longer recovering or backfilling.
    pub async fn wait_for_recovery(&self, timeout: Option<Duration>) -> Result<Duration> {
        info!("waiting for recovery to complete");
        let policy = PollPolicy::new(CLEAN_POLL, timeout.unwrap_or(self.timeouts.clean()));
        let (_, elapsed) = policy
            .run("pg recovery", || async {
                let stats = self.get_pg_stats().await?;
                let pending: Vec<String> = stats
                    .iter()
                    .filter(|pg| !pg.is_recovered())
                    .map(|pg| format!("{} {}", pg.pgid, pg.state))
                    .collect();
                Ok(if pending.is_empty() {
                    Check::Done(())
                } else {
                    Check::Pending(pending)
                })
            })
            .await?;
        info!("recovered!");
        Ok(elapsed)
    }

    pub async fn get_osd_dump(&self) -> Result<OsdDump> {
        let out = self.raw_command(&["osd", "dump", "--format=json"]).await?;
        parse_json("osd dump", &out)
    }

    pub async fn get_osd_status(&self) -> Result<OsdStatus> {
        Ok(OsdStatus::from(&self.get_osd_dump().await?))
    }

    /// Poll until at least `count` OSDs are up.
    pub async fn wait_until_osds_up(&self, count: usize, timeout: Option<Duration>) -> Result<Duration> {
        info!("waiting until {count} osds are up...");
        let policy = PollPolicy::new(OSDS_UP_POLL, timeout.unwrap_or(self.timeouts.osds_up()));
        let (_, elapsed) = policy
            .run("osds up", || async {
                let up = self.get_osd_status().await?.up;
                Ok(if up.len() >= count {
                    Check::Done(())
                } else {
                    Check::Pending(up)
                })
            })
            .await?;
        Ok(elapsed)
    }

    pub async fn quorum_names(&self) -> Result<Vec<String>> {
        let out = self.raw_command(&["quorum_status"]).await?;
        Ok(parse_json::<QuorumStatus>("quorum_status", &out)?.quorum_names)
    }

    /// Poll until the monitor quorum is exactly `mons`.
    pub async fn wait_for_quorum(&self, mons: &[String], timeout: Option<Duration>) -> Result<Duration> {
        let mut want = mons.to_vec();
        want.sort();
        let policy = PollPolicy::new(QUORUM_POLL, timeout.unwrap_or(self.timeouts.quorum()));
        let (_, elapsed) = policy
            .run("monitor quorum", || async {
                let mut quorum = self.quorum_names().await?;
                quorum.sort();
                debug!("quorum: {quorum:?}");
                Ok(if quorum == want {
                    Check::Done(())
                } else {
                    Check::Pending(quorum)
                })
            })
            .await?;
        Ok(elapsed)
    }

    /// Inject a runtime config override into a running OSD.
    ///
    /// This is a fault-injection primitive: it is how scenarios black-hole I/O or stall
    /// recovery. Overrides do not survive a daemon restart.
    pub async fn set_config(&self, osd: u32, key: &str, value: &str) -> Result<()> {
        info!("osd.{osd}: injecting {key}={value:?}");
        self.raw_command(&[
            "tell",
            &format!("osd.{osd}"),
            "injectargs",
            &format!("--{key}"),
            value,
        ])
        .await?;
        Ok(())
    }

    pub async fn flush_pg_stats(&self, osds: &[u32]) -> Result<()> {
        for osd in osds {
            self.raw_command(&["tell", &format!("osd.{osd}"), "flush_pg_stats"])
                .await?;
        }
        Ok(())
    }

    pub async fn set_osd_flag(&self, flag: &str) -> Result<()> {
        self.raw_command(&["osd", "set", flag]).await?;
        Ok(())
    }

    pub async fn unset_osd_flag(&self, flag: &str) -> Result<()> {
        self.raw_command(&["osd", "unset", flag]).await?;
        Ok(())
    }

    /// Hard-kill an OSD process, bypassing graceful shutdown.
    pub async fn kill_osd(&self, registry: &mut DaemonRegistry, osd: u32) -> Result<()> {
        info!("killing osd.{osd}");
        registry.get_mut(RoleType::Osd, &osd.to_string())?.kill().await
    }

    /// Start a stopped or killed OSD again and wait for its admin socket to answer.
    pub async fn revive_osd(
        &self,
        registry: &mut DaemonRegistry,
        osd: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        info!("reviving osd.{osd}");
        registry.get_mut(RoleType::Osd, &osd.to_string())?.start().await?;

        let role = Role::osd(osd);
        let policy = PollPolicy::new(ADMIN_SOCKET_POLL, timeout.unwrap_or(self.timeouts.osds_up()));
        policy
            .until(&format!("{role} admin socket"), || async {
                Ok(self.admin_socket_output(&role, &["version"]).await?.success())
            })
            .await?;
        Ok(())
    }

    pub async fn mark_down_osd(&self, osd: u32) -> Result<()> {
        self.raw_command(&["osd", "down", &osd.to_string()]).await?;
        Ok(())
    }

    pub async fn mark_out_osd(&self, osd: u32) -> Result<()> {
        self.raw_command(&["osd", "out", &osd.to_string()]).await?;
        Ok(())
    }

    pub async fn mark_in_osd(&self, osd: u32) -> Result<()> {
        self.raw_command(&["osd", "in", &osd.to_string()]).await?;
        Ok(())
    }

    pub async fn create_pool(&self, name: &str, pg_num: u32) -> Result<()> {
        info!("creating pool {name} with {pg_num} pgs");
        self.raw_command(&["osd", "pool", "create", name, &pg_num.to_string()])
            .await?;
        Ok(())
    }

    pub async fn remove_pool(&self, name: &str) -> Result<()> {
        info!("removing pool {name}");
        self.raw_command(&[
            "osd",
            "pool",
            "delete",
            name,
            name,
            "--yes-i-really-really-mean-it",
        ])
        .await?;
        Ok(())
    }

    pub async fn list_pools(&self) -> Result<Vec<PoolListEntry>> {
        let out = self
            .raw_command(&["--format=json-pretty", "osd", "lspools"])
            .await?;
        parse_json("osd lspools", &out)
    }

    /// Read one property of a pool, e.g. `pg_num`.
    pub async fn get_pool_property(&self, pool: &str, property: &str) -> Result<String> {
        let out = self
            .raw_command(&["osd", "pool", "get", pool, property])
            .await?;
        match out.trim().split_once(':') {
            Some((key, value)) if key.trim() == property => Ok(value.trim().to_string()),
            _ => Err(Error::UnexpectedOutput {
                what: format!("osd pool get {pool} {property}"),
                output: out,
            }),
        }
    }

    pub async fn get_pool_num(&self, pool: &str) -> Result<u32> {
        self.get_osd_dump()
            .await?
            .pools
            .into_iter()
            .find(|p| p.pool_name == pool)
            .map(|p| p.pool)
            .ok_or_else(|| Error::not_found("pool", pool))
    }

    /// The OSD acting as primary for one placement group of a pool.
    pub async fn get_pg_primary(&self, pool: &str, pg_num: u32) -> Result<Role> {
        let pool_num = self.get_pool_num(pool).await?;
        let pgid = format!("{pool_num}.{pg_num:x}");
        let out = self
            .raw_command(&["pg", "map", &pgid, "--format=json"])
            .await?;
        Ok(Role::osd(parse_json::<PgMapping>("pg map", &out)?.acting_primary))
    }

    pub async fn deep_scrub_osd(&self, osd: &Role) -> Result<()> {
        info!("scrubbing {osd}");
        self.raw_command(&["osd", "deep-scrub", &osd.to_string()])
            .await?;
        Ok(())
    }

    pub async fn set_crush_tunables(&self, profile: &str) -> Result<()> {
        info!("setting crush tunables to {profile}");
        self.raw_command(&["osd", "crush", "tunables", profile])
            .await?;
        Ok(())
    }

    pub async fn get_mds_status_all(&self) -> Result<MdsMap> {
        let out = self
            .raw_command(&["mds", "dump", "--format=json-pretty"])
            .await?;
        parse_json("mds dump", &out)
    }

    /// A single daemon's entry in the MDS map, or `None` if it has no entry.
    pub async fn get_mds_status(&self, name: &str) -> Result<Option<MdsInfo>> {
        Ok(self.get_mds_status_all().await?.by_name(name).cloned())
    }

    pub async fn set_max_mds(&self, count: u32) -> Result<()> {
        self.raw_command(&["mds", "set", "max_mds", &count.to_string()])
            .await?;
        Ok(())
    }

    /// Tell the monitors an MDS is gone so its rank is given up at once.
    pub async fn mds_fail(&self, name: &str) -> Result<()> {
        self.raw_command(&["mds", "fail", name]).await?;
        Ok(())
    }

    pub async fn fs_ls(&self) -> Result<Vec<FsListEntry>> {
        let out = self
            .raw_command(&["fs", "ls", "--format=json-pretty"])
            .await?;
        parse_json("fs ls", &out)
    }

    fn asok_args<S: AsRef<str>>(&self, role: &Role, args: &[S]) -> Vec<String> {
        let mut full = vec![
            "--admin-daemon".to_string(),
            format!("/var/run/ceph/ceph-{role}.asok"),
        ];
        full.extend(args.iter().map(|a| a.as_ref().to_string()));
        self.wrapped("ceph", &full)
    }

    async fn admin_socket_output<S: AsRef<str>>(&self, role: &Role, args: &[S]) -> Result<CommandOutput> {
        let host = self.find_remote(role)?;
        self.executor
            .run(host, RunOptions::new(self.asok_args(role, args)).unchecked())
            .await
    }

    /// Run a command against a daemon's admin socket on the daemon's own host.
    pub async fn admin_socket<S: AsRef<str>>(&self, role: &Role, args: &[S]) -> Result<String> {
        let host = self.find_remote(role)?;
        let out = self
            .executor
            .run(host, RunOptions::new(self.asok_args(role, args)))
            .await?;
        Ok(out.stdout)
    }

    /// Admin socket command with JSON output. Empty output is `None`.
    pub async fn json_asok<S: AsRef<str>>(&self, role: &Role, args: &[S]) -> Result<Option<serde_json::Value>> {
        let out = self.admin_socket(role, args).await?;
        debug!("{role} asok output: {out}");
        if out.trim().is_empty() {
            return Ok(None);
        }
        parse_json(&format!("{role} admin socket"), &out).map(Some)
    }

    /// Run `rados` on the admin host and return its exit status.
    pub async fn rados<S: AsRef<str>>(&self, args: &[S]) -> Result<i32> {
        info!(
            "rados {}",
            args.iter().map(|a| a.as_ref()).collect::<Vec<_>>().join(" ")
        );
        let mut full = self.wrapped("rados", args);
        full.remove(0);
        let out = self
            .executor
            .run(&self.admin_host, RunOptions::new(full).unchecked())
            .await?;
        Ok(out.exit_status)
    }

    /// Start `rados` on the admin host without waiting for it.
    pub async fn rados_background<S: AsRef<str>>(&self, args: &[S]) -> Result<Box<dyn RemoteProcess>> {
        let mut full = self.wrapped("rados", args);
        full.remove(0);
        self.executor.spawn(&self.admin_host, full).await
    }

    /// `killall -9` a program on the admin host.
    pub async fn killall(&self, program: &str) -> Result<()> {
        self.executor
            .run(
                &self.admin_host,
                RunOptions::new(["killall", "-9", program]).unchecked(),
            )
            .await?;
        Ok(())
    }
}
