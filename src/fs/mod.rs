// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The CephFS layer: filesystem pools, MDS rank states, client sessions and the network faults
//! used against them.

use std::{fmt, time::Duration};

use {
    futures::future,
    log::{debug, info, warn},
    serde::Deserialize,
};

use crate::{
    daemon::{DaemonRegistry, STOP_TIMEOUT},
    ensure,
    error::{Error, Result},
    manager::{
        status::{parse_json, FsListEntry, MdsMap, MdsState, PoolListEntry},
        ClusterManager,
    },
    poll::{PollPolicy, Check},
    remote::{run_on_all, RunOptions},
    role::{Role, RoleType},
};

pub mod mount;

pub const FS_NAME: &str = "default";
const METADATA_POOL: &str = "metadata";
const DATA_POOL: &str = "data";

/// Every firewall rule installed by [`FilesystemDriver::set_clients_block`] carries this comment
/// so that [`FilesystemDriver::clear_firewall`] can find them again.
const FIREWALL_COMMENT: &str = "cephqa";

const STATE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opening,
    Open,
    Closing,
    Stale,
    Killing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SessionState::Opening => "opening",
                SessionState::Open => "open",
                SessionState::Closing => "closing",
                SessionState::Stale => "stale",
                SessionState::Killing => "killing",
                SessionState::Closed => "closed",
            }
        )
    }
}

/// One entry of the MDS `session ls` admin socket command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Session {
    pub id: u64,
    pub state: SessionState,
    #[serde(default)]
    pub num_caps: u64,
    #[serde(default)]
    pub reconnecting: bool,
}

impl Session {
    /// Stale and closed sessions are on their way out and do not count as live clients.
    pub fn is_live(&self) -> bool {
        !matches!(self.state, SessionState::Stale | SessionState::Closed)
    }
}

/// Drives the filesystem and its MDS daemons.
///
/// Operations that take an optional MDS id act on that daemon only, or on every MDS
/// concurrently when no id is given.
#[derive(Debug, Clone)]
pub struct FilesystemDriver {
    manager: ClusterManager,
    mds_ids: Vec<String>,
    osd_count: usize,
}

impl FilesystemDriver {
    pub fn new(manager: ClusterManager, mut mds_ids: Vec<String>, osd_count: usize) -> Self {
        mds_ids.sort();
        FilesystemDriver {
            manager,
            mds_ids,
            osd_count,
        }
    }

    pub fn manager(&self) -> &ClusterManager {
        &self.manager
    }

    pub fn mds_ids(&self) -> &[String] {
        &self.mds_ids
    }

    fn targets(&self, mds_id: Option<&str>) -> Vec<String> {
        match mds_id {
            Some(id) => vec![id.to_string()],
            None => self.mds_ids.clone(),
        }
    }

    fn target_roles(&self, mds_id: Option<&str>) -> Vec<Role> {
        self.targets(mds_id).iter().map(|id| Role::mds(id)).collect()
    }

    /// True if a filesystem from the older pool naming convention is already there, or the
    /// CLI is too old to tell.
    pub async fn legacy_configured(&self) -> Result<bool> {
        let out = self
            .manager
            .raw_command_output(&["--format=json-pretty", "osd", "lspools"])
            .await?;
        match out.exit_status {
            0 => {
                let pools: Vec<PoolListEntry> = parse_json("osd lspools", &out.stdout)?;
                Ok(pools.iter().any(|p| p.poolname == METADATA_POOL))
            }
            // Old CLIs reject --format with EINVAL.
            22 => Ok(true),
            code => Err(Error::RemoteCommand {
                host: self.manager.admin_host().to_string(),
                args: vec!["ceph".to_string(), "osd".to_string(), "lspools".to_string()],
                exit_status: code,
            }),
        }
    }

    /// Create the metadata and data pools and the filesystem over them. Does nothing when a
    /// filesystem is already configured. Returns whether anything was created.
    pub async fn create(&self) -> Result<bool> {
        if self.legacy_configured().await? {
            info!("filesystem pools already exist, not creating them");
            return Ok(false);
        }

        let per_osd: u32 = self
            .get_config("mon_pg_warn_min_per_osd", RoleType::Mon)
            .await?
            .parse()
            .map_err(|_| Error::UnexpectedOutput {
                what: "mon_pg_warn_min_per_osd".to_string(),
                output: "not a number".to_string(),
            })?;
        let pgs = per_osd * self.osd_count as u32;

        self.manager.create_pool(METADATA_POOL, pgs).await?;
        self.manager.create_pool(DATA_POOL, pgs).await?;
        self.manager
            .raw_command(&["fs", "new", FS_NAME, METADATA_POOL, DATA_POOL])
            .await?;
        Ok(true)
    }

    pub async fn delete(&self) -> Result<()> {
        self.manager
            .raw_command(&["fs", "rm", FS_NAME, "--yes-i-really-mean-it"])
            .await?;
        self.manager.remove_pool(METADATA_POOL).await?;
        self.manager.remove_pool(DATA_POOL).await
    }

    /// Recreate the filesystem over the existing pools. Every MDS must be stopped.
    pub async fn reset(&self, registry: &DaemonRegistry) -> Result<()> {
        info!("creating new filesystem");
        self.manager
            .raw_command_result(&["mds", "set", "max_mds", "0"])
            .await?;
        for id in self.mds_ids.iter() {
            ensure!(
                !registry.get(RoleType::Mds, id)?.running(),
                "mds.{id} must be stopped before the filesystem is reset"
            );
            self.manager.raw_command_result(&["mds", "fail", id]).await?;
        }
        self.manager
            .raw_command_result(&["fs", "rm", FS_NAME, "--yes-i-really-mean-it"])
            .await?;
        self.manager
            .raw_command_result(&["fs", "new", FS_NAME, METADATA_POOL, DATA_POOL])
            .await?;
        Ok(())
    }

    pub async fn get_data_pool_names(&self) -> Result<Vec<String>> {
        Ok(self.fs_entry().await?.data_pools)
    }

    /// The data pool name, for filesystems that have exactly one.
    pub async fn get_data_pool_name(&self) -> Result<String> {
        let mut pools = self.get_data_pool_names().await?;
        ensure!(
            pools.len() == 1,
            "expected exactly one data pool, found {pools:?}"
        );
        Ok(pools.remove(0))
    }

    pub async fn get_metadata_pool_name(&self) -> Result<String> {
        Ok(self.fs_entry().await?.metadata_pool)
    }

    async fn fs_entry(&self) -> Result<FsListEntry> {
        self.manager
            .fs_ls()
            .await?
            .into_iter()
            .find(|fs| fs.name == FS_NAME)
            .ok_or_else(|| Error::not_found("filesystem", FS_NAME))
    }

    pub fn get_mds_hostnames(&self) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        for id in self.mds_ids.iter() {
            let host = self.manager.find_remote(&Role::mds(id))?.to_string();
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }

    /// Read a config value from the admin socket of the lowest-id daemon of a type.
    pub async fn get_config(&self, key: &str, service: RoleType) -> Result<String> {
        let id = self
            .manager
            .ids_of_type(service)
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("daemon of type", service.as_str()))?;
        let value = self
            .manager
            .json_asok(&Role::new(service, id), &["config", "get", key])
            .await?
            .and_then(|v| v.get(key).cloned())
            .ok_or_else(|| Error::not_found("config key", key))?;
        Ok(match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
    }

    pub async fn get_mds_map(&self) -> Result<MdsMap> {
        self.manager.get_mds_status_all().await
    }

    /// Every MDS is active or standby and enough are active to cover `max_mds`.
    pub async fn are_daemons_healthy(&self) -> Result<bool> {
        let map = self.get_mds_map().await?;
        let mut active = 0;
        for info in map.daemons() {
            debug!("mds.{}: {}", info.name, info.state);
            if !info.state.is_healthy() {
                return Ok(false);
            }
            if info.state == MdsState::Active {
                active += 1;
            }
        }
        Ok(active >= map.max_mds)
    }

    pub async fn get_active_names(&self) -> Result<Vec<String>> {
        Ok(self
            .get_mds_map()
            .await?
            .daemons()
            .filter(|info| info.state == MdsState::Active)
            .map(|info| info.name.clone())
            .collect())
    }

    /// Names of the daemons holding a rank, in rank order.
    pub async fn get_rank_names(&self) -> Result<Vec<String>> {
        Ok(self
            .get_mds_map()
            .await?
            .by_rank()
            .into_iter()
            .map(|info| info.name.clone())
            .collect())
    }

    pub async fn wait_for_daemons(&self, timeout: Option<Duration>) -> Result<Duration> {
        let timeout = timeout.unwrap_or(self.manager.timeouts().mds());
        PollPolicy::new(STATE_POLL, timeout)
            .until("mds daemons healthy", || self.are_daemons_healthy())
            .await
    }

    pub fn get_lone_mds_id(&self) -> Result<&str> {
        match self.mds_ids.as_slice() {
            [id] => Ok(id),
            ids => Err(Error::config(format!(
                "asked for the lone mds id but there are {}",
                ids.len()
            ))),
        }
    }

    /// The address a daemon announces in the MDS map, `ip:port/nonce`.
    pub async fn get_mds_addr(&self, mds_id: &str) -> Result<String> {
        self.manager
            .get_mds_status(mds_id)
            .await?
            .map(|info| info.addr)
            .ok_or_else(|| Error::not_found("mds map entry", mds_id))
    }

    /// Poll the MDS map every second until `goal` is reached.
    ///
    /// Without a target, the goal counts as reached only when exactly one daemon is in that
    /// state; otherwise a daemon in `reject` ends the wait with `Error::RejectState`. With a
    /// target, only that daemon's own state is compared. Returns the time spent waiting.
    pub async fn wait_for_state(
        &self,
        goal: MdsState,
        reject: Option<MdsState>,
        timeout: Option<Duration>,
        target: Option<&str>,
    ) -> Result<Duration> {
        let timeout = timeout.unwrap_or(self.manager.timeouts().mds());
        let what = format!("mds state {goal}");
        let (_, elapsed) = PollPolicy::new(STATE_POLL, timeout)
            .run(&what, || async {
                let current = match target {
                    Some(id) => {
                        let state = self.manager.get_mds_status(id).await?.map(|i| i.state);
                        debug!("looked up mds state for {id}: {state:?}");
                        state
                    }
                    None => {
                        let states = self.get_mds_map().await?.states();
                        let current = if states.iter().filter(|s| **s == goal).count() == 1 {
                            Some(goal.clone())
                        } else if reject.as_ref().is_some_and(|r| states.contains(r)) {
                            reject.clone()
                        } else {
                            None
                        };
                        debug!("mapped states {states:?} to {current:?}");
                        current
                    }
                };

                if current.as_ref() == Some(&goal) {
                    return Ok(Check::Done(()));
                }
                if let (Some(reject), Some(current)) = (&reject, &current) {
                    if reject == current {
                        return Err(Error::RejectState {
                            goal: goal.to_string(),
                            state: current.to_string(),
                        });
                    }
                }
                Ok(Check::Pending(current))
            })
            .await?;
        info!("reached state '{goal}' in {elapsed:?}");
        Ok(elapsed)
    }

    /// Black-hole client traffic to and from an MDS, or lift the block.
    ///
    /// Rules go in one daemon at a time.
    pub async fn set_clients_block(&self, blocked: bool, mds_id: Option<&str>) -> Result<()> {
        let flag = if blocked { "-A" } else { "-D" };
        for id in self.targets(mds_id) {
            let host = self.manager.find_remote(&Role::mds(&id))?.to_string();
            let addr = self.get_mds_addr(&id).await?;
            let port = parse_port(&addr)?;
            info!("{} client traffic to mds.{id} on {host} port {port}", if blocked { "blocking" } else { "unblocking" });
            for (chain, dir) in [("OUTPUT", "--sport"), ("INPUT", "--dport")] {
                self.manager
                    .executor()
                    .run(
                        &host,
                        RunOptions::new([
                            "iptables",
                            flag,
                            chain,
                            "-p",
                            "tcp",
                            dir,
                            &port,
                            "-j",
                            "REJECT",
                            "-m",
                            "comment",
                            "--comment",
                            FIREWALL_COMMENT,
                        ])
                        .sudo(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove every firewall rule this harness installed, on every host.
    pub async fn clear_firewall(&self) -> Result<()> {
        let script = format!("iptables-save | grep -v {FIREWALL_COMMENT} | iptables-restore");
        run_on_all(
            self.manager.executor().as_ref(),
            &self.manager.hosts(),
            RunOptions::new(["sh", "-c", &script]).sudo(),
        )
        .await?;
        Ok(())
    }

    pub async fn mds_stop(&self, registry: &mut DaemonRegistry, mds_id: Option<&str>) -> Result<()> {
        registry
            .fan_out(&self.target_roles(mds_id), |d| async move {
                if d.running() {
                    d.stop(STOP_TIMEOUT).await
                } else {
                    warn!("tried to stop non-running daemon {}", d.role());
                    Ok(())
                }
            })
            .await
    }

    /// Tell the monitors the MDS is gone so its rank is reassigned at once.
    pub async fn mds_fail(&self, mds_id: Option<&str>) -> Result<()> {
        let targets = self.targets(mds_id);
        let futures = targets.iter().map(|id| self.manager.mds_fail(id));
        future::join_all(futures).await.into_iter().collect()
    }

    pub async fn mds_restart(&self, registry: &mut DaemonRegistry, mds_id: Option<&str>) -> Result<()> {
        registry
            .fan_out(&self.target_roles(mds_id), |d| d.restart())
            .await
    }

    /// Stop the daemon, fail its rank, then start it again.
    ///
    /// Failing the rank before the restart keeps the monitors from racing their own liveness
    /// detection against the new process.
    pub async fn mds_fail_restart(&self, registry: &mut DaemonRegistry, mds_id: Option<&str>) -> Result<()> {
        let manager = &self.manager;
        registry
            .fan_out(&self.target_roles(mds_id), |d| async move {
                if d.running() {
                    d.stop(STOP_TIMEOUT).await?;
                }
                manager.mds_fail(&d.role().id).await?;
                d.restart().await
            })
            .await
    }

    /// Run an admin socket command on an MDS, defaulting to the only one there is.
    pub async fn mds_asok(&self, args: &[&str], mds_id: Option<&str>) -> Result<Option<serde_json::Value>> {
        let id = match mds_id {
            Some(id) => id,
            None => self.get_lone_mds_id()?,
        };
        self.manager.json_asok(&Role::mds(id), args).await
    }

    /// Every session the MDS knows about, including stale and closed ones.
    pub async fn session_ls(&self, mds_id: Option<&str>) -> Result<Vec<Session>> {
        match self.mds_asok(&["session", "ls"], mds_id).await? {
            Some(value) => serde_json::from_value(value).map_err(|source| Error::Parse {
                what: "session ls".to_string(),
                source,
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Sessions that still count as live clients.
    pub async fn live_sessions(&self, mds_id: Option<&str>) -> Result<Vec<Session>> {
        Ok(self
            .session_ls(mds_id)
            .await?
            .into_iter()
            .filter(Session::is_live)
            .collect())
    }

    pub async fn session_count(&self, mds_id: Option<&str>) -> Result<usize> {
        Ok(self.live_sessions(mds_id).await?.len())
    }

    pub async fn get_session(&self, client_id: u64, mds_id: Option<&str>) -> Result<Option<Session>> {
        Ok(self
            .session_ls(mds_id)
            .await?
            .into_iter()
            .find(|s| s.id == client_id))
    }

    pub async fn session_evict(&self, client_id: u64, mds_id: Option<&str>) -> Result<()> {
        info!("evicting client session {client_id}");
        self.mds_asok(&["session", "evict", &client_id.to_string()], mds_id)
            .await?;
        Ok(())
    }

    pub async fn is_full(&self) -> Result<bool> {
        Ok(self.manager.get_osd_dump().await?.has_flag("full"))
    }
}

/// Pull the port out of an `ip:port/nonce` address.
fn parse_port(addr: &str) -> Result<String> {
    let unexpected = || Error::UnexpectedOutput {
        what: "mds address".to_string(),
        output: addr.to_string(),
    };
    let (host_port, _nonce) = addr.split_once('/').ok_or_else(unexpected)?;
    let (_, port) = host_port.rsplit_once(':').ok_or_else(unexpected)?;
    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return Err(unexpected());
    }
    Ok(port.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_parsing() {
        let out = r#"[
            {"id": 4305, "num_leases": 0, "num_caps": 3, "state": "open",
             "replay_requests": 0, "reconnecting": false, "inst": "client.4305 10.0.0.2:0/1"},
            {"id": 4310, "num_caps": 0, "state": "stale", "reconnecting": true}
        ]"#;
        let sessions: Vec<Session> = serde_json::from_str(out).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].num_caps, 3);
        assert!(sessions[0].is_live());
        assert_eq!(sessions[1].state, SessionState::Stale);
        assert!(sessions[1].reconnecting);
        assert!(!sessions[1].is_live());
    }

    #[test]
    fn port_from_address() {
        assert_eq!(parse_port("10.0.0.1:6800/2318").unwrap(), "6800");
        assert!(parse_port("10.0.0.1/2318").is_err());
        assert!(parse_port("10.0.0.1:/2318").is_err());
    }
}
