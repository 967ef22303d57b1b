// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A simulated Ceph cluster, used by the tests and by `cephqa run --simulate`.
//!
//! [`SimCluster`] implements [`RemoteExecutor`] and answers the commands the orchestrator sends
//! as a small cluster would: monitors form a quorum once started, OSDs go up and down with their
//! processes, placement groups follow the OSD map, and the MDS walks its rank through
//! `creating`, `replay` and `reconnect` on the tokio clock. Client mounts hold sessions that go
//! stale when cut off and block each other's writes through capabilities. Tests run it under a
//! paused clock, so a scenario that waits out a 60 second timeout finishes at once.
//!
//! All access to the simulated state should be done via methods on SimCluster rather than
//! reaching into the model from the tests themselves.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    log::{debug, trace},
    serde_json::json,
    tokio::time::Instant,
};

use crate::{
    config::{Config, Host},
    error::{Error, Result},
    manager::CLUSTER_LOG,
    remote::{CommandOutput, ExitStatus, RemoteExecutor, RemoteProcess, RunOptions},
    role::{Role, RoleType},
};

const PROCESS_POLL: Duration = Duration::from_millis(100);

/// Time a new rank spends in `up:creating`.
const CREATING_TIME: Duration = Duration::from_secs(1);
/// Time a taken-over rank spends in `up:replay` before it starts reconnecting clients.
const REPLAY_TIME: Duration = Duration::from_secs(2);
/// Time a live client needs to reconnect to a rank in `up:reconnect`.
const CLIENT_RECONNECT_TIME: Duration = Duration::from_secs(1);
/// A stopped MDS stays in the map this long unless it is failed explicitly.
const BEACON_GRACE: Duration = Duration::from_secs(15);
/// Delay before a client whose network came back talks to the MDS again.
const CLIENT_BACKOFF: Duration = Duration::from_secs(1);

const FIRST_GID: u64 = 4100;
const MDS_BASE_PORT: u32 = 6800;

const ENOENT: i32 = 2;
const EIO: i32 = 5;
const ENXIO: i32 = 6;
const EAGAIN: i32 = 11;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const ETIMEDOUT: i32 = 110;

const DEFAULT_OPTIONS: [(&str, &str); 5] = [
    ("mds_session_timeout", "60"),
    ("mds_reconnect_timeout", "45"),
    ("ms_max_backoff", "15"),
    ("mon_pg_warn_min_per_osd", "3"),
    ("osd_mon_report_interval_max", "120"),
];

/// A config for a simulated cluster: `hosts` maps hostnames to role names like `"osd.0"`.
///
/// Timeouts are kept short, so that a test that goes wrong fails quickly.
pub fn test_config(hosts: &[(&str, &[&str])]) -> Result<Config> {
    let hosts = hosts
        .iter()
        .map(|(hostname, roles)| {
            Ok(Host {
                hostname: hostname.to_string(),
                roles: roles
                    .iter()
                    .map(|r| r.parse::<Role>())
                    .collect::<Result<Vec<_>>>()?,
                scratch_devices: Vec::new(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut config = Config {
        hosts,
        ..Default::default()
    };
    config.cluster.test_dir = "/tmp/cephtest".to_string();
    config.timeouts.healthy = 120;
    config.timeouts.clean = 120;
    config.timeouts.quorum = 60;
    config.timeouts.osds_up = 60;
    config.timeouts.mds = 120;
    config.timeouts.mount = 30;
    config.timeouts.poll_interval = 1;
    Ok(config)
}

#[derive(Debug, Clone, PartialEq)]
enum ProcKind {
    Daemon(Role),
    Fuse { client_id: String, mountpoint: String },
    /// Holds the write capability on a file until it is stopped.
    CapHolder { gid: u64, path: String },
    /// Waits for the write capability on a file, writes and exits.
    Writer { gid: u64, path: String },
    Rados,
    Other,
}

#[derive(Debug)]
struct SimProc {
    host: String,
    kind: ProcKind,
    exit: Option<ExitStatus>,
}

#[derive(Debug)]
struct SimOsd {
    up: bool,
    is_in: bool,
    pid: Option<usize>,
    overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MdsPhase {
    Standby,
    Creating,
    Replay,
    Reconnect,
    Active,
}

impl MdsPhase {
    fn as_str(&self) -> &'static str {
        match self {
            MdsPhase::Standby => "up:standby",
            MdsPhase::Creating => "up:creating",
            MdsPhase::Replay => "up:replay",
            MdsPhase::Reconnect => "up:reconnect",
            MdsPhase::Active => "up:active",
        }
    }
}

#[derive(Debug)]
struct MdsEntry {
    gid: u64,
    rank: Option<u32>,
    phase: MdsPhase,
    since: Instant,
    /// The process behind the entry; None once it has exited.
    pid: Option<usize>,
    stopped_at: Option<Instant>,
}

#[derive(Debug)]
struct SimSession {
    gid: u64,
    client_id: String,
    fuse: usize,
    lost_since: Option<Instant>,
    restored_at: Option<Instant>,
    reconnecting: bool,
}

#[derive(Debug)]
struct SimFs {
    name: String,
    metadata_pool: String,
    data_pool: String,
    max_mds: u32,
    /// Ranks that have been active at least once and so must replay when taken over.
    ever_active: BTreeSet<u32>,
    files: BTreeSet<String>,
}

#[derive(Debug)]
struct SimPool {
    id: u32,
    pg_num: u32,
}

#[derive(Debug, Default)]
struct SimHost {
    index: usize,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    /// `(chain, port)` of every REJECT rule.
    rules: BTreeSet<(String, String)>,
}

#[derive(Debug)]
struct SimState {
    hosts: BTreeMap<String, SimHost>,
    role_hosts: BTreeMap<Role, String>,
    mds_ports: BTreeMap<String, u32>,
    procs: Vec<SimProc>,
    /// Live fuse mounts by `(host, mountpoint)`; the fuse process may have died.
    mounts: BTreeMap<(String, String), usize>,
    osds: BTreeMap<u32, SimOsd>,
    flags: BTreeSet<String>,
    pools: BTreeMap<String, SimPool>,
    next_pool: u32,
    /// Objects by `(pool, name)`; true when the object has a divergent log entry.
    objects: BTreeMap<(String, String), bool>,
    scrub_stamps: BTreeMap<String, String>,
    fs: Option<SimFs>,
    mds: BTreeMap<String, MdsEntry>,
    sessions: Vec<SimSession>,
    blocked: bool,
    next_gid: u64,
    options: BTreeMap<String, String>,
    log: Vec<String>,
    history: Vec<(String, Vec<String>)>,
    failures: Vec<(String, i32)>,
    forced_health: Option<String>,
    legacy_cli: bool,
    divergent_read_failure: bool,
}

fn strip_wrappers(args: &[String]) -> &[String] {
    let mut rest = args;
    loop {
        rest = match rest {
            [first, tail @ ..] if first == "sudo" || first == "adjust-ulimits" => tail,
            [first, _, tail @ ..] if first == "ceph-coverage" || first == "daemon-helper" => tail,
            [first, tail @ ..] if first.contains('=') && !first.starts_with('-') => tail,
            _ => return rest,
        };
    }
}

fn out(exit_status: i32, stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_status,
        stdout: stdout.into(),
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    out(0, stdout)
}

fn quoted_path(script: &str) -> Option<String> {
    let start = script.find("open(\"")? + "open(\"".len();
    let len = script[start..].find('"')?;
    Some(script[start..start + len].to_string())
}

impl SimState {
    fn new(config: &Config) -> Self {
        let mut hosts = BTreeMap::new();
        let mut role_hosts = BTreeMap::new();
        let mut osds = BTreeMap::new();
        let mut mds_names = Vec::new();
        for (index, host) in config.hosts.iter().enumerate() {
            hosts.insert(
                host.hostname.clone(),
                SimHost {
                    index,
                    ..Default::default()
                },
            );
            for role in host.roles.iter() {
                role_hosts.insert(role.clone(), host.hostname.clone());
                match role.kind {
                    RoleType::Osd => {
                        if let Ok(id) = role.id.parse::<u32>() {
                            osds.insert(
                                id,
                                SimOsd {
                                    up: false,
                                    is_in: true,
                                    pid: None,
                                    overrides: BTreeMap::new(),
                                },
                            );
                        }
                    }
                    RoleType::Mds => mds_names.push(role.id.clone()),
                    _ => {}
                }
            }
        }
        mds_names.sort();
        let mds_ports = mds_names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, MDS_BASE_PORT + i as u32))
            .collect();

        SimState {
            hosts,
            role_hosts,
            mds_ports,
            procs: Vec::new(),
            mounts: BTreeMap::new(),
            osds,
            flags: BTreeSet::new(),
            pools: BTreeMap::new(),
            next_pool: 0,
            objects: BTreeMap::new(),
            scrub_stamps: BTreeMap::new(),
            fs: None,
            mds: BTreeMap::new(),
            sessions: Vec::new(),
            blocked: false,
            next_gid: FIRST_GID,
            options: DEFAULT_OPTIONS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            log: Vec::new(),
            history: Vec::new(),
            failures: Vec::new(),
            forced_health: None,
            legacy_cli: false,
            divergent_read_failure: false,
        }
    }

    fn option_secs(&self, key: &str) -> Duration {
        self.options
            .get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or_default()
    }

    fn alive(&self, pid: usize) -> bool {
        self.procs.get(pid).is_some_and(|p| p.exit.is_none())
    }

    fn role_running(&self, role: &Role) -> bool {
        self.procs
            .iter()
            .any(|p| p.exit.is_none() && p.kind == ProcKind::Daemon(role.clone()))
    }

    fn running_of_type(&self, kind: RoleType) -> Vec<String> {
        let mut ids: Vec<String> = self
            .procs
            .iter()
            .filter(|p| p.exit.is_none())
            .filter_map(|p| match &p.kind {
                ProcKind::Daemon(role) if role.kind == kind => Some(role.id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn gid(&mut self) -> u64 {
        let gid = self.next_gid;
        self.next_gid += 1;
        gid
    }

    fn failure_for(&self, args: &[String]) -> Option<i32> {
        let line = args.join(" ");
        self.failures
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, status)| *status)
    }

    fn host_mut(&mut self, host: &str) -> &mut SimHost {
        self.hosts.entry(host.to_string()).or_default()
    }

    // Clients and sessions.

    fn mds_addr(&self, name: &str, gid: u64) -> String {
        let index = self
            .role_hosts
            .get(&Role::mds(name))
            .and_then(|h| self.hosts.get(h))
            .map_or(0, |h| h.index);
        let port = self.mds_ports.get(name).copied().unwrap_or(MDS_BASE_PORT);
        format!("10.0.0.{}:{port}/{gid}", index + 1)
    }

    /// True if a firewall rule rejects traffic to any MDS in the map.
    fn clients_blocked(&self) -> bool {
        self.mds.keys().any(|name| {
            let Some(port) = self.mds_ports.get(name).map(|p| p.to_string()) else {
                return false;
            };
            self.role_hosts
                .get(&Role::mds(name))
                .and_then(|h| self.hosts.get(h))
                .is_some_and(|h| h.rules.iter().any(|(_, p)| *p == port))
        })
    }

    fn session_connected(&self, session: &SimSession, now: Instant) -> bool {
        self.alive(session.fuse)
            && !self.blocked
            && session.restored_at.map_or(true, |t| now >= t)
            && session.lost_since.is_none()
    }

    fn session_stale(&self, session: &SimSession, now: Instant) -> bool {
        let timeout = self.option_secs("mds_session_timeout");
        session
            .lost_since
            .is_some_and(|lost| now.duration_since(lost) >= timeout)
    }

    fn session_live(&self, gid: u64, now: Instant) -> bool {
        self.sessions
            .iter()
            .any(|s| s.gid == gid && !self.session_stale(s, now))
    }

    fn any_active(&self) -> bool {
        self.mds
            .values()
            .any(|e| e.phase == MdsPhase::Active && e.pid.is_some())
    }

    fn live_mount(&self, host: &str, path: &str) -> Option<(String, usize)> {
        self.mounts
            .iter()
            .filter(|((h, mnt), _)| h == host && (path == mnt || path.starts_with(&format!("{mnt}/"))))
            .map(|((_, mnt), pid)| (mnt.clone(), *pid))
            .next()
    }

    fn fs_path(mountpoint: &str, path: &str) -> String {
        path.strip_prefix(mountpoint)
            .unwrap_or(path)
            .trim_start_matches('/')
            .to_string()
    }

    // Time.

    /// Bring the model up to `now`: network blocks, client reconnects, MDS rank transitions and
    /// blocked writes.
    fn tick(&mut self, now: Instant) {
        let blocked = self.clients_blocked();
        if blocked != self.blocked {
            for session in self.sessions.iter_mut() {
                if blocked {
                    session.lost_since.get_or_insert(now);
                    session.restored_at = None;
                } else {
                    session.restored_at = Some(now + CLIENT_BACKOFF);
                }
            }
            self.blocked = blocked;
        }
        let alive: Vec<bool> = self.sessions.iter().map(|s| self.alive(s.fuse)).collect();
        for (session, alive) in self.sessions.iter_mut().zip(alive) {
            if let Some(t) = session.restored_at {
                if now >= t && alive && !blocked {
                    session.lost_since = None;
                    session.restored_at = None;
                }
            }
        }

        self.mds
            .retain(|_, e| e.stopped_at.map_or(true, |t| now < t + BEACON_GRACE));
        let running = self.running_of_type(RoleType::Mds);
        for name in running {
            let pid = self.procs.iter().rposition(
                |p| p.exit.is_none() && p.kind == ProcKind::Daemon(Role::mds(&name)),
            );
            if !self.mds.contains_key(&name) {
                let gid = self.gid();
                self.mds.insert(
                    name,
                    MdsEntry {
                        gid,
                        rank: None,
                        phase: MdsPhase::Standby,
                        since: now,
                        pid,
                        stopped_at: None,
                    },
                );
            }
        }

        if let Some(fs) = self.fs.as_ref() {
            let held: BTreeSet<u32> = self.mds.values().filter_map(|e| e.rank).collect();
            let mut replaying: Vec<(String, u32, bool)> = Vec::new();
            for rank in 0..fs.max_mds {
                if held.contains(&rank) {
                    continue;
                }
                let standby = self
                    .mds
                    .iter()
                    .find(|(name, e)| {
                        e.rank.is_none()
                            && e.pid.is_some()
                            && !Role::mds(name).is_standby_mds()
                            && !replaying.iter().any(|(n, ..)| n == *name)
                    })
                    .or_else(|| {
                        self.mds.iter().find(|(name, e)| {
                            e.rank.is_none()
                                && e.pid.is_some()
                                && !replaying.iter().any(|(n, ..)| n == *name)
                        })
                    })
                    .map(|(name, _)| name.clone());
                if let Some(name) = standby {
                    replaying.push((name, rank, fs.ever_active.contains(&rank)));
                }
            }
            for (name, rank, replay) in replaying {
                if let Some(entry) = self.mds.get_mut(&name) {
                    debug!("sim: mds.{name} takes rank {rank}");
                    entry.rank = Some(rank);
                    entry.phase = if replay {
                        MdsPhase::Replay
                    } else {
                        MdsPhase::Creating
                    };
                    entry.since = now;
                }
            }
        }

        let names: Vec<String> = self.mds.keys().cloned().collect();
        for name in names {
            self.advance_mds(&name, now);
        }

        self.complete_writes(now);
    }

    fn advance_mds(&mut self, name: &str, now: Instant) {
        let reconnect_timeout = self.option_secs("mds_reconnect_timeout");
        loop {
            let Some(entry) = self.mds.get(name) else {
                return;
            };
            if entry.pid.is_none() {
                return;
            }
            let (phase, since, rank) = (entry.phase, entry.since, entry.rank);
            let next = match phase {
                MdsPhase::Creating if now >= since + CREATING_TIME => {
                    Some((MdsPhase::Active, since + CREATING_TIME))
                }
                MdsPhase::Replay if now >= since + REPLAY_TIME => {
                    for session in self.sessions.iter_mut() {
                        session.reconnecting = true;
                    }
                    Some((MdsPhase::Reconnect, since + REPLAY_TIME))
                }
                MdsPhase::Reconnect => {
                    let done: Vec<bool> = self
                        .sessions
                        .iter()
                        .map(|s| {
                            !s.reconnecting
                                || (self.session_connected(s, now) && now >= since + CLIENT_RECONNECT_TIME)
                        })
                        .collect();
                    for (session, done) in self.sessions.iter_mut().zip(done.iter()) {
                        if *done {
                            session.reconnecting = false;
                        }
                    }
                    if done.iter().all(|d| *d) {
                        Some((MdsPhase::Active, now))
                    } else if now >= since + reconnect_timeout {
                        let before = self.sessions.len();
                        self.sessions.retain(|s| !s.reconnecting);
                        debug!(
                            "sim: reconnect timed out, dropped {} sessions",
                            before - self.sessions.len()
                        );
                        Some((MdsPhase::Active, since + reconnect_timeout))
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let Some((phase, since)) = next else {
                return;
            };
            if let Some(entry) = self.mds.get_mut(name) {
                trace!("sim: mds.{name} -> {}", phase.as_str());
                entry.phase = phase;
                entry.since = since;
            }
            if phase == MdsPhase::Active {
                if let (Some(fs), Some(rank)) = (self.fs.as_mut(), rank) {
                    fs.ever_active.insert(rank);
                }
            }
        }
    }

    fn complete_writes(&mut self, now: Instant) {
        let holders: Vec<(u64, String)> = self
            .procs
            .iter()
            .filter(|p| p.exit.is_none())
            .filter_map(|p| match &p.kind {
                ProcKind::CapHolder { gid, path } => Some((*gid, path.clone())),
                _ => None,
            })
            .collect();
        let active = self.any_active();
        let mut done = Vec::new();
        for (pid, proc) in self.procs.iter().enumerate() {
            let ProcKind::Writer { gid, path } = &proc.kind else {
                continue;
            };
            if proc.exit.is_some() || !active {
                continue;
            }
            let connected = self
                .sessions
                .iter()
                .any(|s| s.gid == *gid && self.session_connected(s, now));
            let conflict = holders
                .iter()
                .any(|(holder, held)| held == path && holder != gid && self.session_live(*holder, now));
            if connected && !conflict {
                done.push((pid, path.clone()));
            }
        }
        for (pid, path) in done {
            debug!("sim: write to {path} completed");
            if let Some(fs) = self.fs.as_mut() {
                fs.files.insert(path);
            }
            self.procs[pid].exit = Some(ExitStatus::Code(0));
        }
    }

    /// Record a process exit and what it means for the cluster.
    fn stop_proc(&mut self, pid: usize, status: ExitStatus, now: Instant) {
        self.tick(now);
        self.exit_proc(pid, status, now);
        self.tick(now);
    }

    fn exit_proc(&mut self, pid: usize, status: ExitStatus, now: Instant) {
        let Some(proc) = self.procs.get_mut(pid) else {
            return;
        };
        if proc.exit.is_some() {
            return;
        }
        proc.exit = Some(status);
        let kind = proc.kind.clone();
        trace!("sim: process {pid} ({kind:?}) {status}");
        match kind {
            ProcKind::Daemon(role) => match role.kind {
                RoleType::Osd => {
                    let nodown = self.flags.contains("nodown");
                    if let Some(osd) = role.id.parse().ok().and_then(|id: u32| self.osds.get_mut(&id)) {
                        osd.pid = None;
                        if !nodown {
                            osd.up = false;
                        }
                    }
                }
                RoleType::Mds => {
                    if let Some(entry) = self.mds.get_mut(&role.id) {
                        if entry.pid == Some(pid) {
                            entry.pid = None;
                            entry.stopped_at = Some(now);
                        }
                    }
                }
                _ => {}
            },
            ProcKind::Fuse { .. } => {
                for session in self.sessions.iter_mut().filter(|s| s.fuse == pid) {
                    session.lost_since.get_or_insert(now);
                }
            }
            _ => {}
        }
        self.tick(now);
    }

    fn spawn(&mut self, host: &str, args: &[String], now: Instant) -> usize {
        self.tick(now);
        self.history.push((host.to_string(), args.to_vec()));
        let failure = self.failure_for(args);
        let cmd = strip_wrappers(args);

        let kind = match cmd {
            [program, rest @ ..] if program.starts_with("ceph-") && program != "ceph-fuse" => {
                let kind = program.trim_start_matches("ceph-").parse::<RoleType>().ok();
                let id = rest
                    .iter()
                    .position(|a| a == "-i")
                    .and_then(|i| rest.get(i + 1));
                match (kind, id) {
                    (Some(kind), Some(id)) => ProcKind::Daemon(Role::new(kind, id.clone())),
                    _ => ProcKind::Other,
                }
            }
            [program, rest @ ..] if program == "ceph-fuse" => {
                let client_id = rest
                    .iter()
                    .position(|a| a == "--name")
                    .and_then(|i| rest.get(i + 1))
                    .map(|n| n.trim_start_matches("client.").to_string())
                    .unwrap_or_default();
                ProcKind::Fuse {
                    client_id,
                    mountpoint: rest.last().cloned().unwrap_or_default(),
                }
            }
            [program, flag, script] if program == "python" && flag == "-c" => {
                match (quoted_path(script), script.contains("f.flush")) {
                    (Some(path), holder) => match self.live_mount(host, &path) {
                        Some((mnt, fuse)) if self.alive(fuse) => {
                            let gid = self
                                .sessions
                                .iter()
                                .find(|s| s.fuse == fuse)
                                .map_or(0, |s| s.gid);
                            let path = Self::fs_path(&mnt, &path);
                            if holder {
                                ProcKind::CapHolder { gid, path }
                            } else {
                                ProcKind::Writer { gid, path }
                            }
                        }
                        _ => ProcKind::Other,
                    },
                    (None, _) => ProcKind::Other,
                }
            }
            [program, ..] if program == "rados" => ProcKind::Rados,
            _ => ProcKind::Other,
        };

        let pid = self.procs.len();
        self.procs.push(SimProc {
            host: host.to_string(),
            kind: kind.clone(),
            exit: None,
        });
        if let Some(code) = failure {
            self.procs[pid].exit = Some(ExitStatus::Code(code));
            return pid;
        }

        match kind {
            ProcKind::Daemon(role) => match role.kind {
                RoleType::Osd => {
                    if let Some(osd) = role.id.parse().ok().and_then(|id: u32| self.osds.get_mut(&id)) {
                        osd.pid = Some(pid);
                        osd.up = true;
                        osd.overrides.clear();
                    }
                }
                RoleType::Mds => {
                    // A restarted daemon comes back as a new instance.
                    self.mds.remove(&role.id);
                }
                _ => {}
            },
            ProcKind::Fuse {
                client_id,
                mountpoint,
            } => {
                let gid = self.gid();
                let blocked = self.blocked;
                self.sessions.push(SimSession {
                    gid,
                    client_id,
                    fuse: pid,
                    lost_since: blocked.then_some(now),
                    restored_at: None,
                    reconnecting: false,
                });
                self.host_mut(host).dirs.insert(mountpoint.clone());
                self.mounts.insert((host.to_string(), mountpoint), pid);
            }
            ProcKind::CapHolder { path, .. } => {
                if let Some(fs) = self.fs.as_mut() {
                    fs.files.insert(path);
                }
            }
            ProcKind::Rados => {
                let status = self.rados(&cmd[1..], true);
                if status.exit_status != ETIMEDOUT {
                    self.procs[pid].exit = Some(ExitStatus::Code(status.exit_status));
                }
            }
            ProcKind::Other => {
                if matches!(cmd.first().map(String::as_str), Some("python")) {
                    // Nothing to open it on.
                    self.procs[pid].exit = Some(ExitStatus::Code(1));
                }
            }
            ProcKind::Writer { .. } => {}
        }
        self.tick(now);
        pid
    }

    // Foreground commands.

    fn run(&mut self, host: &str, opts: &RunOptions, now: Instant) -> CommandOutput {
        self.tick(now);
        let line = opts.command_line();
        self.history.push((host.to_string(), line.clone()));
        if let Some(code) = self.failure_for(&line) {
            return out(code, "");
        }
        let cmd = strip_wrappers(&line).to_vec();
        let Some((program, args)) = cmd.split_first() else {
            return ok("");
        };
        let stdin = opts
            .stdin
            .as_ref()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();

        let result = match program.as_str() {
            "ceph" => self.ceph(args, now),
            "rados" => self.rados(args, false),
            "tee" => self.tee(host, args, stdin),
            "cat" => self.cat(host, args),
            "egrep" => self.egrep(),
            "tail" => ok(self
                .log
                .iter()
                .rev()
                .take(20)
                .rev()
                .map(|l| format!("{l}\n"))
                .collect::<String>()),
            "mkdir" => {
                for dir in args.iter().filter(|a| !a.starts_with('-')) {
                    self.host_mut(host).dirs.insert(dir.clone());
                }
                ok("")
            }
            "rmdir" => self.rmdir(host, args),
            "rm" => self.rm(host, args),
            "touch" => self.touch(host, args),
            "ls" => self.ls(host, args),
            "stat" => self.stat(host, args),
            "fusermount" => self.fusermount(host, args, now),
            "umount" => self.umount(host, args),
            "sh" => self.shell(host, args, stdin),
            // Contents are already text here, so the encoding is the identity.
            "base64" => self.cat(host, args),
            "iptables" => self.iptables(host, args),
            "killall" => {
                let program = args.last().cloned().unwrap_or_default();
                let victims: Vec<usize> = self
                    .procs
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        p.exit.is_none() && p.host == host && program == "rados" && p.kind == ProcKind::Rados
                    })
                    .map(|(pid, _)| pid)
                    .collect();
                if victims.is_empty() {
                    out(1, "")
                } else {
                    for pid in victims {
                        self.exit_proc(pid, ExitStatus::Signal(9), now);
                    }
                    ok("")
                }
            }
            "ceph-authtool" => {
                if args.iter().any(|a| a == "--create-keyring") {
                    if let (Some(path), Some(name)) = (
                        args.last(),
                        args.iter().find_map(|a| a.strip_prefix("--name=")),
                    ) {
                        let key = format!("[{name}]\n\tkey = AQBsimulated==\n");
                        self.host_mut(host).files.insert(path.clone(), key);
                    }
                }
                ok("")
            }
            "monmaptool" => {
                if let Some(path) = args.last() {
                    self.host_mut(host).files.insert(path.clone(), "monmap".to_string());
                }
                ok("")
            }
            "ceph-mon" | "ceph-osd" if args.iter().any(|a| a == "--mkfs") && !self.has_maps(host, args) => {
                out(ENOENT, "")
            }
            "ceph-osd" if args.iter().any(|a| a == "--mkkey") => {
                if let Some(id) = args.iter().position(|a| a == "-i").and_then(|i| args.get(i + 1)) {
                    let path = format!("/var/lib/ceph/osd/ceph-{id}/keyring");
                    let key = format!("[osd.{id}]\n\tkey = AQBsimulated==\n");
                    self.host_mut(host).files.insert(path, key);
                }
                ok("")
            }
            "osdmaptool" => {
                let at = args.iter().position(|a| a == "--createsimple");
                let count = at
                    .and_then(|i| args.get(i + 1))
                    .and_then(|n| n.parse::<u32>().ok())
                    .unwrap_or(0);
                if let Some(path) = at.and_then(|i| args.get(i + 2)) {
                    self.host_mut(host).files.insert(path.clone(), "osdmap".to_string());
                }
                if count > 0 && self.pools.is_empty() {
                    self.create_pool("rbd", count * 4);
                }
                ok("")
            }
            _ => ok(""),
        };
        // Changes land at the time of the command that made them, not at the next one.
        self.tick(now);
        trace!("sim: {host}: {} -> {}", line.join(" "), result.exit_status);
        result
    }

    /// Every `--monmap` and `--osdmap` a mkfs names must exist on the host.
    fn has_maps(&self, host: &str, args: &[String]) -> bool {
        args.windows(2)
            .filter(|w| w[0] == "--monmap" || w[0] == "--osdmap")
            .all(|w| self.hosts.get(host).is_some_and(|h| h.files.contains_key(&w[1])))
    }

    fn tee(&mut self, host: &str, args: &[String], stdin: String) -> CommandOutput {
        let append = args.iter().any(|a| a == "-a");
        let Some(path) = args.iter().find(|a| !a.starts_with('-')) else {
            return out(EINVAL, "");
        };
        let file = self.host_mut(host).files.entry(path.clone()).or_default();
        if append {
            file.push_str(&stdin);
        } else {
            *file = stdin.clone();
        }
        ok(stdin)
    }

    fn cat(&mut self, host: &str, args: &[String]) -> CommandOutput {
        let Some(path) = args.last() else {
            return out(EINVAL, "");
        };
        if path == CLUSTER_LOG {
            return ok(self.log.iter().map(|l| format!("{l}\n")).collect::<String>());
        }
        match self.host_mut(host).files.get(path) {
            Some(contents) => ok(contents.clone()),
            None => out(1, ""),
        }
    }

    fn egrep(&self) -> CommandOutput {
        let matches: String = self
            .log
            .iter()
            .filter(|l| ["[ERR]", "[WRN]", "[SEC]"].iter().any(|m| l.contains(m)))
            .map(|l| format!("{l}\n"))
            .collect();
        if matches.is_empty() {
            out(1, "")
        } else {
            ok(matches)
        }
    }

    fn rmdir(&mut self, host: &str, args: &[String]) -> CommandOutput {
        let Some(dir) = args.last() else {
            return out(EINVAL, "");
        };
        if self.mounts.contains_key(&(host.to_string(), dir.clone())) {
            return out(EBUSY, "");
        }
        if self.host_mut(host).dirs.remove(dir) {
            ok("")
        } else {
            out(1, "")
        }
    }

    fn rm(&mut self, host: &str, args: &[String]) -> CommandOutput {
        for path in args.iter().filter(|a| !a.starts_with('-')) {
            if let Some((mnt, fuse)) = self.live_mount(host, path) {
                if path != &mnt && self.alive(fuse) {
                    let rel = Self::fs_path(&mnt, path);
                    if let Some(fs) = self.fs.as_mut() {
                        fs.files.remove(&rel);
                    }
                    continue;
                }
                self.mounts.remove(&(host.to_string(), mnt));
            }
            let prefix = format!("{path}/");
            let h = self.host_mut(host);
            h.files.retain(|f, _| f != path && !f.starts_with(&prefix));
            h.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        }
        ok("")
    }

    fn touch(&mut self, host: &str, args: &[String]) -> CommandOutput {
        let Some(path) = args.last() else {
            return out(EINVAL, "");
        };
        match self.live_mount(host, path) {
            Some((mnt, fuse)) if self.alive(fuse) => {
                let rel = Self::fs_path(&mnt, path);
                match self.fs.as_mut() {
                    Some(fs) => {
                        fs.files.insert(rel);
                        ok("")
                    }
                    None => out(EIO, ""),
                }
            }
            // Transport endpoint is not connected.
            Some(_) => out(1, ""),
            None => {
                self.host_mut(host).files.entry(path.clone()).or_default();
                ok("")
            }
        }
    }

    fn ls(&mut self, host: &str, args: &[String]) -> CommandOutput {
        let Some(path) = args.last() else {
            return ok("");
        };
        let found = match self.live_mount(host, path) {
            Some((mnt, fuse)) if self.alive(fuse) => {
                path == &mnt
                    || self
                        .fs
                        .as_ref()
                        .is_some_and(|fs| fs.files.contains(&Self::fs_path(&mnt, path)))
            }
            Some(_) => false,
            None => {
                let h = self.host_mut(host);
                h.files.contains_key(path) || h.dirs.contains(path)
            }
        };
        if found {
            ok(format!("{path}\n"))
        } else {
            out(ENOENT, "")
        }
    }

    fn stat(&mut self, host: &str, args: &[String]) -> CommandOutput {
        let Some(path) = args.last() else {
            return out(EINVAL, "");
        };
        match self.mounts.get(&(host.to_string(), path.clone())) {
            Some(fuse) if self.alive(*fuse) => ok("fuseblk\n"),
            Some(_) => out(1, ""),
            None if self.hosts.get(host).is_some_and(|h| h.dirs.contains(path)) => ok("ext2/ext3\n"),
            None => out(1, ""),
        }
    }

    fn fusermount(&mut self, host: &str, args: &[String], now: Instant) -> CommandOutput {
        let Some(mnt) = args.last() else {
            return out(EINVAL, "");
        };
        let Some(fuse) = self.mounts.remove(&(host.to_string(), mnt.clone())) else {
            return out(1, "");
        };
        if self.alive(fuse) {
            // A clean unmount closes the session, if there is an MDS to tell.
            if self.any_active() && !self.blocked {
                self.sessions.retain(|s| s.fuse != fuse);
            }
            self.exit_proc(fuse, ExitStatus::Code(0), now);
        }
        ok("")
    }

    fn umount(&mut self, host: &str, args: &[String]) -> CommandOutput {
        let Some(path) = args.last() else {
            return out(EINVAL, "");
        };
        if self.mounts.remove(&(host.to_string(), path.clone())).is_some() {
            return ok("");
        }
        // Device mounts made at provisioning time.
        ok("")
    }

    fn shell(&mut self, host: &str, args: &[String], stdin: String) -> CommandOutput {
        let Some(script) = args.last() else {
            return out(EINVAL, "");
        };
        if let Some(path) = script.strip_prefix("base64 -d > ") {
            self.host_mut(host).files.insert(path.to_string(), stdin);
            return ok("");
        }
        if script.contains("iptables-save") {
            self.host_mut(host).rules.clear();
            return ok("");
        }
        if script.contains("mds_sessions") {
            let client_id = script
                .split("ceph-client.")
                .nth(1)
                .and_then(|rest| rest.split('.').next())
                .unwrap_or_default();
            let gid = self
                .sessions
                .iter()
                .rev()
                .find(|s| s.client_id == client_id && self.alive(s.fuse))
                .map(|s| s.gid);
            return match gid {
                Some(gid) => ok(json!({ "id": gid, "sessions": [] }).to_string()),
                None => out(ENOENT, ""),
            };
        }
        ok("")
    }

    fn iptables(&mut self, host: &str, args: &[String]) -> CommandOutput {
        let (Some(flag), Some(chain)) = (args.first(), args.get(1)) else {
            return out(EINVAL, "");
        };
        let Some(port) = args
            .iter()
            .position(|a| a == "--sport" || a == "--dport")
            .and_then(|i| args.get(i + 1))
        else {
            return out(EINVAL, "");
        };
        let rule = (chain.clone(), port.clone());
        let rules = &mut self.host_mut(host).rules;
        match flag.as_str() {
            "-A" => {
                rules.insert(rule);
                ok("")
            }
            "-D" if rules.remove(&rule) => ok(""),
            // Bad rule (does a matching rule exist in that chain?).
            "-D" => out(1, ""),
            _ => out(EINVAL, ""),
        }
    }

    // The ceph CLI.

    fn ceph(&mut self, args: &[String], now: Instant) -> CommandOutput {
        if let [flag, path, rest @ ..] = args {
            if flag == "--admin-daemon" {
                return self.admin_socket(path, rest, now);
            }
        }
        if self.running_of_type(RoleType::Mon).is_empty() {
            return out(1, "");
        }
        if self.legacy_cli && args.iter().any(|a| a.starts_with("--format")) {
            return out(EINVAL, "");
        }
        let args: Vec<&str> = args
            .iter()
            .map(String::as_str)
            .filter(|a| !a.starts_with("--format"))
            .collect();

        match args.as_slice() {
            ["health"] => ok(self.health()),
            ["quorum_status"] => ok(json!({ "quorum_names": self.running_of_type(RoleType::Mon) }).to_string()),
            ["pg", "dump"] => ok(json!({ "pg_stats": self.pg_stats() }).to_string()),
            ["pg", "map", pgid] => self.pg_map(pgid),
            ["osd", "dump"] => ok(self.osd_dump()),
            ["osd", "lspools"] => ok(json!(self
                .pools
                .iter()
                .map(|(name, p)| json!({ "poolnum": p.id, "poolname": name }))
                .collect::<Vec<_>>())
            .to_string()),
            ["osd", "set", flag] => {
                self.flags.insert(flag.to_string());
                ok("")
            }
            ["osd", "unset", flag] => {
                self.flags.remove(*flag);
                ok("")
            }
            ["osd", op @ ("down" | "out" | "in"), id] => {
                let alive = id
                    .parse::<u32>()
                    .ok()
                    .and_then(|id| self.osds.get(&id))
                    .and_then(|o| o.pid)
                    .is_some_and(|pid| self.alive(pid));
                let Some(osd) = id.parse::<u32>().ok().and_then(|id| self.osds.get_mut(&id)) else {
                    return out(ENOENT, "");
                };
                match *op {
                    // A live daemon marks itself up again straight away.
                    "down" => osd.up = alive,
                    "out" => osd.is_in = false,
                    _ => osd.is_in = true,
                }
                ok("")
            }
            ["osd", "pool", "create", name, pg_num, ..] => match pg_num.parse::<u32>() {
                Ok(pg_num) => {
                    self.create_pool(name, pg_num);
                    ok("")
                }
                Err(_) => out(EINVAL, ""),
            },
            ["osd", "pool", "delete", name, ..] => {
                if self.fs.as_ref().is_some_and(|fs| fs.metadata_pool == *name || fs.data_pool == *name) {
                    return out(EBUSY, "");
                }
                self.pools.remove(*name);
                self.objects.retain(|(pool, _), _| pool != name);
                ok("")
            }
            ["osd", "pool", "get", pool, "pg_num"] => match self.pools.get(*pool) {
                Some(p) => ok(format!("pg_num: {}\n", p.pg_num)),
                None => out(ENOENT, ""),
            },
            ["osd", "crush", "tunables", _] => ok(""),
            ["osd", "deep-scrub", who] => {
                if !who.starts_with("osd.") {
                    return out(EINVAL, "");
                }
                let stamp = (chrono::Local::now() + chrono::Duration::seconds(1))
                    .format("%Y-%m-%d %H:%M:%S%.6f")
                    .to_string();
                for pgid in self.pgids() {
                    self.scrub_stamps.insert(pgid, stamp.clone());
                }
                ok("")
            }
            ["tell", who, rest @ ..] => self.tell(who, rest),
            ["mds", "dump"] => ok(self.mds_dump()),
            ["mds", "set", "max_mds", n] => match (n.parse::<u32>(), self.fs.as_mut()) {
                (Ok(n), Some(fs)) => {
                    fs.max_mds = n;
                    ok("")
                }
                (Ok(_), None) => out(ENOENT, ""),
                (Err(_), _) => out(EINVAL, ""),
            },
            ["mds", "fail", name] => {
                if let Some(entry) = self.mds.remove(*name) {
                    debug!("sim: failed mds.{name} (rank {:?})", entry.rank);
                }
                ok("")
            }
            ["fs", "new", name, metadata, data] => {
                if !self.pools.contains_key(*metadata) || !self.pools.contains_key(*data) {
                    return out(ENOENT, "");
                }
                self.fs = Some(SimFs {
                    name: name.to_string(),
                    metadata_pool: metadata.to_string(),
                    data_pool: data.to_string(),
                    max_mds: 1,
                    ever_active: BTreeSet::new(),
                    files: BTreeSet::new(),
                });
                self.tick(now);
                ok("")
            }
            ["fs", "rm", name, ..] => {
                if self.mds.values().any(|e| e.rank.is_some()) {
                    return out(EINVAL, "");
                }
                if self.fs.as_ref().is_some_and(|fs| fs.name == *name) {
                    self.fs = None;
                    self.sessions.clear();
                }
                ok("")
            }
            ["fs", "ls"] => ok(json!(self
                .fs
                .iter()
                .map(|fs| json!({
                    "name": fs.name,
                    "metadata_pool": fs.metadata_pool,
                    "data_pools": [fs.data_pool],
                }))
                .collect::<Vec<_>>())
            .to_string()),
            _ => out(EINVAL, ""),
        }
    }

    fn tell(&mut self, who: &str, args: &[&str]) -> CommandOutput {
        let Some(id) = who.strip_prefix("osd.").and_then(|id| id.parse::<u32>().ok()) else {
            return out(EINVAL, "");
        };
        let alive = self
            .osds
            .get(&id)
            .and_then(|o| o.pid)
            .is_some_and(|pid| self.alive(pid));
        if !alive {
            return out(ENXIO, "");
        }
        match args {
            ["flush_pg_stats"] => ok(""),
            ["injectargs", key, value] => {
                if let Some(osd) = self.osds.get_mut(&id) {
                    osd.overrides
                        .insert(key.trim_start_matches('-').to_string(), value.to_string());
                }
                ok("")
            }
            _ => out(EINVAL, ""),
        }
    }

    fn admin_socket(&mut self, path: &str, args: &[String], now: Instant) -> CommandOutput {
        let Some(role) = path
            .strip_prefix("/var/run/ceph/ceph-")
            .and_then(|p| p.strip_suffix(".asok"))
            .and_then(|r| r.parse::<Role>().ok())
        else {
            return out(ENOENT, "");
        };
        if !self.role_running(&role) {
            return out(ENOENT, "");
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["version"] => ok(json!({ "version": "0.94.0-sim" }).to_string()),
            ["config", "get", key] => match self.options.get(*key) {
                Some(value) => {
                    let mut answer = serde_json::Map::new();
                    answer.insert(key.to_string(), json!(value));
                    ok(serde_json::Value::Object(answer).to_string())
                }
                None => out(ENOENT, ""),
            },
            ["session", "ls"] if role.kind == RoleType::Mds => {
                let sessions: Vec<_> = self
                    .sessions
                    .iter()
                    .map(|s| {
                        let num_caps = self
                            .procs
                            .iter()
                            .filter(|p| {
                                p.exit.is_none()
                                    && matches!(&p.kind, ProcKind::CapHolder { gid, .. } if *gid == s.gid)
                            })
                            .count()
                            + 1;
                        json!({
                            "id": s.gid,
                            "state": if self.session_stale(s, now) { "stale" } else { "open" },
                            "num_caps": num_caps,
                            "reconnecting": s.reconnecting,
                            "inst": format!("client.{} 10.0.1.1:0/{}", s.gid, s.fuse),
                        })
                    })
                    .collect();
                ok(json!(sessions).to_string())
            }
            ["session", "evict", id] if role.kind == RoleType::Mds => match id.parse::<u64>() {
                Ok(gid) => {
                    self.sessions.retain(|s| s.gid != gid);
                    self.tick(now);
                    ok("")
                }
                Err(_) => out(EINVAL, ""),
            },
            _ => out(EINVAL, ""),
        }
    }

    // Maps.

    fn create_pool(&mut self, name: &str, pg_num: u32) {
        if self.pools.contains_key(name) {
            return;
        }
        let id = self.next_pool;
        self.next_pool += 1;
        self.pools.insert(name.to_string(), SimPool { id, pg_num });
    }

    fn acting(&self) -> Vec<u32> {
        self.osds
            .iter()
            .filter(|(_, o)| o.up && o.is_in)
            .map(|(id, _)| *id)
            .collect()
    }

    fn pg_state(&self) -> &'static str {
        let size = self.osds.len().min(2);
        let acting = self.acting().len();
        if self.osds.is_empty() {
            "creating"
        } else if acting == 0 {
            "down+peering"
        } else if acting >= size {
            "active+clean"
        } else {
            "active+undersized+degraded"
        }
    }

    fn pgids(&self) -> Vec<String> {
        self.pools
            .values()
            .flat_map(|p| (0..p.pg_num).map(move |i| format!("{}.{i:x}", p.id)))
            .collect()
    }

    fn pg_stats(&self) -> Vec<serde_json::Value> {
        let state = self.pg_state();
        self.pgids()
            .into_iter()
            .map(|pgid| {
                let stamp = self
                    .scrub_stamps
                    .get(&pgid)
                    .cloned()
                    .unwrap_or_else(|| "2000-01-01 00:00:00.000000".to_string());
                json!({ "pgid": pgid, "state": state, "last_scrub_stamp": stamp })
            })
            .collect()
    }

    fn pg_map(&self, pgid: &str) -> CommandOutput {
        let Some(pool) = pgid
            .split_once('.')
            .and_then(|(pool, _)| pool.parse::<u32>().ok())
        else {
            return out(EINVAL, "");
        };
        if !self.pools.values().any(|p| p.id == pool) {
            return out(ENOENT, "");
        }
        let acting = self.acting();
        if acting.is_empty() {
            return out(EAGAIN, "");
        }
        let primary = acting[pool as usize % acting.len()];
        ok(json!({
            "pgid": pgid,
            "up": acting,
            "acting": acting,
            "acting_primary": primary,
        })
        .to_string())
    }

    fn osd_dump(&self) -> String {
        let mut flags: Vec<&str> = self.flags.iter().map(String::as_str).collect();
        flags.sort();
        json!({
            "flags": flags.join(","),
            "osds": self.osds.iter().map(|(id, o)| json!({
                "osd": id,
                "up": u8::from(o.up),
                "in": u8::from(o.is_in),
            })).collect::<Vec<_>>(),
            "pools": self.pools.iter().map(|(name, p)| json!({
                "pool": p.id,
                "pool_name": name,
                "pg_num": p.pg_num,
            })).collect::<Vec<_>>(),
        })
        .to_string()
    }

    fn mds_dump(&self) -> String {
        let info: serde_json::Map<String, serde_json::Value> = self
            .mds
            .iter()
            .map(|(name, e)| {
                (
                    format!("gid_{}", e.gid),
                    json!({
                        "gid": e.gid,
                        "name": name,
                        "rank": e.rank.map_or(-1, i64::from),
                        "state": e.phase.as_str(),
                        "addr": self.mds_addr(name, e.gid),
                    }),
                )
            })
            .collect();
        json!({
            "epoch": self.history.len(),
            "max_mds": self.fs.as_ref().map_or(0, |fs| fs.max_mds),
            "info": info,
        })
        .to_string()
    }

    fn health(&self) -> String {
        if let Some(forced) = &self.forced_health {
            return forced.clone();
        }
        let mut problems = Vec::new();
        let down = self.osds.values().filter(|o| !o.up).count();
        if down > 0 {
            problems.push(format!("{down} osds down"));
        }
        let state = self.pg_state();
        let pgs = self.pgids().len();
        if pgs > 0 && state != "active+clean" {
            problems.push(format!("{pgs} pgs {state}"));
        }
        for flag in self.flags.iter() {
            problems.push(format!("{flag} flag(s) set"));
        }
        if let Some(fs) = &self.fs {
            let active = self
                .mds
                .values()
                .filter(|e| e.phase == MdsPhase::Active && e.pid.is_some())
                .count();
            if (active as u32) < fs.max_mds {
                problems.push("mds cluster is degraded".to_string());
            }
        }
        if problems.is_empty() {
            "HEALTH_OK\n".to_string()
        } else {
            format!("HEALTH_WARN {}\n", problems.join("; "))
        }
    }

    fn rados(&mut self, args: &[String], background: bool) -> CommandOutput {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let (pool, op) = match args.as_slice() {
            ["-p", pool, op @ ..] => (pool.to_string(), op.to_vec()),
            _ => return out(EINVAL, ""),
        };
        if !self.pools.contains_key(&pool) {
            return out(ENOENT, "");
        }
        let acting = self.acting();
        if acting.is_empty() {
            return out(ETIMEDOUT, "");
        }
        let blackholed = acting.iter().any(|id| {
            self.osds
                .get(id)
                .is_some_and(|o| o.overrides.contains_key("filestore_blackhole"))
        });
        match op.as_slice() {
            ["put", name, _file] => {
                let key = (pool, name.to_string());
                if blackholed {
                    // The primary logs the write, the replicas never acknowledge it.
                    if self.objects.contains_key(&key) {
                        self.objects.insert(key, true);
                    }
                    if !background {
                        debug!("sim: foreground write to blackholed osds would hang");
                    }
                    return out(ETIMEDOUT, "");
                }
                self.objects.insert(key, false);
                ok("")
            }
            ["get", name, ..] => match self.objects.get(&(pool, name.to_string())) {
                Some(true) if self.divergent_read_failure => out(EIO, ""),
                Some(_) => ok(""),
                None => out(ENOENT, ""),
            },
            _ => out(EINVAL, ""),
        }
    }
}

/// Shared handle on the simulated cluster. Clones share the same state.
#[derive(Debug, Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// A cluster with the hosts and roles of `config`, nothing provisioned and nothing running.
    pub fn new(config: &Config) -> Self {
        SimCluster {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        Arc::new(self.clone())
    }

    /// Make every command line containing `pattern` exit with `exit_status`. Applies to
    /// background processes too, which then exit immediately.
    pub fn fail_command(&self, pattern: &str, exit_status: i32) {
        self.lock().failures.push((pattern.to_string(), exit_status));
    }

    /// Make the running daemon for `role` die from `signal`, as a crash would.
    pub fn crash(&self, role: &Role, signal: i32) {
        let mut state = self.lock();
        let daemon = ProcKind::Daemon(role.clone());
        if let Some(pid) = state
            .procs
            .iter()
            .rposition(|p| p.exit.is_none() && p.kind == daemon)
        {
            state.stop_proc(pid, ExitStatus::Signal(signal), Instant::now());
        }
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Answer `ceph health` with `line` instead of the computed health.
    pub fn force_health(&self, line: Option<&str>) {
        self.lock().forced_health = line.map(str::to_string);
    }

    /// Append a line to the cluster log.
    pub fn log(&self, line: &str) {
        self.lock().log.push(line.to_string());
    }

    /// Change a config option as every daemon reports it.
    pub fn set_option(&self, key: &str, value: &str) {
        self.lock().options.insert(key.to_string(), value.to_string());
    }

    pub fn set_full(&self, full: bool) {
        let mut state = self.lock();
        if full {
            state.flags.insert("full".to_string());
        } else {
            state.flags.remove("full");
        }
    }

    /// Emulate a CLI that predates `--format`.
    pub fn set_legacy_cli(&self, legacy: bool) {
        self.lock().legacy_cli = legacy;
    }

    /// Make reads of objects with a divergent log entry fail, as they would if the entry were
    /// never rolled back.
    pub fn set_divergent_read_failure(&self, fail: bool) {
        self.lock().divergent_read_failure = fail;
    }

    /// Every command run or spawned so far, as `host: command line`.
    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .map(|(host, args)| format!("{host}: {}", args.join(" ")))
            .collect()
    }

    pub fn count_commands(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    /// Index in the command history of the first command containing `needle`.
    pub fn command_position(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }

    pub fn is_running(&self, role: &Role) -> bool {
        self.lock().role_running(role)
    }

    /// Number of processes still running, of any kind.
    pub fn live_processes(&self) -> usize {
        self.lock().procs.iter().filter(|p| p.exit.is_none()).count()
    }

    pub fn mds_state(&self, name: &str) -> Option<String> {
        let mut state = self.lock();
        state.tick(Instant::now());
        state.mds.get(name).map(|e| e.phase.as_str().to_string())
    }

    pub fn firewall_rules(&self) -> usize {
        self.lock().hosts.values().map(|h| h.rules.len()).sum()
    }

    pub fn pools(&self) -> Vec<String> {
        self.lock().pools.keys().cloned().collect()
    }

    pub fn session_ids(&self) -> Vec<u64> {
        self.lock().sessions.iter().map(|s| s.gid).collect()
    }

    pub fn osd_override(&self, osd: u32, key: &str) -> Option<String> {
        self.lock()
            .osds
            .get(&osd)
            .and_then(|o| o.overrides.get(key).cloned())
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.lock()
            .hosts
            .get(host)
            .and_then(|h| h.files.get(path).cloned())
    }
}

#[async_trait]
impl RemoteExecutor for SimCluster {
    async fn run(&self, host: &str, opts: RunOptions) -> Result<CommandOutput> {
        let output = self.lock().run(host, &opts, Instant::now());
        if opts.check_status {
            output.check(host, &opts.command_line())
        } else {
            Ok(output)
        }
    }

    async fn spawn(&self, host: &str, args: Vec<String>) -> Result<Box<dyn RemoteProcess>> {
        if !self.lock().hosts.contains_key(host) {
            return Err(Error::not_found("host", host));
        }
        let pid = self.lock().spawn(host, &args, Instant::now());
        Ok(Box::new(SimProcess {
            pid,
            cluster: self.clone(),
        }))
    }
}

#[derive(Debug)]
struct SimProcess {
    pid: usize,
    cluster: SimCluster,
}

impl SimProcess {
    fn status(&self) -> Option<ExitStatus> {
        let mut state = self.cluster.lock();
        state.tick(Instant::now());
        state.procs.get(self.pid).and_then(|p| p.exit)
    }
}

#[async_trait]
impl RemoteProcess for SimProcess {
    async fn close_stdin(&mut self) -> Result<()> {
        self.cluster.lock().stop_proc(self.pid, ExitStatus::Code(0), Instant::now());
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.cluster.lock().stop_proc(self.pid, ExitStatus::Signal(9), Instant::now());
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.status() {
                return Ok(status);
            }
            tokio::time::sleep(PROCESS_POLL).await;
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn wrappers_are_stripped() {
        let args = strs(&[
            "sudo",
            "adjust-ulimits",
            "ceph-coverage",
            "/tmp/cov",
            "daemon-helper",
            "kill",
            "ceph-osd",
            "-f",
            "-i",
            "0",
        ]);
        assert_eq!(strip_wrappers(&args), &strs(&["ceph-osd", "-f", "-i", "0"])[..]);
        let args = strs(&["ceph", "--name=client.0"]);
        assert_eq!(strip_wrappers(&args), &args[..]);
    }

    #[test]
    fn script_paths() {
        assert_eq!(
            quoted_path("fd = os.open(\"/mnt/a/f\", os.O_RDWR)").as_deref(),
            Some("/mnt/a/f")
        );
        assert_eq!(quoted_path("print(1)"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ceph_needs_a_monitor() {
        let config = test_config(&[("node0", &["mon.a", "osd.0"])]).unwrap();
        let sim = SimCluster::new(&config);
        let exec = sim.executor();

        let health = RunOptions::new(["ceph", "health"]).unchecked();
        assert_eq!(exec.run("node0", health.clone()).await.unwrap().exit_status, 1);

        let mon = exec
            .spawn("node0", strs(&["ceph-mon", "-f", "-i", "a"]))
            .await
            .unwrap();
        assert!(sim.is_running(&"mon.a".parse().unwrap()));
        let out = exec.run("node0", health).await.unwrap();
        assert!(out.stdout.starts_with("HEALTH_WARN 1 osds down"));
        drop(mon);
    }
}
