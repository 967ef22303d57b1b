// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Bring-up and teardown of a whole test cluster.
//!
//! [`ClusterLifecycle`] is the entry point: [`ClusterLifecycle::run`] brings a cluster up, hands a
//! [`LiveCluster`] to a test body, and always tears the cluster down again. Ordering lives in
//! [`LifecyclePhase`]; every phase change is checked and recorded.

use std::{cell::Cell, fmt, path::Path, sync::Arc, time::Duration};

use {
    futures::future::LocalBoxFuture,
    log::{debug, error, info, warn},
    regex::Regex,
};

use crate::{
    cluster::{data_dir, Cluster},
    config::Config,
    daemon::{DaemonRegistry, LaunchSpec, STOP_TIMEOUT},
    error::{Error, Result},
    fs::{mount::ClientMount, FilesystemDriver},
    manager::{ClusterManager, CLUSTER_LOG},
    poll::{PollPolicy, Check},
    remote::{run_on_all, RemoteExecutor, RunOptions},
    role::{Role, RoleType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecyclePhase {
    Unconfigured,
    Provisioning,
    StartingMonitors,
    StartingOsds,
    StartingMds,
    Converging,
    Healthy,
    TearingDown,
    Terminated,
}

impl LifecyclePhase {
    /// Bring-up moves strictly forward one phase at a time. Any phase short of teardown may
    /// jump to `TearingDown`.
    pub fn can_advance_to(self, next: LifecyclePhase) -> bool {
        use LifecyclePhase::*;

        match (self, next) {
            (TearingDown | Terminated, TearingDown) => false,
            (_, TearingDown) => true,
            (Unconfigured, Provisioning)
            | (Provisioning, StartingMonitors)
            | (StartingMonitors, StartingOsds)
            | (StartingOsds, StartingMds)
            | (StartingMds, Converging)
            | (Converging, Healthy)
            | (TearingDown, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                LifecyclePhase::Unconfigured => "unconfigured",
                LifecyclePhase::Provisioning => "provisioning",
                LifecyclePhase::StartingMonitors => "starting monitors",
                LifecyclePhase::StartingOsds => "starting osds",
                LifecyclePhase::StartingMds => "starting mds",
                LifecyclePhase::Converging => "converging",
                LifecyclePhase::Healthy => "healthy",
                LifecyclePhase::TearingDown => "tearing down",
                LifecyclePhase::Terminated => "terminated",
            }
        )
    }
}

/// What a finished run looked like.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub success: bool,
    /// The most severe cluster log marker if there was one, otherwise the error that ended the
    /// run.
    pub failure_reason: Option<String>,
    pub teardown_errors: Vec<String>,
    pub phases: Vec<LifecyclePhase>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeardownReport {
    /// Set when this call found the cluster already torn down and did nothing.
    pub already_torn_down: bool,
    pub log_failure: Option<String>,
    pub errors: Vec<String>,
}

/// Extra waits after restarting daemons.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartOptions {
    pub wait_for_healthy: bool,
    pub wait_for_osds_up: bool,
}

/// Scrub polling cadence on the way out.
const SCRUB_POLL: Duration = Duration::from_secs(10);

const LOG_MARKERS: [&str; 3] = ["[SEC]", "[ERR]", "[WRN]"];

/// Find the most severe unwhitelisted marker line in the cluster log.
///
/// Security markers outrank errors, which outrank warnings. The first line of the most severe
/// class is reported.
pub fn scan_cluster_log<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    whitelist: &[Regex],
) -> Option<String> {
    let hits: Vec<&str> = lines
        .into_iter()
        .filter(|line| LOG_MARKERS.iter().any(|m| line.contains(m)))
        .filter(|line| !whitelist.iter().any(|re| re.is_match(line)))
        .collect();

    LOG_MARKERS.iter().find_map(|marker| {
        hits.iter()
            .find(|line| line.contains(marker))
            .map(|line| format!("\"{}\" in cluster log", line.trim_end()))
    })
}

fn default_mkfs_options(fs: &str) -> Vec<String> {
    let opts: &[&str] = match fs {
        "xfs" => &["-f", "-i", "size=2048"],
        "btrfs" => &["-m", "single", "-l", "32768", "-n", "32768"],
        _ => &["-F"],
    };
    opts.iter().map(|s| s.to_string()).collect()
}

fn default_mount_options(fs: &str) -> Vec<String> {
    let opts: &[&str] = match fs {
        "xfs" => &["noatime", "inode64"],
        _ => &["noatime"],
    };
    opts.iter().map(|s| s.to_string()).collect()
}

fn keyring_for(role: &Role) -> String {
    match role.kind {
        RoleType::Client => format!("/etc/ceph/ceph.client.{}.keyring", role.id),
        _ => format!("{}/keyring", data_dir(role)),
    }
}

fn caps_for(kind: RoleType) -> &'static [&'static str] {
    match kind {
        RoleType::Osd => &["--cap", "osd", "allow *", "--cap", "mon", "allow profile osd"],
        RoleType::Mds => &[
            "--cap", "mon", "allow profile mds", "--cap", "osd", "allow *", "--cap", "mds", "allow",
        ],
        _ => &[
            "--cap", "mon", "allow rw", "--cap", "osd", "allow rwx", "--cap", "mds", "allow",
        ],
    }
}

/// A cluster that has been (or is being) brought up.
///
/// The registry and manager are public so that a test body can hold the manager while
/// mutating daemon handles.
#[derive(Debug)]
pub struct LiveCluster {
    cluster: Cluster,
    config: Config,
    executor: Arc<dyn RemoteExecutor>,
    pub registry: DaemonRegistry,
    pub manager: ClusterManager,
    phase: LifecyclePhase,
    history: Vec<LifecyclePhase>,
    /// `(host, mountpoint)` of every scratch device mounted for an OSD.
    mounted_devices: Vec<(String, String)>,
    failure: Option<String>,
}

impl LiveCluster {
    /// Build the in-memory model. Nothing is run on any host.
    pub fn new(config: Config, executor: Arc<dyn RemoteExecutor>) -> Result<Self> {
        let cluster = Cluster::from_config(&config);
        let (_, admin_host) = cluster.first_mon()?;
        let manager = ClusterManager::new(
            Arc::clone(&executor),
            admin_host,
            cluster.role_hosts(),
            &config.cluster.coverage_dir(),
            config.timeouts,
        );
        Ok(LiveCluster {
            cluster,
            config,
            executor,
            registry: DaemonRegistry::new(),
            manager,
            phase: LifecyclePhase::Unconfigured,
            history: vec![LifecyclePhase::Unconfigured],
            mounted_devices: Vec::new(),
            failure: None,
        })
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn history(&self) -> &[LifecyclePhase] {
        &self.history
    }

    /// Record that the test body failed. Teardown skips the exit scrub of a failed run.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.failure.get_or_insert(reason.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn filesystem(&self) -> FilesystemDriver {
        FilesystemDriver::new(
            self.manager.clone(),
            self.cluster.ids_of_type(RoleType::Mds),
            self.cluster.osd_ids().len(),
        )
    }

    /// A fuse mount for a client role. The mount is not made until `ClientMount::mount`.
    pub fn client_mount(&self, client_id: &str) -> Result<ClientMount> {
        let role = Role::new(RoleType::Client, client_id);
        let host = self.cluster.host_of(&role)?;
        Ok(ClientMount::new(
            self.manager.clone(),
            client_id,
            host,
            &self.config.cluster.test_dir,
        ))
    }

    fn advance(&mut self, next: LifecyclePhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(Error::InvalidPhase {
                from: self.phase,
                to: next,
            });
        }
        info!("cluster: {} -> {next}", self.phase);
        self.phase = next;
        self.history.push(next);
        Ok(())
    }

    async fn run_on(&self, host: &str, opts: RunOptions) -> Result<String> {
        Ok(self.executor.run(host, opts).await?.stdout)
    }

    /// A command prefixed with the coverage wrappers, run with sudo.
    fn tool<S: AsRef<str>>(&self, program: &str, args: &[S]) -> RunOptions {
        RunOptions::new(self.manager.wrapped(program, args))
    }

    /// Provision every host and start the daemons in order, ending in `Healthy`.
    ///
    /// On error the cluster is left in the phase that failed; the caller is expected to call
    /// [`LiveCluster::tear_down`].
    pub async fn bring_up(&mut self) -> Result<()> {
        self.advance(LifecyclePhase::Provisioning)?;
        self.config.validate()?;
        self.provision().await?;

        self.advance(LifecyclePhase::StartingMonitors)?;
        self.registry.start_type(RoleType::Mon).await?;
        let mons = self.cluster.ids_of_type(RoleType::Mon);
        self.manager.wait_for_quorum(&mons, None).await?;

        self.advance(LifecyclePhase::StartingOsds)?;
        self.registry.start_type(RoleType::Osd).await?;
        let num_osds = self.cluster.osd_ids().len();
        if num_osds > 0 {
            self.manager
                .set_crush_tunables(&self.config.cluster.crush_tunables)
                .await?;
            self.manager.wait_until_osds_up(num_osds, None).await?;
        }

        let mds_count = self.cluster.active_mds_count();
        if !self.cluster.ids_of_type(RoleType::Mds).is_empty() {
            self.filesystem().create().await?;
            if mds_count > 0 {
                self.manager.set_max_mds(mds_count as u32).await?;
            }
        }

        self.advance(LifecyclePhase::StartingMds)?;
        self.registry.start_type(RoleType::Mds).await?;

        self.advance(LifecyclePhase::Converging)?;
        if self.config.cluster.wait_for_healthy {
            self.manager.wait_until_osds_up(num_osds, None).await?;
            self.manager.wait_until_healthy(None).await?;
        }

        self.advance(LifecyclePhase::Healthy)?;
        Ok(())
    }

    async fn provision(&mut self) -> Result<()> {
        let opts = &self.config.cluster;
        let hosts = self.cluster.hostnames();
        let test_dir = opts.test_dir.clone();
        let keyring = opts.keyring_path.clone();
        let (first_mon, mon_host) = self.cluster.first_mon()?;
        let mon_host = mon_host.to_string();
        debug!("first monitor is {first_mon} on {mon_host}");

        info!("creating test directories...");
        run_on_all(
            self.executor.as_ref(),
            &hosts,
            RunOptions::new([
                "mkdir".to_string(),
                "-p".to_string(),
                format!("{test_dir}/data"),
                "/var/run/ceph".to_string(),
                "/var/log/ceph".to_string(),
                opts.coverage_dir(),
            ])
            .sudo(),
        )
        .await?;

        info!("generating monitor keyring...");
        self.run_on(
            &mon_host,
            self.tool(
                "ceph-authtool",
                &["--create-keyring", "--gen-key", "--name=mon.", &keyring],
            ),
        )
        .await?;
        self.run_on(&mon_host, RunOptions::new(["chmod", "0644", &keyring]).sudo())
            .await?;

        info!("creating monmap on {mon_host}...");
        let monmap = format!("{test_dir}/monmap");
        let mut monmap_args = vec![
            "--create".to_string(),
            "--clobber".to_string(),
        ];
        for (id, addr) in self.cluster.mon_addrs() {
            monmap_args.extend(["--add".to_string(), id, addr]);
        }
        monmap_args.extend([
            "--fsid".to_string(),
            self.cluster.fsid.to_string(),
            monmap.clone(),
        ]);
        self.run_on(&mon_host, self.tool("monmaptool", &monmap_args))
            .await?;
        self.copy_binary(&mon_host, &monmap, &hosts).await?;

        info!("writing {} to every host...", opts.conf_path);
        run_on_all(
            self.executor.as_ref(),
            &hosts,
            RunOptions::new(["tee", &opts.conf_path])
                .sudo()
                .stdin(self.cluster.render_conf()),
        )
        .await?;

        info!("generating admin key...");
        self.run_on(
            &mon_host,
            self.tool(
                "ceph-authtool",
                &[
                    "--gen-key",
                    "--name=client.admin",
                    "--set-uid=0",
                    "--cap",
                    "mon",
                    "allow *",
                    "--cap",
                    "osd",
                    "allow *",
                    "--cap",
                    "mds",
                    "allow",
                    &keyring,
                ],
            ),
        )
        .await?;
        self.distribute_keyring(&mon_host, &hosts).await?;

        let num_osds = self.cluster.osd_ids().len();
        info!("creating osdmap for {num_osds} osds on the monitor hosts...");
        run_on_all(
            self.executor.as_ref(),
            &self.cluster.hosts_with(RoleType::Mon),
            self.tool(
                "osdmaptool",
                &[
                    "--clobber".to_string(),
                    "--createsimple".to_string(),
                    num_osds.to_string(),
                    format!("{test_dir}/osdmap"),
                    "--pg_bits".to_string(),
                    "2".to_string(),
                    "--pgp_bits".to_string(),
                    "4".to_string(),
                ],
            ),
        )
        .await?;

        info!("setting up mds and client keys...");
        let keyed: Vec<(Role, String)> = self
            .cluster
            .roles()
            .filter(|(r, _)| matches!(r.kind, RoleType::Mds | RoleType::Client))
            .map(|(r, h)| (r.clone(), h.to_string()))
            .collect();
        for (role, host) in keyed.iter() {
            if role.kind == RoleType::Mds {
                self.run_on(host, RunOptions::new(["mkdir", "-p", &data_dir(role)]).sudo())
                    .await?;
            }
            let path = keyring_for(role);
            self.run_on(
                host,
                self.tool(
                    "ceph-authtool",
                    &[
                        "--create-keyring".to_string(),
                        "--gen-key".to_string(),
                        format!("--name={role}"),
                        path.clone(),
                    ],
                ),
            )
            .await?;
            self.run_on(host, RunOptions::new(["chmod", "0644", &path]).sudo())
                .await?;
        }

        info!("running mkfs on osd nodes...");
        let osds: Vec<(Role, String)> = self
            .cluster
            .roles()
            .filter(|(r, _)| r.kind == RoleType::Osd)
            .map(|(r, h)| (r.clone(), h.to_string()))
            .collect();
        for (role, host) in osds.iter() {
            self.provision_osd(role, host).await?;
        }

        info!("collecting daemon keys...");
        let mut keys = String::new();
        for (role, host) in osds.iter().chain(keyed.iter()) {
            keys.push_str(
                &self
                    .run_on(host, RunOptions::new(["cat", &keyring_for(role)]).sudo())
                    .await?,
            );
        }
        self.run_on(
            &mon_host,
            RunOptions::new(["tee", "-a", &keyring]).sudo().stdin(keys),
        )
        .await?;
        for (role, _) in osds.iter().chain(keyed.iter()) {
            let mut args = vec![keyring.clone(), format!("--name={role}")];
            args.extend(caps_for(role.kind).iter().map(|s| s.to_string()));
            self.run_on(&mon_host, self.tool("ceph-authtool", &args)).await?;
        }
        self.distribute_keyring(&mon_host, &hosts).await?;

        info!("running mkfs on mon nodes...");
        let mons: Vec<(Role, String)> = self
            .cluster
            .roles()
            .filter(|(r, _)| r.kind == RoleType::Mon)
            .map(|(r, h)| (r.clone(), h.to_string()))
            .collect();
        for (role, host) in mons.iter() {
            self.run_on(host, RunOptions::new(["mkdir", "-p", &data_dir(role)]).sudo())
                .await?;
            self.run_on(
                host,
                self.tool(
                    "ceph-mon",
                    &[
                        "--mkfs".to_string(),
                        "-i".to_string(),
                        role.id.clone(),
                        "--monmap".to_string(),
                        format!("{test_dir}/monmap"),
                        "--osdmap".to_string(),
                        format!("{test_dir}/osdmap"),
                        "--keyring".to_string(),
                        keyring.clone(),
                    ],
                ),
            )
            .await?;
        }
        run_on_all(
            self.executor.as_ref(),
            &hosts,
            RunOptions::new([
                "rm".to_string(),
                "-f".to_string(),
                "--".to_string(),
                format!("{test_dir}/monmap"),
                format!("{test_dir}/osdmap"),
            ])
            .sudo(),
        )
        .await?;

        self.register_daemons().await
    }

    /// Copy a binary file from `from` to every other host. It travels base64 encoded, since
    /// command output is text.
    async fn copy_binary(&self, from: &str, path: &str, hosts: &[String]) -> Result<()> {
        let encoded = self
            .run_on(from, RunOptions::new(["base64", "-w0", "--", path]).sudo())
            .await?;
        let others: Vec<String> = hosts.iter().filter(|h| *h != from).cloned().collect();
        run_on_all(
            self.executor.as_ref(),
            &others,
            RunOptions::new(["sh".to_string(), "-c".to_string(), format!("base64 -d > {path}")])
                .sudo()
                .stdin(encoded),
        )
        .await?;
        Ok(())
    }

    /// Copy the keyring from the first monitor to every other host.
    async fn distribute_keyring(&self, mon_host: &str, hosts: &[String]) -> Result<()> {
        let keyring = &self.config.cluster.keyring_path;
        let contents = self
            .run_on(mon_host, RunOptions::new(["cat", keyring]).sudo())
            .await?;
        let others: Vec<String> = hosts.iter().filter(|h| *h != mon_host).cloned().collect();
        run_on_all(
            self.executor.as_ref(),
            &others,
            RunOptions::new(["tee", keyring]).sudo().stdin(contents),
        )
        .await?;
        run_on_all(
            self.executor.as_ref(),
            &others,
            RunOptions::new(["chmod", "0644", keyring]).sudo(),
        )
        .await?;
        Ok(())
    }

    async fn provision_osd(&mut self, role: &Role, host: &str) -> Result<()> {
        let dir = data_dir(role);
        self.run_on(host, RunOptions::new(["mkdir", "-p", &dir]).sudo())
            .await?;

        let device = self
            .cluster
            .device_for(&role.id)
            .map(|(_, dev)| dev.to_string());
        if let (Some(fs), Some(dev)) = (self.config.cluster.fs.clone(), device) {
            let mkfs_opts = self
                .config
                .cluster
                .mkfs_options
                .clone()
                .unwrap_or_else(|| default_mkfs_options(&fs));
            let mount_opts = self
                .config
                .cluster
                .mount_options
                .clone()
                .unwrap_or_else(|| default_mount_options(&fs));

            info!("{role}: mkfs.{fs} on {dev} on {host}");
            let mut args = vec!["mkfs".to_string(), "-t".to_string(), fs.clone()];
            args.extend(mkfs_opts);
            args.push(dev.clone());
            self.run_on(host, RunOptions::new(args).sudo()).await?;

            info!("{role}: mounting {dev} on {dir}");
            self.run_on(
                host,
                RunOptions::new([
                    "mount".to_string(),
                    "-t".to_string(),
                    fs,
                    "-o".to_string(),
                    mount_opts.join(","),
                    dev,
                    dir.clone(),
                ])
                .sudo(),
            )
            .await?;
            self.mounted_devices.push((host.to_string(), dir.clone()));
        }

        self.run_on(
            host,
            self.tool(
                "ceph-osd",
                &[
                    "--mkfs".to_string(),
                    "--mkkey".to_string(),
                    "-i".to_string(),
                    role.id.clone(),
                    "--monmap".to_string(),
                    format!("{}/monmap", self.config.cluster.test_dir),
                ],
            ),
        )
        .await?;
        Ok(())
    }

    /// Register a handle for every daemon role in the config. Nothing is started.
    pub async fn register_daemons(&mut self) -> Result<()> {
        let signal = self.config.cluster.daemon_signal();
        let coverage = self.config.cluster.coverage_dir();
        for kind in RoleType::DAEMONS {
            let roles: Vec<(Role, String)> = self
                .cluster
                .roles()
                .filter(|(r, _)| r.kind == kind)
                .map(|(r, h)| (r.clone(), h.to_string()))
                .collect();
            for (role, host) in roles {
                let launch = LaunchSpec::ceph_daemon(&role, signal, &coverage);
                self.registry
                    .add(role, &host, launch, Arc::clone(&self.executor))
                    .await?;
            }
        }
        Ok(())
    }

    /// Restart daemons selected by role patterns, then optionally wait for the cluster.
    pub async fn restart_daemons(&mut self, patterns: Option<&[String]>, opts: RestartOptions) -> Result<()> {
        let roles = self.registry.resolve(patterns, &RoleType::DAEMONS)?;
        self.registry.restart_roles(&roles).await?;
        let num_osds = self.cluster.osd_ids().len();
        if opts.wait_for_healthy {
            self.manager.wait_until_osds_up(num_osds, None).await?;
            self.manager.wait_until_healthy(None).await?;
        }
        if opts.wait_for_osds_up {
            self.manager.wait_until_osds_up(num_osds, None).await?;
        }
        Ok(())
    }

    pub async fn stop_daemons(&mut self, patterns: Option<&[String]>) -> Result<()> {
        let roles = self.registry.resolve(patterns, &RoleType::DAEMONS)?;
        self.registry.stop_roles(&roles).await
    }

    /// Wait for the selected daemons to die on their own. A clean exit is a failure here.
    pub async fn wait_for_failure(&mut self, patterns: Option<&[String]>, timeout: Option<Duration>) -> Result<()> {
        let roles = self.registry.resolve(patterns, &RoleType::DAEMONS)?;
        self.registry.wait_for_failure(&roles, timeout).await
    }

    /// Take the cluster apart. Never fails: every step's error is logged and collected, and the
    /// remaining steps still run. A second call does nothing.
    pub async fn tear_down(&mut self) -> TeardownReport {
        if matches!(
            self.phase,
            LifecyclePhase::TearingDown | LifecyclePhase::Terminated
        ) {
            return TeardownReport {
                already_torn_down: true,
                ..Default::default()
            };
        }

        let scrub = self.phase == LifecyclePhase::Healthy
            && self.failure.is_none()
            && self.config.cluster.wait_for_scrub
            && !self.cluster.osd_ids().is_empty();
        let was_provisioned = self.phase != LifecyclePhase::Unconfigured;
        let mut report = TeardownReport::default();
        if let Err(e) = self.advance(LifecyclePhase::TearingDown) {
            record(&mut report, "enter teardown", e);
        }

        if scrub {
            if let Err(e) = self.osd_scrub_pgs().await {
                record(&mut report, "scrub", e);
            }
        }

        for kind in [RoleType::Mds, RoleType::Osd, RoleType::Mon] {
            for e in self.registry.stop_type(kind, STOP_TIMEOUT).await {
                record(&mut report, &format!("stop {kind} daemons"), e);
            }
        }

        if was_provisioned {
            match self.scan_log().await {
                Ok(found) => report.log_failure = found,
                Err(e) => record(&mut report, "scan cluster log", e),
            }
        }
        if let Some(reason) = &report.log_failure {
            error!("found errors in cluster log: {reason}");
        }

        for (host, dir) in std::mem::take(&mut self.mounted_devices) {
            info!("unmounting {dir} on {host}");
            if let Err(e) = self
                .run_on(&host, RunOptions::new(["umount", &dir]).sudo())
                .await
            {
                record(&mut report, &format!("unmount {dir} on {host}"), e);
            }
        }

        let failed = self.failure.is_some() || report.log_failure.is_some();
        if let Some(archive) = self.config.cluster.archive.clone() {
            if was_provisioned && (failed || !self.config.cluster.archive_on_error) {
                if let Err(e) = self.archive(&archive).await {
                    record(&mut report, "archive", e);
                }
            }
        }

        if was_provisioned {
            for e in self.purge().await {
                record(&mut report, "purge", e);
            }
        }

        if let Err(e) = self.advance(LifecyclePhase::Terminated) {
            record(&mut report, "finish teardown", e);
        }
        report
    }

    /// Wait for all PGs to be clean, deep-scrub every OSD, then wait for every scrub stamp to
    /// move past the moment scrubbing was requested. Gives up quietly when progress stalls.
    async fn osd_scrub_pgs(&self) -> Result<()> {
        let retries = self.config.cluster.deep_scrub_retries.max(1);
        let clean = PollPolicy::new(SCRUB_POLL, SCRUB_POLL * retries)
            .until("all pgs active+clean before scrub", || async {
                let stats = self.manager.get_pg_stats().await?;
                Ok(stats.iter().all(|pg| pg.is_clean()))
            })
            .await;
        match clean {
            Err(e) if e.is_timeout() => {
                info!("scrubbing terminated: not all pgs were active and clean");
                return Ok(());
            }
            other => other?,
        };

        let check_time = chrono::Local::now().naive_local();
        tokio::time::sleep(Duration::from_secs(1)).await;
        for osd in self.cluster.osd_ids() {
            self.manager.deep_scrub_osd(&Role::osd(osd)).await?;
        }

        let prev_good = Cell::new(0usize);
        let gap = Cell::new(0u32);
        let (all_scrubbed, _) = PollPolicy::unbounded(SCRUB_POLL)
            .run("pg scrub stamps", || async {
                let stats = self.manager.get_pg_stats().await?;
                let scrubbed = stats
                    .iter()
                    .filter(|pg| {
                        chrono::NaiveDateTime::parse_from_str(
                            &pg.last_scrub_stamp,
                            "%Y-%m-%d %H:%M:%S%.f",
                        )
                        .map(|stamp| stamp > check_time)
                        .unwrap_or(false)
                    })
                    .count();
                if scrubbed == stats.len() {
                    return Ok(Check::Done(true));
                }
                if scrubbed > prev_good.get() {
                    prev_good.set(scrubbed);
                    gap.set(0);
                } else {
                    gap.set(gap.get() + 1);
                    if gap.get() > retries {
                        return Ok(Check::Done(false));
                    }
                }
                info!("still waiting for all pgs to be scrubbed");
                Ok(Check::Pending(format!("{scrubbed}/{} scrubbed", stats.len())))
            })
            .await?;
        if !all_scrubbed {
            info!("exiting scrub checking: not all pgs scrubbed");
        }
        Ok(())
    }

    async fn scan_log(&self) -> Result<Option<String>> {
        info!("checking cluster log for badness...");
        let whitelist = self
            .config
            .cluster
            .log_whitelist
            .iter()
            .map(|p| Regex::new(p).map_err(|e| Error::config(format!("invalid log_whitelist pattern '{p}': {e}"))))
            .collect::<Result<Vec<_>>>()?;
        let out = self
            .executor
            .run(
                self.manager.admin_host(),
                RunOptions::new(["egrep", r"\[ERR\]|\[WRN\]|\[SEC\]", CLUSTER_LOG])
                    .sudo()
                    .unchecked(),
            )
            .await?;
        match out.exit_status {
            0 => Ok(scan_cluster_log(out.stdout.lines(), &whitelist)),
            // No match at all.
            1 => Ok(None),
            code => Err(Error::RemoteCommand {
                host: self.manager.admin_host().to_string(),
                args: vec!["egrep".to_string(), CLUSTER_LOG.to_string()],
                exit_status: code,
            }),
        }
    }

    async fn archive(&self, dest: &Path) -> Result<()> {
        info!("archiving logs and mon data to {}", dest.display());
        std::fs::create_dir_all(dest)?;
        let log = self
            .run_on(
                self.manager.admin_host(),
                RunOptions::new(["cat", CLUSTER_LOG]).sudo(),
            )
            .await?;
        std::fs::write(dest.join("ceph.log"), log)?;

        let archive_dir = format!("{}/archive/data", self.config.cluster.test_dir);
        for (role, host) in self.cluster.roles().filter(|(r, _)| r.kind == RoleType::Mon) {
            self.run_on(host, RunOptions::new(["mkdir", "-p", &archive_dir]).sudo())
                .await?;
            self.run_on(
                host,
                RunOptions::new([
                    "tar".to_string(),
                    "czf".to_string(),
                    format!("{archive_dir}/{role}.tgz"),
                    "-C".to_string(),
                    data_dir(role),
                    "--".to_string(),
                    ".".to_string(),
                ])
                .sudo(),
            )
            .await?;
        }
        Ok(())
    }

    /// Remove config, keyrings and daemon data from every host.
    async fn purge(&self) -> Vec<Error> {
        let opts = &self.config.cluster;
        let futures = self.cluster.hosts().iter().map(|host| {
            let mut args = vec![
                "rm".to_string(),
                "-rf".to_string(),
                "--".to_string(),
                opts.conf_path.clone(),
                opts.keyring_path.clone(),
                format!("{}/data", opts.test_dir),
                format!("{}/monmap", opts.test_dir),
            ];
            for role in host.roles.iter() {
                match role.kind {
                    RoleType::Client => args.push(keyring_for(role)),
                    _ => args.push(data_dir(role)),
                }
            }
            self.executor
                .run(&host.hostname, RunOptions::new(args).sudo())
        });
        futures::future::join_all(futures)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect()
    }
}

fn record(report: &mut TeardownReport, step: &str, e: Error) {
    warn!("teardown step '{step}' failed: {e}");
    report.errors.push(format!("{step}: {e}"));
}

/// Owns the configuration and executor a cluster is built from.
#[derive(Debug, Clone)]
pub struct ClusterLifecycle {
    config: Config,
    executor: Arc<dyn RemoteExecutor>,
}

impl ClusterLifecycle {
    pub fn new(config: Config, executor: Arc<dyn RemoteExecutor>) -> Self {
        ClusterLifecycle { config, executor }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate the configuration without touching any host.
    pub fn prepare(&self) -> Result<()> {
        self.config.validate()
    }

    /// Bring a cluster up to `Healthy`. If that fails, the partial cluster is torn down before
    /// the error is returned.
    pub async fn bring_up(&self) -> Result<LiveCluster> {
        self.prepare()?;
        let mut live = LiveCluster::new(self.config.clone(), Arc::clone(&self.executor))?;
        if let Err(e) = live.bring_up().await {
            error!("bring-up failed in phase {}: {e}", live.phase());
            live.mark_failed(e.to_string());
            let report = live.tear_down().await;
            for step in report.errors {
                warn!("{step}");
            }
            return Err(e);
        }
        Ok(live)
    }

    /// Bring a cluster up, run `body` against it, and tear it down on every exit path.
    ///
    /// The body is written as `|cluster| Box::pin(async move { ... })`.
    pub async fn run<F>(&self, body: F) -> RunSummary
    where
        F: for<'a> FnOnce(&'a mut LiveCluster) -> LocalBoxFuture<'a, Result<()>>,
    {
        if let Err(e) = self.prepare() {
            error!("invalid configuration: {e}");
            return RunSummary {
                success: false,
                failure_reason: Some(e.to_string()),
                teardown_errors: Vec::new(),
                phases: vec![LifecyclePhase::Unconfigured],
            };
        }
        let mut live = match LiveCluster::new(self.config.clone(), Arc::clone(&self.executor)) {
            Ok(live) => live,
            Err(e) => {
                return RunSummary {
                    success: false,
                    failure_reason: Some(e.to_string()),
                    teardown_errors: Vec::new(),
                    phases: vec![LifecyclePhase::Unconfigured],
                }
            }
        };

        let result = match live.bring_up().await {
            Ok(()) => body(&mut live).await,
            Err(e) => {
                error!("bring-up failed in phase {}: {e}", live.phase());
                Err(e)
            }
        };
        if let Err(e) = result {
            error!("run failed: {e}");
            live.mark_failed(e.to_string());
        }

        let report = live.tear_down().await;
        let failure_reason = report.log_failure.or_else(|| live.failure.clone());
        RunSummary {
            success: failure_reason.is_none(),
            failure_reason,
            teardown_errors: report.errors,
            phases: live.history.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order() {
        use LifecyclePhase::*;

        let order = [
            Unconfigured,
            Provisioning,
            StartingMonitors,
            StartingOsds,
            StartingMds,
            Converging,
            Healthy,
            TearingDown,
            Terminated,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Unconfigured.can_advance_to(StartingOsds));
        assert!(!Healthy.can_advance_to(Provisioning));
        assert!(StartingOsds.can_advance_to(TearingDown));
        assert!(!TearingDown.can_advance_to(TearingDown));
        assert!(!Terminated.can_advance_to(TearingDown));
    }

    #[test]
    fn log_scan_prefers_most_severe() {
        let log = [
            "2015-01-01 mon.0 [INF] osdmap e3",
            "2015-01-01 osd.1 [WRN] slow request",
            "2015-01-01 osd.0 [ERR] 1.2 missing primary copy",
            "2015-01-01 mon.0 [ERR] second error",
        ];
        assert_eq!(
            scan_cluster_log(log, &[]),
            Some("\"2015-01-01 osd.0 [ERR] 1.2 missing primary copy\" in cluster log".to_string())
        );

        let security = ["a [WRN] w", "b [SEC] s", "c [ERR] e"];
        assert_eq!(
            scan_cluster_log(security, &[]),
            Some("\"b [SEC] s\" in cluster log".to_string())
        );
    }

    #[test]
    fn log_scan_honours_whitelist() {
        let whitelist = [
            Regex::new("slow request").unwrap(),
            Regex::new(r"missing primary").unwrap(),
        ];
        let log = [
            "osd.1 [WRN] slow request",
            "osd.0 [ERR] 1.2 missing primary copy",
        ];
        assert_eq!(scan_cluster_log(log, &whitelist), None);

        let log = ["osd.1 [WRN] slow request", "osd.1 [WRN] clock skew"];
        assert_eq!(
            scan_cluster_log(log, &whitelist),
            Some("\"osd.1 [WRN] clock skew\" in cluster log".to_string())
        );
    }

    #[test]
    fn caps_and_keyrings() {
        assert_eq!(
            keyring_for(&Role::new(RoleType::Client, "0")),
            "/etc/ceph/ceph.client.0.keyring"
        );
        assert_eq!(keyring_for(&Role::mds("a")), "/var/lib/ceph/mds/ceph-a/keyring");
        assert!(caps_for(RoleType::Osd).contains(&"allow profile osd"));
        assert_eq!(default_mount_options("xfs"), vec!["noatime", "inode64"]);
    }
}
