// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::{Error, Result},
    role::{Role, RoleType},
};

/// Config is the model for a test cluster used in the cephqa configuration file. The config
/// file is deserialized into a Config object.
///
/// As with the cluster model, the file format is decoupled from [`crate::cluster::Cluster`],
/// which is what the lifecycle actually works with once provisioning starts.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub cluster: ClusterOptions,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub recovery: RecoveryTolerance,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Host {
    pub hostname: String,
    pub roles: Vec<Role>,
    /// Block devices on this host that OSDs may format and mount when `cluster.fs` is set.
    #[serde(default)]
    pub scratch_devices: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterOptions {
    /// Extra `ceph.conf` options, by section (`global`, `osd`, `mds.a`, ...).
    #[serde(deserialize_with = "conf_sections")]
    pub conf: BTreeMap<String, BTreeMap<String, String>>,
    /// Regexes for cluster-log lines that should not fail the run.
    pub log_whitelist: Vec<String>,
    /// Filesystem to create on OSD scratch devices. Without it, OSDs use directories.
    pub fs: Option<String>,
    pub mkfs_options: Option<Vec<String>>,
    pub mount_options: Option<Vec<String>>,
    pub conf_path: String,
    pub keyring_path: String,
    pub test_dir: String,
    /// Local directory that receives the cluster log and mon data at teardown.
    pub archive: Option<PathBuf>,
    /// Only archive when the run failed.
    pub archive_on_error: bool,
    pub wait_for_healthy: bool,
    pub wait_for_scrub: bool,
    pub deep_scrub_retries: u32,
    pub crush_tunables: String,
    /// Daemons run under coverage instrumentation, so they are stopped with SIGTERM instead of
    /// SIGKILL.
    pub coverage: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            conf: BTreeMap::new(),
            log_whitelist: Vec::new(),
            fs: None,
            mkfs_options: None,
            mount_options: None,
            conf_path: "/etc/ceph/ceph.conf".to_string(),
            keyring_path: "/etc/ceph/ceph.keyring".to_string(),
            test_dir: "/home/ubuntu/cephtest".to_string(),
            archive: None,
            archive_on_error: false,
            wait_for_healthy: true,
            wait_for_scrub: true,
            deep_scrub_retries: 12,
            crush_tunables: "default".to_string(),
            coverage: false,
        }
    }
}

impl ClusterOptions {
    pub fn coverage_dir(&self) -> String {
        format!("{}/archive/coverage", self.test_dir)
    }

    pub fn daemon_signal(&self) -> &'static str {
        if self.coverage {
            "term"
        } else {
            "kill"
        }
    }
}

/// Poll bounds, in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    pub healthy: u64,
    pub clean: u64,
    pub quorum: u64,
    pub osds_up: u64,
    pub mds: u64,
    pub mount: u64,
    /// Interval for health and placement-group polls.
    pub poll_interval: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            healthy: 900,
            clean: 1200,
            quorum: 300,
            osds_up: 300,
            mds: 120,
            mount: 60,
            poll_interval: 5,
        }
    }
}

impl Timeouts {
    pub fn healthy(&self) -> Duration {
        Duration::from_secs(self.healthy)
    }

    pub fn clean(&self) -> Duration {
        Duration::from_secs(self.clean)
    }

    pub fn quorum(&self) -> Duration {
        Duration::from_secs(self.quorum)
    }

    pub fn osds_up(&self) -> Duration {
        Duration::from_secs(self.osds_up)
    }

    pub fn mds(&self) -> Duration {
        Duration::from_secs(self.mds)
    }

    pub fn mount(&self) -> Duration {
        Duration::from_secs(self.mount)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

/// How far a measured recovery time may stray from the configured timeout that drives it.
///
/// A recovery bounded by `timeout` passes when it took between `lower_factor * timeout` and
/// `upper_factor * timeout`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RecoveryTolerance {
    pub lower_factor: f64,
    pub upper_factor: f64,
}

impl Default for RecoveryTolerance {
    fn default() -> Self {
        RecoveryTolerance {
            lower_factor: 0.5,
            upper_factor: 2.0,
        }
    }
}

impl RecoveryTolerance {
    pub fn lower(&self, timeout: Duration) -> Duration {
        timeout.mul_f64(self.lower_factor)
    }

    pub fn upper(&self, timeout: Duration) -> Duration {
        timeout.mul_f64(self.upper_factor)
    }

    pub fn contains(&self, timeout: Duration, measured: Duration) -> bool {
        self.lower(timeout) <= measured && measured <= self.upper(timeout)
    }
}

/// Accept plain TOML scalars as config values; `ceph.conf` only knows strings.
fn conf_sections<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, BTreeMap<String, toml::Value>>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(section, options)| {
            let options = options
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        toml::Value::String(s) => s,
                        toml::Value::Integer(i) => i.to_string(),
                        toml::Value::Float(f) => f.to_string(),
                        toml::Value::Boolean(b) => b.to_string(),
                        other => {
                            return Err(serde::de::Error::custom(format!(
                                "unsupported value for [{section}] {key}: {other}"
                            )))
                        }
                    };
                    Ok((key, value))
                })
                .collect::<std::result::Result<_, _>>()?;
            Ok((section, options))
        })
        .collect()
}

const SUPPORTED_FS: [&str; 4] = ["xfs", "btrfs", "ext4", "ext3"];

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("could not open config file \"{}\": {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// All roles in the order they appear in the file, with their host.
    pub fn roles(&self) -> impl Iterator<Item = (&Role, &str)> {
        self.hosts
            .iter()
            .flat_map(|h| h.roles.iter().map(move |r| (r, h.hostname.as_str())))
    }

    pub fn roles_of_type(&self, kind: RoleType) -> impl Iterator<Item = (&Role, &str)> {
        self.roles().filter(move |(r, _)| r.kind == kind)
    }

    /// Check everything that can be checked without touching a host.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::config("no hosts configured"));
        }

        let mut hostnames = BTreeSet::new();
        for host in &self.hosts {
            if host.hostname.is_empty() {
                return Err(Error::config("host with empty hostname"));
            }
            if !hostnames.insert(host.hostname.as_str()) {
                return Err(Error::config(format!(
                    "host '{}' is listed more than once",
                    host.hostname
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for (role, host) in self.roles() {
            if !seen.insert(role) {
                return Err(Error::config(format!(
                    "role {role} is assigned more than once (again on {host})"
                )));
            }
            if role.kind == RoleType::Osd && role.id.parse::<u32>().is_err() {
                return Err(Error::config(format!("osd id must be numeric: {role}")));
            }
        }

        if self.roles_of_type(RoleType::Mon).next().is_none() {
            return Err(Error::config("at least one mon role is required"));
        }
        if self.roles_of_type(RoleType::Mds).next().is_some()
            && self.roles_of_type(RoleType::Osd).next().is_none()
        {
            return Err(Error::config("mds roles need at least one osd to back their pools"));
        }

        for pattern in &self.cluster.log_whitelist {
            regex::Regex::new(pattern).map_err(|e| {
                Error::config(format!("invalid log_whitelist pattern '{pattern}': {e}"))
            })?;
        }

        if let Some(fs) = &self.cluster.fs {
            if !SUPPORTED_FS.contains(&fs.as_str()) {
                return Err(Error::config(format!(
                    "unsupported osd filesystem '{fs}', expected one of {SUPPORTED_FS:?}"
                )));
            }
            for host in &self.hosts {
                let osds = host.roles.iter().filter(|r| r.kind == RoleType::Osd).count();
                if osds > host.scratch_devices.len() {
                    return Err(Error::config(format!(
                        "host '{}' has {osds} osds but only {} scratch devices",
                        host.hostname,
                        host.scratch_devices.len()
                    )));
                }
            }
        }

        let t = &self.timeouts;
        if [t.healthy, t.clean, t.quorum, t.osds_up, t.mds, t.mount, t.poll_interval].contains(&0) {
            return Err(Error::config("timeouts must be non-zero"));
        }

        let r = &self.recovery;
        if !(r.lower_factor > 0.0 && r.lower_factor < r.upper_factor) {
            return Err(Error::config(format!(
                "recovery tolerance needs 0 < lower_factor < upper_factor, got {} and {}",
                r.lower_factor, r.upper_factor
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[hosts]]
hostname = "node0"
roles = ["mon.a", "osd.0", "osd.1", "mds.a"]
scratch_devices = ["/dev/sdb", "/dev/sdc"]

[[hosts]]
hostname = "node1"
roles = ["mon.b", "osd.2", "client.0"]
scratch_devices = ["/dev/sdb"]

[cluster]
log_whitelist = ["wrongly marked me down"]
fs = "xfs"

[cluster.conf.osd]
osd_min_pg_log_entries = 1
"filestore xattr use omap" = true

[timeouts]
healthy = 60
"#;

    #[test]
    fn parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[0].roles[1], Role::osd(0));
        assert_eq!(config.cluster.conf["osd"]["osd_min_pg_log_entries"], "1");
        assert_eq!(config.cluster.conf["osd"]["filestore xattr use omap"], "true");
        assert_eq!(config.timeouts.healthy, 60);
        assert_eq!(config.timeouts.mds, 120);
        assert_eq!(config.cluster.keyring_path, "/etc/ceph/ceph.keyring");
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_toml("[[hosts]]\nhostname = \"a\"\nroles = []\nzpools = []\n");
        assert!(matches!(err, Err(Error::Toml(_))));
    }

    #[test]
    fn validation_errors() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.hosts[1].roles.push(Role::osd(0));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.hosts[1].scratch_devices.clear();
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.cluster.log_whitelist.push("(unclosed".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.recovery.lower_factor = 3.0;
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(SAMPLE).unwrap();
        for host in config.hosts.iter_mut() {
            host.roles.retain(|r| r.kind != RoleType::Mon);
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn recovery_window() {
        let tolerance = RecoveryTolerance::default();
        let timeout = Duration::from_secs(45);
        assert!(tolerance.contains(timeout, Duration::from_secs(45)));
        assert!(tolerance.contains(timeout, Duration::from_secs(23)));
        assert!(!tolerance.contains(timeout, Duration::from_secs(22)));
        assert!(!tolerance.contains(timeout, Duration::from_secs(91)));
    }
}
