// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, fmt::Write};

use uuid::Uuid;

use crate::{
    config::Config,
    error::{Error, Result},
    role::{Role, RoleType},
};

pub type ConfSections = BTreeMap<String, BTreeMap<String, String>>;

const MON_PORT: u16 = 6789;

/// Cluster is the in-memory model of a test cluster: which roles live on which host, the
/// generated identity, the generated configuration, and which scratch device backs each OSD.
///
/// The role assignment is copied out of the config when the model is built and never changes
/// afterwards.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub fsid: Uuid,
    conf: ConfSections,
    hosts: Vec<ClusterHost>,
}

#[derive(Debug, Clone)]
pub struct ClusterHost {
    pub hostname: String,
    pub roles: Vec<Role>,
    /// OSD id to the scratch device it was given. OSDs without one keep their data in a
    /// directory.
    pub devices: BTreeMap<String, String>,
}

impl ClusterHost {
    pub fn has_type(&self, kind: RoleType) -> bool {
        self.roles.iter().any(|r| r.kind == kind)
    }
}

/// Settings every test cluster starts from. User overrides are merged on top.
fn skeleton() -> ConfSections {
    let sections: &[(&str, &[(&str, &str)])] = &[
        (
            "global",
            &[
                ("chdir", "\"\""),
                ("pid file", "/var/run/ceph/$cluster-$name.pid"),
                ("auth supported", "cephx"),
                ("filestore xattr use omap", "true"),
                ("mon clock drift allowed", ".500"),
                ("osd crush chooseleaf type", "0"),
                ("auth debug", "true"),
                ("ms die on old message", "true"),
                ("mon pg warn min per osd", "3"),
                ("mon pg warn max per osd", "10000"),
                ("osd pool default size", "2"),
            ],
        ),
        (
            "osd",
            &[
                ("osd journal size", "100"),
                ("osd scrub load threshold", "5.0"),
                ("osd scrub max interval", "600"),
                ("osd recover clone overlap", "true"),
                ("osd recovery max chunk", "1048576"),
                ("osd debug op order", "true"),
            ],
        ),
        (
            "mon",
            &[
                ("debug ms", "1"),
                ("debug mon", "20"),
                ("debug paxos", "20"),
                ("mon data avail warn", "10"),
            ],
        ),
        (
            "mds",
            &[
                ("mds debug scatterstat", "true"),
                ("mds verify scatter", "true"),
                ("mds debug frag", "true"),
            ],
        ),
        (
            "client",
            &[
                ("log file", "/var/log/ceph/ceph-$name.$pid.log"),
                ("admin socket", "/var/run/ceph/ceph-$name.$pid.asok"),
            ],
        ),
    ];

    sections
        .iter()
        .map(|(name, values)| {
            let values = values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            (name.to_string(), values)
        })
        .collect()
}

impl Cluster {
    /// Build the cluster model from a validated config: generate an fsid, lay down the config
    /// skeleton with one address per monitor, merge the user's overrides, and hand out scratch
    /// devices to OSDs.
    pub fn from_config(config: &Config) -> Self {
        let fsid = Uuid::new_v4();
        let mut conf = skeleton();

        let mut hosts = Vec::with_capacity(config.hosts.len());
        for host in config.hosts.iter() {
            let mut mon_port = MON_PORT;
            for role in host.roles.iter().filter(|r| r.kind == RoleType::Mon) {
                conf.entry(role.to_string())
                    .or_default()
                    .insert("mon addr".to_string(), format!("{}:{mon_port}", host.hostname));
                mon_port += 1;
            }

            let mut osds: Vec<&Role> = host
                .roles
                .iter()
                .filter(|r| r.kind == RoleType::Osd)
                .collect();
            osds.sort_by_key(|r| r.id.parse::<u32>().unwrap_or(u32::MAX));
            let devices = osds
                .into_iter()
                .zip(host.scratch_devices.iter())
                .map(|(role, dev)| (role.id.clone(), dev.clone()))
                .collect();

            hosts.push(ClusterHost {
                hostname: host.hostname.clone(),
                roles: host.roles.clone(),
                devices,
            });
        }

        for (section, values) in config.cluster.conf.iter() {
            conf.entry(section.clone())
                .or_default()
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        conf.entry("global".to_string())
            .or_default()
            .insert("fsid".to_string(), fsid.to_string());

        Cluster { fsid, conf, hosts }
    }

    pub fn conf(&self) -> &ConfSections {
        &self.conf
    }

    pub fn conf_get(&self, section: &str, key: &str) -> Option<&str> {
        self.conf
            .get(section)
            .and_then(|values| values.get(key))
            .map(String::as_str)
    }

    /// The config in ini form, with `global` first.
    pub fn render_conf(&self) -> String {
        let mut out = String::new();
        let global = self.conf.get_key_value("global");
        let rest = self.conf.iter().filter(|(name, _)| name.as_str() != "global");
        for (name, values) in global.into_iter().chain(rest) {
            let _ = writeln!(out, "[{name}]");
            for (key, value) in values {
                let _ = writeln!(out, "\t{key} = {value}");
            }
            out.push('\n');
        }
        out
    }

    pub fn hosts(&self) -> &[ClusterHost] {
        &self.hosts
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.hostname.clone()).collect()
    }

    /// Hosts carrying at least one role of the given type.
    pub fn hosts_with(&self, kind: RoleType) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.has_type(kind))
            .map(|h| h.hostname.clone())
            .collect()
    }

    pub fn roles(&self) -> impl Iterator<Item = (&Role, &str)> {
        self.hosts
            .iter()
            .flat_map(|h| h.roles.iter().map(move |r| (r, h.hostname.as_str())))
    }

    pub fn role_hosts(&self) -> BTreeMap<Role, String> {
        self.roles()
            .map(|(role, host)| (role.clone(), host.to_string()))
            .collect()
    }

    pub fn host_of(&self, role: &Role) -> Result<&str> {
        self.roles()
            .find(|(r, _)| *r == role)
            .map(|(_, host)| host)
            .ok_or_else(|| Error::not_found("role", role.to_string()))
    }

    /// Ids of every role of a type, sorted.
    pub fn ids_of_type(&self, kind: RoleType) -> Vec<String> {
        let mut ids: Vec<String> = self
            .roles()
            .filter(|(r, _)| r.kind == kind)
            .map(|(r, _)| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn osd_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .roles()
            .filter(|(r, _)| r.kind == RoleType::Osd)
            .filter_map(|(r, _)| r.id.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The monitor with the lowest id. Cluster-wide commands and keyring generation run on its
    /// host.
    pub fn first_mon(&self) -> Result<(Role, &str)> {
        let id = self
            .ids_of_type(RoleType::Mon)
            .into_iter()
            .next()
            .ok_or_else(|| Error::config("cluster has no monitors"))?;
        let role = Role::new(RoleType::Mon, id);
        let host = self.host_of(&role)?;
        Ok((role, host))
    }

    /// Monitor ids with their configured addresses, as given to `monmaptool`.
    pub fn mon_addrs(&self) -> Vec<(String, String)> {
        self.ids_of_type(RoleType::Mon)
            .into_iter()
            .filter_map(|id| {
                let addr = self.conf_get(&format!("mon.{id}"), "mon addr")?;
                Some((id, addr.to_string()))
            })
            .collect()
    }

    /// The scratch device an OSD was given, if any.
    pub fn device_for(&self, osd: &str) -> Option<(&str, &str)> {
        self.hosts.iter().find_map(|h| {
            h.devices
                .get(osd)
                .map(|dev| (h.hostname.as_str(), dev.as_str()))
        })
    }

    /// Number of MDS roles that hold a rank, i.e. those that are not standbys.
    pub fn active_mds_count(&self) -> usize {
        self.roles()
            .filter(|(r, _)| r.kind == RoleType::Mds && !r.is_standby_mds())
            .count()
    }
}

/// Where a daemon keeps its persistent data.
pub fn data_dir(role: &Role) -> String {
    format!("/var/lib/ceph/{}/ceph-{}", role.kind, role.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [[hosts]]
        hostname = "node0"
        roles = ["mon.a", "mon.c", "osd.1", "osd.0", "mds.a"]
        scratch_devices = ["/dev/sdb"]

        [[hosts]]
        hostname = "node1"
        roles = ["mon.b", "osd.2", "mds.b-s", "client.0"]
        scratch_devices = ["/dev/sdb", "/dev/sdc"]

        [cluster.conf.global]
        "osd pool default size" = 3

        [cluster.conf.osd]
        "osd debug op order" = false
    "#;

    fn cluster() -> Cluster {
        Cluster::from_config(&Config::from_toml(CONFIG).unwrap())
    }

    #[test]
    fn mon_addresses_per_host() {
        let cluster = cluster();
        assert_eq!(
            cluster.mon_addrs(),
            vec![
                ("a".to_string(), "node0:6789".to_string()),
                ("b".to_string(), "node1:6789".to_string()),
                ("c".to_string(), "node0:6790".to_string()),
            ]
        );
        let (mon, host) = cluster.first_mon().unwrap();
        assert_eq!(mon.to_string(), "mon.a");
        assert_eq!(host, "node0");
    }

    #[test]
    fn user_overrides_win() {
        let cluster = cluster();
        assert_eq!(cluster.conf_get("global", "osd pool default size"), Some("3"));
        assert_eq!(cluster.conf_get("osd", "osd debug op order"), Some("false"));
        assert_eq!(cluster.conf_get("osd", "osd journal size"), Some("100"));
        assert_eq!(
            cluster.conf_get("global", "fsid"),
            Some(cluster.fsid.to_string().as_str())
        );
    }

    #[test]
    fn render_puts_global_first() {
        let rendered = cluster().render_conf();
        assert!(rendered.starts_with("[global]\n"));
        assert!(rendered.contains("[mon.b]\n\tmon addr = node1:6789\n"));
    }

    #[test]
    fn devices_go_to_lowest_osd_ids() {
        let cluster = cluster();
        assert_eq!(cluster.device_for("0"), Some(("node0", "/dev/sdb")));
        assert_eq!(cluster.device_for("1"), None);
        assert_eq!(cluster.device_for("2"), Some(("node1", "/dev/sdb")));
    }

    #[test]
    fn role_queries() {
        let cluster = cluster();
        assert_eq!(cluster.osd_ids(), vec![0, 1, 2]);
        assert_eq!(cluster.active_mds_count(), 1);
        assert_eq!(cluster.hosts_with(RoleType::Client), vec!["node1"]);
        assert_eq!(cluster.host_of(&Role::osd(2)).unwrap(), "node1");
        assert!(cluster.host_of(&Role::osd(7)).is_err());
        assert_eq!(data_dir(&Role::osd(2)), "/var/lib/ceph/osd/ceph-2");
    }
}
