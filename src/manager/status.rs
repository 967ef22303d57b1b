// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Models for the JSON the cluster's admin commands return.
//!
//! Only the fields the orchestrator reads are modelled; everything else in the admin output is
//! ignored.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Ok,
    Warn,
    Err,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "HEALTH_OK",
            HealthStatus::Warn => "HEALTH_WARN",
            HealthStatus::Err => "HEALTH_ERR",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = Error;

    /// Parse the first token of `ceph health` output, e.g. `HEALTH_WARN 1 osds down`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_whitespace().next() {
            Some("HEALTH_OK") => Ok(HealthStatus::Ok),
            Some("HEALTH_WARN") => Ok(HealthStatus::Warn),
            Some("HEALTH_ERR") => Ok(HealthStatus::Err),
            _ => Err(Error::UnexpectedOutput {
                what: "ceph health".to_string(),
                output: s.to_string(),
            }),
        }
    }
}

/// A point-in-time view of cluster health. Never cached: every call to
/// [`crate::manager::ClusterManager::get_health`] queries the cluster again.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub status: HealthStatus,
    /// The rest of the `ceph health` line, e.g. `1 osds down`.
    pub detail: String,
    /// `(pgid, state)` for every placement group.
    pub pgs: Vec<(String, String)>,
    pub log_tail: Vec<String>,
}

impl HealthState {
    pub fn all_pgs_clean(&self) -> bool {
        self.pgs.iter().all(|(_, state)| state == PgStat::CLEAN)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PgStat {
    pub pgid: String,
    pub state: String,
    #[serde(default)]
    pub last_scrub_stamp: String,
}

impl PgStat {
    pub const CLEAN: &'static str = "active+clean";

    pub fn is_clean(&self) -> bool {
        self.state == Self::CLEAN
    }

    /// Active and not moving data around. Degraded PGs still count as recovered.
    pub fn is_recovered(&self) -> bool {
        self.state.contains("active")
            && !["recover", "backfill", "stale", "peering", "down"]
                .iter()
                .any(|s| self.state.contains(s))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PgDump {
    pub pg_stats: Vec<PgStat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsdInfo {
    pub osd: u32,
    pub up: u8,
    #[serde(rename = "in")]
    pub is_in: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolInfo {
    pub pool: u32,
    pub pool_name: String,
    #[serde(default)]
    pub pg_num: u32,
    #[serde(default)]
    pub flags_names: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsdDump {
    #[serde(default)]
    pub flags: String,
    pub osds: Vec<OsdInfo>,
    #[serde(default)]
    pub pools: Vec<PoolInfo>,
}

impl OsdDump {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.split(',').any(|f| f == flag)
    }
}

/// OSD ids grouped by map state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsdStatus {
    pub up: Vec<u32>,
    pub down: Vec<u32>,
    pub is_in: Vec<u32>,
    pub out: Vec<u32>,
}

impl From<&OsdDump> for OsdStatus {
    fn from(dump: &OsdDump) -> Self {
        let mut status = OsdStatus::default();
        for osd in &dump.osds {
            if osd.up != 0 {
                status.up.push(osd.osd);
            } else {
                status.down.push(osd.osd);
            }
            if osd.is_in != 0 {
                status.is_in.push(osd.osd);
            } else {
                status.out.push(osd.osd);
            }
        }
        status
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PgMapping {
    pub acting_primary: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuorumStatus {
    #[serde(default)]
    pub quorum_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolListEntry {
    pub poolnum: u32,
    pub poolname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsListEntry {
    pub name: String,
    pub metadata_pool: String,
    pub data_pools: Vec<String>,
}

/// Daemon states as they appear in the MDS map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MdsState {
    Active,
    Standby,
    StandbyReplay,
    Reconnect,
    Replay,
    Rejoin,
    ClientReplay,
    Resolve,
    Creating,
    Starting,
    Stopping,
    Boot,
    /// Any `down:*` state, with the part after the colon.
    Down(String),
    Other(String),
}

impl MdsState {
    /// States that count as healthy for a daemon in a settled cluster.
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            MdsState::Active | MdsState::Standby | MdsState::StandbyReplay
        )
    }
}

impl FromStr for MdsState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "up:active" => MdsState::Active,
            "up:standby" => MdsState::Standby,
            "up:standby-replay" => MdsState::StandbyReplay,
            "up:reconnect" => MdsState::Reconnect,
            "up:replay" => MdsState::Replay,
            "up:rejoin" => MdsState::Rejoin,
            "up:clientreplay" => MdsState::ClientReplay,
            "up:resolve" => MdsState::Resolve,
            "up:creating" => MdsState::Creating,
            "up:starting" => MdsState::Starting,
            "up:stopping" => MdsState::Stopping,
            "up:boot" => MdsState::Boot,
            other => match other.strip_prefix("down:") {
                Some(rest) => MdsState::Down(rest.to_string()),
                None => MdsState::Other(other.to_string()),
            },
        })
    }
}

impl fmt::Display for MdsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MdsState::Active => "up:active",
            MdsState::Standby => "up:standby",
            MdsState::StandbyReplay => "up:standby-replay",
            MdsState::Reconnect => "up:reconnect",
            MdsState::Replay => "up:replay",
            MdsState::Rejoin => "up:rejoin",
            MdsState::ClientReplay => "up:clientreplay",
            MdsState::Resolve => "up:resolve",
            MdsState::Creating => "up:creating",
            MdsState::Starting => "up:starting",
            MdsState::Stopping => "up:stopping",
            MdsState::Boot => "up:boot",
            MdsState::Down(rest) => return write!(f, "down:{rest}"),
            MdsState::Other(s) => s,
        };
        write!(f, "{s}")
    }
}

impl<'de> Deserialize<'de> for MdsState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for MdsState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdsInfo {
    #[serde(default)]
    pub gid: u64,
    pub name: String,
    /// -1 when the daemon holds no rank.
    pub rank: i64,
    pub state: MdsState,
    /// Instance address, like `10.214.133.138:6807/10825`.
    #[serde(default)]
    pub addr: String,
}

impl MdsInfo {
    /// The port part of the instance address.
    pub fn port(&self) -> Option<&str> {
        let (host_port, _inst) = self.addr.rsplit_once('/')?;
        let (_ip, port) = host_port.rsplit_once(':')?;
        Some(port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdsMap {
    #[serde(default)]
    pub info: BTreeMap<String, MdsInfo>,
    #[serde(default)]
    pub max_mds: u32,
}

impl MdsMap {
    pub fn daemons(&self) -> impl Iterator<Item = &MdsInfo> {
        self.info.values()
    }

    pub fn states(&self) -> Vec<MdsState> {
        self.daemons().map(|d| d.state.clone()).collect()
    }

    pub fn by_name(&self, name: &str) -> Option<&MdsInfo> {
        self.daemons().find(|d| d.name == name)
    }

    /// Daemons sorted by rank.
    pub fn by_rank(&self) -> Vec<&MdsInfo> {
        let mut daemons: Vec<_> = self.daemons().collect();
        daemons.sort_by_key(|d| d.rank);
        daemons
    }
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(what: &str, output: &str) -> Result<T> {
    serde_json::from_str(output).map_err(|source| Error::Parse {
        what: what.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_tokens() {
        assert_eq!("HEALTH_OK".parse::<HealthStatus>().unwrap(), HealthStatus::Ok);
        assert_eq!(
            "HEALTH_WARN 1 osds down\n".parse::<HealthStatus>().unwrap(),
            HealthStatus::Warn
        );
        assert!("".parse::<HealthStatus>().is_err());
        assert!(HealthStatus::Err > HealthStatus::Warn);
    }

    #[test]
    fn mds_map() {
        let json = r#"{
            "epoch": 12,
            "max_mds": 1,
            "info": {
                "gid_4123": {"gid": 4123, "name": "a", "rank": 0, "state": "up:active",
                             "addr": "10.0.0.1:6800/1234"},
                "gid_4150": {"gid": 4150, "name": "b-s", "rank": -1, "state": "up:standby",
                             "addr": "10.0.0.2:6801/99"}
            }
        }"#;
        let map: MdsMap = parse_json("mds dump", json).unwrap();
        assert_eq!(map.max_mds, 1);
        assert_eq!(map.by_name("a").unwrap().state, MdsState::Active);
        assert_eq!(map.by_name("a").unwrap().port(), Some("6800"));
        assert_eq!(map.by_rank()[0].name, "b-s");
    }

    #[test]
    fn mds_state_round_trip_of_unknowns() {
        assert_eq!(
            "down:dne".parse::<MdsState>().unwrap(),
            MdsState::Down("dne".to_string())
        );
        assert_eq!(
            "up:oneshot-replay".parse::<MdsState>().unwrap().to_string(),
            "up:oneshot-replay"
        );
    }

    #[test]
    fn osd_status_from_dump() {
        let json = r#"{"flags": "noout,nodown", "osds": [
            {"osd": 0, "up": 1, "in": 1},
            {"osd": 1, "up": 0, "in": 1},
            {"osd": 2, "up": 0, "in": 0}
        ], "pools": []}"#;
        let dump: OsdDump = parse_json("osd dump", json).unwrap();
        assert!(dump.has_flag("nodown"));
        assert!(!dump.has_flag("full"));
        let status = OsdStatus::from(&dump);
        assert_eq!(status.up, vec![0]);
        assert_eq!(status.down, vec![1, 2]);
        assert_eq!(status.out, vec![2]);
    }

    #[test]
    fn recovered_pg_states() {
        let pg = |state: &str| PgStat {
            pgid: "1.0".to_string(),
            state: state.to_string(),
            last_scrub_stamp: String::new(),
        };
        assert!(pg("active+clean").is_recovered());
        assert!(pg("active+undersized+degraded").is_recovered());
        assert!(!pg("active+recovering").is_recovered());
        assert!(!pg("down+peering").is_recovered());
    }
}
