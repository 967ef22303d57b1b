// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The kinds of role a host can carry in a test cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Mon,
    Osd,
    Mds,
    Client,
    Rgw,
    Samba,
}

impl RoleType {
    pub const ALL: [RoleType; 6] = [
        RoleType::Mon,
        RoleType::Osd,
        RoleType::Mds,
        RoleType::Client,
        RoleType::Rgw,
        RoleType::Samba,
    ];

    /// Role types whose daemons the lifecycle starts, in start order.
    pub const DAEMONS: [RoleType; 3] = [RoleType::Mon, RoleType::Osd, RoleType::Mds];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::Mon => "mon",
            RoleType::Osd => "osd",
            RoleType::Mds => "mds",
            RoleType::Client => "client",
            RoleType::Rgw => "rgw",
            RoleType::Samba => "samba",
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RoleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "mon" => RoleType::Mon,
            "osd" => RoleType::Osd,
            "mds" => RoleType::Mds,
            "client" => RoleType::Client,
            "rgw" => RoleType::Rgw,
            "samba" => RoleType::Samba,
            other => return Err(Error::config(format!("unknown role type '{other}'"))),
        })
    }
}

/// A `(type, id)` pair such as `osd.0` or `mds.a`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Role {
    pub kind: RoleType,
    pub id: String,
}

impl Role {
    pub fn new(kind: RoleType, id: impl Into<String>) -> Self {
        Role {
            kind,
            id: id.into(),
        }
    }

    pub fn osd(id: u32) -> Self {
        Role::new(RoleType::Osd, id.to_string())
    }

    pub fn mds(id: &str) -> Self {
        Role::new(RoleType::Mds, id)
    }

    /// MDS roles whose id ends in `-s` or contains `-s-` are standbys and never count towards
    /// `max_mds`.
    pub fn is_standby_mds(&self) -> bool {
        self.kind == RoleType::Mds && (self.id.ends_with("-s") || self.id.contains("-s-"))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.id)
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((kind, id)) = s.split_once('.') else {
            return Err(Error::config(format!(
                "invalid role '{s}', roles must be of format <type>.<id>"
            )));
        };
        if id.is_empty() || id.contains('.') {
            return Err(Error::config(format!(
                "invalid role '{s}', roles must be of format <type>.<id>"
            )));
        }
        Ok(Role::new(kind.parse()?, id))
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let role: Role = "osd.12".parse().unwrap();
        assert_eq!(role, Role::osd(12));
        assert_eq!(role.to_string(), "osd.12");

        let role: Role = "client.admin".parse().unwrap();
        assert_eq!(role.kind, RoleType::Client);
    }

    #[test]
    fn rejects_malformed() {
        assert!("osd".parse::<Role>().is_err());
        assert!("osd.".parse::<Role>().is_err());
        assert!("disk.0".parse::<Role>().is_err());
        assert!("osd.0.1".parse::<Role>().is_err());
    }

    #[test]
    fn standby_mds() {
        assert!(Role::mds("b-s").is_standby_mds());
        assert!(Role::mds("b-s-a").is_standby_mds());
        assert!(!Role::mds("a").is_standby_mds());
        assert!(!Role::new(RoleType::Osd, "x-s").is_standby_mds());
    }
}
