// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Divergent log entries with a prior version older than the log tail.
//!
//! The primary of a one-PG pool takes a write that its replicas never see, is killed along with
//! the replicas, and comes back after the replicas have moved on without it. Reading the
//! divergent object afterwards must succeed, which it only does if the primary rolled its
//! divergent entry back.

use std::time::Duration;

use {
    log::{debug, info, warn},
    tokio::time::sleep,
};

use crate::{
    ensure,
    error::{Error, Result},
    lifecycle::LiveCluster,
    role::Role,
};

use super::{with_cleanup, Fault, FaultLedger};

/// The scenario is written for exactly this many OSDs.
pub const OSDS: usize = 3;

const POOL: &str = "foo";
const OBJECTS: usize = 1000;
/// Files that exist on any host, used as object contents.
const DUMMY_FILE: &str = "/etc/fstab";
const DUMMY_FILE2: &str = "/etc/resolv.conf";
/// How long the divergent write is given to reach the primary before rados is killed.
const DIVERGENT_WRITE_WAIT: Duration = Duration::from_secs(10);
/// Recovery delay large enough that nothing recovers while the scenario is looking.
const NO_RECOVERY: &str = "100000";
/// Log length that keeps the revived primary from backfilling.
const LONG_LOG: &str = "100000";
const DEFAULT_MIN_LOG_ENTRIES: &str = "3000";

pub async fn run(cluster: &mut LiveCluster) -> Result<()> {
    let osds = cluster.cluster().osd_ids();
    if osds.len() != OSDS {
        return Err(Error::config(format!(
            "divergent_priors needs exactly {OSDS} osds, cluster has {}",
            osds.len()
        )));
    }

    let mut ledger = FaultLedger::new();
    let result = divergent_priors(cluster, &osds, &mut ledger).await;
    let cleanup = ledger.clear(cluster, &mut []).await;
    with_cleanup(result, cleanup)
}

async fn set_config(
    cluster: &LiveCluster,
    ledger: &mut FaultLedger,
    osd: u32,
    key: &str,
    value: &str,
    restore: &str,
) -> Result<()> {
    cluster.manager.set_config(osd, key, value).await?;
    let fault = Fault::ConfigOverride {
        osd,
        key: key.to_string(),
        restore: restore.to_string(),
    };
    ledger.heal(&fault);
    if value != restore {
        ledger.record(fault);
    }
    Ok(())
}

/// A killed OSD loses every injected option, so its overrides no longer need undoing.
fn forget_overrides(ledger: &mut FaultLedger, osd: u32) {
    let stale: Vec<Fault> = ledger
        .faults()
        .iter()
        .filter(|f| matches!(f, Fault::ConfigOverride { osd: o, .. } if *o == osd))
        .cloned()
        .collect();
    for fault in stale.iter() {
        ledger.heal(fault);
    }
}

async fn kill_osd(cluster: &mut LiveCluster, ledger: &mut FaultLedger, osd: u32) -> Result<()> {
    let manager = cluster.manager.clone();
    manager.kill_osd(&mut cluster.registry, osd).await?;
    forget_overrides(ledger, osd);
    ledger.record(Fault::DaemonKilled {
        role: Role::osd(osd),
    });
    Ok(())
}

async fn revive_osd(cluster: &mut LiveCluster, ledger: &mut FaultLedger, osd: u32) -> Result<()> {
    let manager = cluster.manager.clone();
    manager.revive_osd(&mut cluster.registry, osd, None).await?;
    ledger.heal(&Fault::DaemonKilled {
        role: Role::osd(osd),
    });
    Ok(())
}

async fn divergent_priors(cluster: &mut LiveCluster, osds: &[u32], ledger: &mut FaultLedger) -> Result<()> {
    let manager = cluster.manager.clone();

    manager.wait_until_osds_up(OSDS, None).await?;
    manager.flush_pg_stats(osds).await?;
    for flag in ["noout", "noin", "nodown"] {
        manager.set_osd_flag(flag).await?;
    }
    manager.wait_for_clean(None).await?;

    info!("creating {POOL}");
    manager.create_pool(POOL, 1).await?;

    for &osd in osds {
        set_config(cluster, ledger, osd, "osd_min_pg_log_entries", "1", DEFAULT_MIN_LOG_ENTRIES).await?;
    }

    let primary = manager.get_pg_primary(POOL, 0).await?;
    let divergent: u32 = primary.id.parse().map_err(|_| Error::UnexpectedOutput {
        what: "pg map".to_string(),
        output: primary.to_string(),
    })?;
    info!("primary and soon to be divergent is {divergent}");
    let non_divergent: Vec<u32> = osds.iter().copied().filter(|&o| o != divergent).collect();

    info!("writing initial objects");
    let mut failed = 0;
    for i in 0..OBJECTS {
        let name = format!("existing_{i}");
        if manager.rados(&["-p", POOL, "put", name.as_str(), DUMMY_FILE]).await? != 0 {
            failed += 1;
        }
    }
    if failed > 0 {
        warn!("{failed} of {OBJECTS} initial writes failed");
    }
    manager.wait_for_clean(None).await?;

    info!("blackholing osds {non_divergent:?}");
    for &osd in non_divergent.iter() {
        set_config(cluster, ledger, osd, "filestore_blackhole", "", "false").await?;
    }

    info!("writing divergent object existing_0");
    let mut writer = manager
        .rados_background(&["-p", POOL, "put", "existing_0", DUMMY_FILE2])
        .await?;
    sleep(DIVERGENT_WRITE_WAIT).await;
    manager.killall("rados").await?;
    let status = writer.wait().await?;
    debug!("divergent write {status}");

    info!("killing all the osds");
    for &osd in osds {
        kill_osd(cluster, ledger, osd).await?;
    }
    for &osd in osds {
        manager.mark_down_osd(osd).await?;
    }
    for &osd in osds {
        manager.mark_out_osd(osd).await?;
    }

    info!("bringing up non_divergent {non_divergent:?}");
    for &osd in non_divergent.iter() {
        revive_osd(cluster, ledger, osd).await?;
    }
    for &osd in non_divergent.iter() {
        manager.mark_in_osd(osd).await?;
    }

    info!("making log long to prevent backfill");
    for &osd in non_divergent.iter() {
        set_config(cluster, ledger, osd, "osd_min_pg_log_entries", LONG_LOG, DEFAULT_MIN_LOG_ENTRIES).await?;
    }

    info!("writing non-divergent object existing_1");
    manager
        .rados(&["-p", POOL, "put", "existing_1", DUMMY_FILE2])
        .await?;
    manager.wait_for_recovery(None).await?;

    info!("delay recovery");
    for &osd in non_divergent.iter() {
        set_config(cluster, ledger, osd, "osd_recovery_delay_start", NO_RECOVERY, "0").await?;
    }

    info!("revive divergent {divergent}");
    revive_osd(cluster, ledger, divergent).await?;
    manager.wait_until_osds_up(OSDS, None).await?;

    info!("delay recovery divergent");
    set_config(cluster, ledger, divergent, "osd_recovery_delay_start", NO_RECOVERY, "0").await?;
    info!("mark divergent in");
    manager.mark_in_osd(divergent).await?;

    info!("wait for peering");
    manager.rados(&["-p", POOL, "put", "foo", DUMMY_FILE]).await?;

    info!("killing divergent {divergent}");
    kill_osd(cluster, ledger, divergent).await?;
    info!("reviving divergent {divergent}");
    revive_osd(cluster, ledger, divergent).await?;

    info!("allowing recovery");
    for &osd in non_divergent.iter() {
        set_config(cluster, ledger, osd, "osd_recovery_delay_start", "0", "0").await?;
    }

    info!("reading existing_0");
    let exit_status = manager
        .rados(&["-p", POOL, "get", "existing_0", "-o", "/tmp/existing"])
        .await?;
    ensure!(
        exit_status == 0,
        "reading the divergent object exited with {exit_status}"
    );
    info!("success");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killed_osd_drops_its_overrides() {
        let mut ledger = FaultLedger::new();
        for (osd, key) in [(0, "a"), (1, "a"), (0, "b")] {
            ledger.record(Fault::ConfigOverride {
                osd,
                key: key.to_string(),
                restore: "0".to_string(),
            });
        }
        ledger.record(Fault::DaemonKilled { role: Role::osd(0) });

        forget_overrides(&mut ledger, 0);
        assert_eq!(
            ledger.faults(),
            &[
                Fault::ConfigOverride {
                    osd: 1,
                    key: "a".to_string(),
                    restore: "0".to_string(),
                },
                Fault::DaemonKilled { role: Role::osd(0) },
            ]
        );
    }
}
