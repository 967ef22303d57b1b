// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Client recovery: how the MDS and its clients cope with client death, MDS restarts and
//! network loss between the two.

use std::{collections::BTreeSet, time::Duration};

use {
    log::{debug, info},
    tokio::time::{sleep, Instant},
};

use crate::{
    ensure,
    error::{Error, Result},
    fs::{
        mount::{ClientMount, BACKGROUND_FILE},
        SessionState,
    },
    lifecycle::LiveCluster,
    manager::status::MdsState,
};

use super::{with_cleanup, Fault, FsFixture, Scenario};

pub const CLIENTS_REQUIRED: usize = 2;

/// Time to wait for an MDS to come back to active after it has been restarted.
pub const MDS_RESTART_GRACE: Duration = Duration::from_secs(60);

/// How long a write should stay blocked behind a dead cap holder before the holder is evicted.
const BLOCKED_WRITE_CHECK: Duration = Duration::from_secs(5);

/// Set up the filesystem fixture, run one client recovery scenario and tear the fixture down.
pub async fn run(scenario: Scenario, cluster: &mut LiveCluster) -> Result<()> {
    let mut fx = FsFixture::set_up(cluster, CLIENTS_REQUIRED).await?;
    let result = match scenario {
        Scenario::Basic => basic(&mut fx).await,
        Scenario::Restart => restart(&mut fx).await,
        Scenario::ReconnectTimeout => reconnect_timeout(&mut fx).await,
        Scenario::ReconnectEviction => reconnect_eviction(&mut fx).await,
        Scenario::StaleCaps => stale_caps(&mut fx).await,
        Scenario::EvictedCaps => evicted_caps(&mut fx).await,
        Scenario::NetworkDeath => network_death(&mut fx).await,
        Scenario::DivergentPriors => Err(Error::not_found("client recovery scenario", scenario.name())),
    };
    let cleanup = fx.tear_down().await;
    with_cleanup(result, cleanup)
}

fn two_mounts<'m>(mounts: &'m mut [ClientMount]) -> (&'m mut ClientMount, &'m mut ClientMount) {
    let (a, rest) = mounts.split_at_mut(1);
    (&mut a[0], &mut rest[0])
}

/// Sessions exist for both mounted clients, and data written on one is seen on the other.
pub async fn basic(fx: &mut FsFixture<'_>) -> Result<()> {
    let (mount_a, mount_b) = two_mounts(&mut fx.mounts);

    // Data written by one client survives its unmount and is visible to the other.
    mount_a.create_files().await?;
    mount_a.check_files().await?;
    mount_a.umount_wait(false).await?;

    mount_b.check_files().await?;

    mount_a.mount().await?;
    mount_a.wait_until_mounted().await?;

    // Exactly one session per mounted client.
    let sessions = fx.fs.live_sessions(None).await?;
    ensure!(
        sessions.len() == 2,
        "expected 2 sessions, found {}",
        sessions.len()
    );
    let found: BTreeSet<u64> = sessions.iter().map(|s| s.id).collect();
    let expected: BTreeSet<u64> = [mount_a.get_global_id().await?, mount_b.get_global_id().await?]
        .into_iter()
        .collect();
    ensure!(
        found == expected,
        "session ids {found:?} do not match client ids {expected:?}"
    );
    Ok(())
}

/// Clients carry on working across an MDS fail and restart.
pub async fn restart(fx: &mut FsFixture<'_>) -> Result<()> {
    fx.fs.mds_fail_restart(&mut fx.cluster.registry, None).await?;
    fx.fs
        .wait_for_state(MdsState::Active, None, Some(MDS_RESTART_GRACE), None)
        .await?;

    let (mount_a, mount_b) = two_mounts(&mut fx.mounts);
    mount_a.create_destroy().await?;
    mount_b.create_destroy().await?;
    Ok(())
}

/// Stop the MDS, kill one client, and bring the MDS back so that it enters reconnect with a
/// client that will never answer. Returns the dead client's id.
async fn restart_with_dead_client(fx: &mut FsFixture<'_>) -> Result<u64> {
    fx.fs.mds_stop(&mut fx.cluster.registry, None).await?;
    fx.fs.mds_fail(None).await?;

    let (mount_a, _) = two_mounts(&mut fx.mounts);
    let client_id = mount_a.get_global_id().await?;
    mount_a.umount_wait(true).await?;

    fx.fs.mds_restart(&mut fx.cluster.registry, None).await?;
    fx.fs
        .wait_for_state(
            MdsState::Reconnect,
            Some(MdsState::Active),
            Some(MDS_RESTART_GRACE),
            None,
        )
        .await?;
    Ok(client_id)
}

async fn remount_a(fx: &mut FsFixture<'_>) -> Result<()> {
    let (mount_a, _) = two_mounts(&mut fx.mounts);
    mount_a.mount().await?;
    mount_a.wait_until_mounted().await?;
    mount_a.create_destroy().await
}

/// A client that dies while the MDS is down holds the MDS in reconnect until the reconnect
/// timeout, after which its session is dropped.
pub async fn reconnect_timeout(fx: &mut FsFixture<'_>) -> Result<()> {
    let client_id = restart_with_dead_client(fx).await?;

    let sessions = fx.fs.live_sessions(None).await?;
    ensure!(
        sessions.len() == 2,
        "expected 2 sessions during reconnect, found {}",
        sessions.len()
    );
    let session = fx.fs.get_session(client_id, None).await?;
    ensure!(
        session.map_or(false, |s| s.reconnecting),
        "session {client_id} is not reconnecting"
    );

    let reconnect_timeout = fx.timeouts.reconnect_timeout;
    let in_reconnect_for = fx
        .fs
        .wait_for_state(MdsState::Active, None, Some(reconnect_timeout * 2), None)
        .await?;
    info!("mds spent {in_reconnect_for:?} in reconnect");
    ensure!(
        fx.tolerance.contains(reconnect_timeout, in_reconnect_for),
        "reconnect took {in_reconnect_for:?}, outside the expected window around {reconnect_timeout:?}"
    );

    // The dead client's session is gone entirely, not just marked stale.
    let remaining = fx.fs.session_ls(None).await?;
    ensure!(
        remaining.len() == 1,
        "expected 1 session after reconnect timeout, found {}",
        remaining.len()
    );
    ensure!(
        remaining.iter().all(|s| s.id != client_id),
        "session {client_id} survived the reconnect timeout"
    );

    remount_a(fx).await
}

/// Evicting the dead client during reconnect lets the MDS go active without waiting out the
/// reconnect timeout.
pub async fn reconnect_eviction(fx: &mut FsFixture<'_>) -> Result<()> {
    let client_id = restart_with_dead_client(fx).await?;

    let sessions = fx.fs.session_ls(None).await?;
    ensure!(
        sessions.len() == 2,
        "expected 2 sessions during reconnect, found {}",
        sessions.len()
    );

    fx.fs.session_evict(client_id, None).await?;

    let sessions = fx.fs.session_ls(None).await?;
    ensure!(
        sessions.len() == 1 && sessions.iter().all(|s| s.id != client_id),
        "session {client_id} still listed after eviction"
    );

    let evict_til_active = fx
        .fs
        .wait_for_state(MdsState::Active, None, Some(MDS_RESTART_GRACE), None)
        .await?;
    let bound = fx.tolerance.lower(fx.timeouts.reconnect_timeout);
    ensure!(
        evict_til_active < bound,
        "active {evict_til_active:?} after eviction, expected under {bound:?}"
    );

    remount_a(fx).await
}

/// A writer blocks behind caps held by a dead client until its session times out.
pub async fn stale_caps(fx: &mut FsFixture<'_>) -> Result<()> {
    let (mount_a, mount_b) = two_mounts(&mut fx.mounts);
    let holder = mount_a.open_background(BACKGROUND_FILE).await?;
    mount_b.wait_for_visible(BACKGROUND_FILE, None).await?;

    mount_a.kill().await?;
    let killed = Fault::MountKilled {
        client_id: mount_a.client_id().to_string(),
    };
    fx.ledger.record(killed.clone());

    let session_timeout = fx.timeouts.session_timeout;
    let tolerance = fx.tolerance;
    let result = async {
        let waiter = mount_b.write_background(BACKGROUND_FILE).await?;
        let start = Instant::now();
        let outcome = mount_b
            .wait_background(waiter, Some(tolerance.upper(session_timeout)))
            .await?;
        let cap_waited = start.elapsed();
        ensure!(outcome.is_clean(), "blocked write {outcome}");
        info!("cap waiter blocked for {cap_waited:?}");
        ensure!(
            tolerance.contains(session_timeout, cap_waited),
            "cap waiter took {cap_waited:?}, expected about {session_timeout:?}"
        );

        let status = mount_a.stop_background(holder).await?;
        debug!("cap holder {status}");
        Ok::<_, Error>(())
    }
    .await;

    mount_a.kill_cleanup().await?;
    fx.ledger.heal(&killed);
    result?;

    mount_a.mount().await?;
    mount_a.wait_until_mounted().await
}

/// Evicting a dead cap holder releases its caps straight away.
pub async fn evicted_caps(fx: &mut FsFixture<'_>) -> Result<()> {
    let session_timeout = fx.timeouts.session_timeout;
    let tolerance = fx.tolerance;
    let fs = fx.fs.clone();
    let (mount_a, mount_b) = two_mounts(&mut fx.mounts);

    let holder = mount_a.open_background(BACKGROUND_FILE).await?;
    let client_id = mount_a.get_global_id().await?;
    mount_b.wait_for_visible(BACKGROUND_FILE, None).await?;

    mount_a.kill().await?;
    let killed = Fault::MountKilled {
        client_id: mount_a.client_id().to_string(),
    };
    fx.ledger.record(killed.clone());

    let result = async {
        let waiter = mount_b.write_background(BACKGROUND_FILE).await?;
        sleep(BLOCKED_WRITE_CHECK).await;
        ensure!(
            !mount_b.background_finished(waiter)?,
            "write completed while the dead client still held caps"
        );

        fs.session_evict(client_id, None).await?;

        let start = Instant::now();
        let outcome = mount_b
            .wait_background(waiter, Some(session_timeout))
            .await?;
        let cap_waited = start.elapsed();
        ensure!(outcome.is_clean(), "blocked write {outcome}");
        let bound = tolerance.lower(session_timeout);
        ensure!(
            cap_waited < bound,
            "write took {cap_waited:?} after eviction, expected under {bound:?}"
        );

        let status = mount_a.stop_background(holder).await?;
        debug!("cap holder {status}");
        Ok::<_, Error>(())
    }
    .await;

    mount_a.kill_cleanup().await?;
    fx.ledger.heal(&killed);
    result?;

    mount_a.mount().await?;
    mount_a.wait_until_mounted().await
}

/// A client cut off from the MDS goes stale after the session timeout and reopens its session
/// once the network comes back.
pub async fn network_death(fx: &mut FsFixture<'_>) -> Result<()> {
    let session_timeout = fx.timeouts.session_timeout;
    let ms_max_backoff = fx.timeouts.ms_max_backoff;
    let fs = fx.fs.clone();
    let (mount_a, mount_b) = two_mounts(&mut fx.mounts);

    // Only one client for this one.
    mount_b.umount_wait(false).await?;

    let client_id = mount_a.get_global_id().await?;
    let sessions = fs.live_sessions(None).await?;
    ensure!(
        sessions.len() == 1 && sessions[0].id == client_id,
        "expected a single session for client {client_id}, found {sessions:?}"
    );

    let session_state = |expected: SessionState| {
        let fs = fs.clone();
        async move {
            let state = fs
                .get_session(client_id, None)
                .await?
                .map(|s| s.state);
            ensure!(
                state == Some(expected),
                "session {client_id} is {state:?}, expected {expected}"
            );
            Ok(())
        }
    };
    session_state(SessionState::Open).await?;

    mount_a.create_files().await?;

    fs.set_clients_block(true, None).await?;
    let blocked = Fault::ClientsBlocked { mds_id: None };
    fx.ledger.record(blocked.clone());

    let writer = mount_a.write_background(BACKGROUND_FILE).await?;
    ensure!(
        !mount_a.background_finished(writer)?,
        "write completed with the client cut off"
    );
    session_state(SessionState::Open).await?;

    sleep(session_timeout.mul_f64(1.5)).await;
    ensure!(
        !mount_a.background_finished(writer)?,
        "write completed with the client cut off"
    );
    session_state(SessionState::Stale).await?;

    fs.set_clients_block(false, None).await?;
    fx.ledger.heal(&blocked);

    let start = Instant::now();
    let bound = ms_max_backoff * 2;
    let outcome = mount_a.wait_background(writer, Some(bound)).await?;
    let recovery = start.elapsed();
    ensure!(outcome.is_clean(), "write after reconnect {outcome}");
    ensure!(
        recovery < bound,
        "client took {recovery:?} to recover, expected under {bound:?}"
    );
    info!("client recovered in {recovery:?}");

    session_state(SessionState::Open).await
}
