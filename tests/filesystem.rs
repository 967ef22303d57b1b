// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cephqa_lib::{
        config::Config,
        error::Error,
        fs::mount::ClientMount,
        lifecycle::{ClusterLifecycle, LiveCluster},
        manager::status::MdsState,
        test_env::{test_config, SimCluster},
    };

    fn fs_cluster() -> Config {
        test_config(&[
            ("node0", &["mon.a", "osd.0", "osd.1", "mds.a"]),
            ("node1", &["client.0"]),
            ("node2", &["client.1"]),
        ])
        .unwrap()
    }

    async fn bring_up(config: &Config) -> (SimCluster, LiveCluster) {
        let sim = SimCluster::new(config);
        let live = ClusterLifecycle::new(config.clone(), sim.executor())
            .bring_up()
            .await
            .unwrap();
        (sim, live)
    }

    async fn mounted(live: &LiveCluster, client_id: &str) -> ClientMount {
        let mut mount = live.client_mount(client_id).unwrap();
        mount.mount().await.unwrap();
        mount.wait_until_mounted().await.unwrap();
        mount
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_state_goal_reject_and_timeout() {
        let (_sim, mut live) = bring_up(&fs_cluster()).await;
        let fs = live.filesystem();

        let elapsed = fs
            .wait_for_state(MdsState::Active, None, Some(Duration::from_secs(10)), None)
            .await
            .unwrap();
        assert!(elapsed < Duration::from_secs(10));

        // Taking the rank over means replaying the journal before going active.
        fs.mds_stop(&mut live.registry, None).await.unwrap();
        fs.mds_fail(None).await.unwrap();
        fs.mds_restart(&mut live.registry, None).await.unwrap();
        let err = fs
            .wait_for_state(
                MdsState::Active,
                Some(MdsState::Replay),
                Some(Duration::from_secs(30)),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RejectState { .. }), "{err}");

        fs.mds_stop(&mut live.registry, None).await.unwrap();
        fs.mds_fail(None).await.unwrap();
        let start = tokio::time::Instant::now();
        let err = fs
            .wait_for_state(MdsState::Active, None, Some(Duration::from_secs(5)), None)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert!(start.elapsed() >= Duration::from_secs(5));

        fs.mds_restart(&mut live.registry, None).await.unwrap();
        fs.wait_for_daemons(None).await.unwrap();
        assert!(live.tear_down().await.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn create_is_idempotent() {
        let (sim, mut live) = bring_up(&fs_cluster()).await;
        let fs = live.filesystem();
        let creates = sim.count_commands("osd pool create");
        assert_eq!(creates, 2);

        assert!(!fs.create().await.unwrap());
        assert_eq!(sim.count_commands("osd pool create"), creates);
        assert_eq!(sim.pools(), vec!["data", "metadata", "rbd"]);

        // A CLI too old to list pools as json is taken to mean the pools are there.
        sim.set_legacy_cli(true);
        assert!(fs.legacy_configured().await.unwrap());
        assert!(!fs.create().await.unwrap());
        assert_eq!(sim.count_commands("osd pool create"), creates);
        sim.set_legacy_cli(false);

        assert_eq!(fs.get_data_pool_name().await.unwrap(), "data");
        assert_eq!(fs.get_metadata_pool_name().await.unwrap(), "metadata");
        assert!(live.tear_down().await.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_count_follows_mounts_and_evictions() {
        let (sim, mut live) = bring_up(&fs_cluster()).await;
        let fs = live.filesystem();

        let mut a = mounted(&live, "0").await;
        let mut b = mounted(&live, "1").await;
        assert_eq!(fs.session_count(None).await.unwrap(), 2);

        let a_id = a.get_global_id().await.unwrap();
        let b_id = b.get_global_id().await.unwrap();
        assert_ne!(a_id, b_id);

        fs.session_evict(a_id, None).await.unwrap();
        assert_eq!(fs.session_count(None).await.unwrap(), 1);
        let sessions = fs.session_ls(None).await.unwrap();
        assert!(sessions.iter().all(|s| s.id != a_id));
        assert!(fs.get_session(b_id, None).await.unwrap().is_some());

        a.teardown().await.unwrap();
        b.teardown().await.unwrap();
        assert!(!b.is_mounted().await.unwrap());
        assert!(sim.session_ids().is_empty());
        assert!(live.tear_down().await.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_restart_recovers_within_reconnect_timeout() {
        let (_sim, mut live) = bring_up(&fs_cluster()).await;
        let fs = live.filesystem();
        let mut a = mounted(&live, "0").await;
        let reconnect: f64 = fs
            .get_config("mds_reconnect_timeout", cephqa_lib::role::RoleType::Mds)
            .await
            .unwrap()
            .parse()
            .unwrap();
        let reconnect = Duration::from_secs_f64(reconnect);

        fs.mds_fail_restart(&mut live.registry, None).await.unwrap();
        let elapsed = fs
            .wait_for_state(MdsState::Active, None, Some(reconnect + Duration::from_secs(1)), None)
            .await
            .unwrap();
        assert!(elapsed < reconnect);

        // Replay alone takes longer than this.
        fs.mds_fail_restart(&mut live.registry, None).await.unwrap();
        let err = fs
            .wait_for_state(MdsState::Active, None, Some(Duration::from_millis(500)), None)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");

        fs.wait_for_state(MdsState::Active, None, None, None)
            .await
            .unwrap();
        a.create_destroy().await.unwrap();
        a.teardown().await.unwrap();
        assert!(live.tear_down().await.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_clients_go_stale_and_recover() {
        let (sim, mut live) = bring_up(&fs_cluster()).await;
        let fs = live.filesystem();
        let mut a = mounted(&live, "0").await;
        let id = a.get_global_id().await.unwrap();

        fs.set_clients_block(true, None).await.unwrap();
        assert_eq!(sim.firewall_rules(), 2);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(fs.session_count(None).await.unwrap(), 0);
        assert_eq!(fs.session_ls(None).await.unwrap().len(), 1);

        // The client backs off for a second from the moment the rules go away.
        fs.set_clients_block(false, None).await.unwrap();
        assert_eq!(sim.firewall_rules(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fs.get_session(id, None).await.unwrap().is_some_and(|s| s.is_live()));

        // Unblocking twice finds no rule to delete.
        assert!(fs.set_clients_block(false, None).await.is_err());

        fs.set_clients_block(true, None).await.unwrap();
        fs.clear_firewall().await.unwrap();
        assert_eq!(sim.firewall_rules(), 0);

        a.teardown().await.unwrap();
        assert!(live.tear_down().await.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_background_work_is_forgotten() {
        let (_sim, mut live) = bring_up(&fs_cluster()).await;
        let mut a = mounted(&live, "0").await;

        for _ in 0..3 {
            let writer = a.write_background("written").await.unwrap();
            let outcome = a
                .wait_background(writer, Some(Duration::from_secs(10)))
                .await
                .unwrap();
            assert!(outcome.is_clean(), "{outcome}");
            assert_eq!(a.background_count(), 0);
            assert!(matches!(
                a.wait_background(writer, None).await,
                Err(Error::NotFound { .. })
            ));
        }

        let holder = a.open_background("held").await.unwrap();
        assert_eq!(a.background_count(), 1);
        a.stop_background(holder).await.unwrap();
        assert_eq!(a.background_count(), 0);

        a.teardown().await.unwrap();
        assert!(live.tear_down().await.errors.is_empty());
    }
}
