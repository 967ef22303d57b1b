// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use cephqa_lib::{
        config::Config,
        error::Error,
        lifecycle::{ClusterLifecycle, LifecyclePhase, RestartOptions},
        manager::status::HealthStatus,
        role::Role,
        test_env::{test_config, SimCluster},
    };

    fn small_cluster() -> Config {
        test_config(&[
            ("node0", &["mon.a", "osd.0", "mds.a"]),
            ("node1", &["mon.b", "osd.1", "client.0"]),
        ])
        .unwrap()
    }

    fn lifecycle(config: &Config) -> (SimCluster, ClusterLifecycle) {
        let sim = SimCluster::new(config);
        let lifecycle = ClusterLifecycle::new(config.clone(), sim.executor());
        (sim, lifecycle)
    }

    #[tokio::test(start_paused = true)]
    async fn bring_up_then_tear_down_once() {
        let config = small_cluster();
        let (sim, lifecycle) = lifecycle(&config);

        let mut live = lifecycle.bring_up().await.unwrap();
        assert_eq!(live.phase(), LifecyclePhase::Healthy);
        for role in ["mon.a", "mon.b", "osd.0", "osd.1", "mds.a"] {
            assert!(sim.is_running(&role.parse::<Role>().unwrap()), "{role} not running");
        }
        assert_eq!(sim.mds_state("a").as_deref(), Some("up:active"));

        // Monitors start before OSDs, OSDs before the MDS.
        let mon = sim.command_position("ceph-mon -f").unwrap();
        let osd = sim.command_position("ceph-osd -f").unwrap();
        let mds = sim.command_position("ceph-mds -f").unwrap();
        assert!(mon < osd && osd < mds);

        let report = live.tear_down().await;
        assert!(!report.already_torn_down);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.log_failure, None);
        assert_eq!(live.phase(), LifecyclePhase::Terminated);
        assert_eq!(sim.live_processes(), 0);
        assert!(sim.file("node1", "/etc/ceph/ceph.conf").is_none());

        let again = live.tear_down().await;
        assert!(again.already_torn_down);
        assert!(again.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn maps_reach_every_host() {
        let config = test_config(&[
            ("node0", &["mon.a", "osd.0"]),
            ("node1", &["mon.b", "osd.1"]),
            ("node2", &["osd.2"]),
        ])
        .unwrap();
        let (sim, lifecycle) = lifecycle(&config);

        let mut live = lifecycle.bring_up().await.unwrap();
        assert_eq!(sim.count_commands("monmaptool"), 1);
        assert_eq!(sim.count_commands("node0: sudo base64"), 1);
        assert_eq!(sim.count_commands("node1: sudo sh -c base64 -d > /tmp/cephtest/monmap"), 1);
        assert_eq!(sim.count_commands("node2: sudo sh -c base64 -d > /tmp/cephtest/monmap"), 1);
        let osdmaps: Vec<String> = sim
            .commands()
            .into_iter()
            .filter(|c| c.contains("osdmaptool"))
            .filter_map(|c| c.split(':').next().map(str::to_string))
            .collect();
        assert_eq!(osdmaps, vec!["node0", "node1"]);
        assert!(sim.is_running(&"osd.2".parse().unwrap()));
        for host in ["node0", "node1", "node2"] {
            assert!(sim.file(host, "/tmp/cephtest/monmap").is_none(), "monmap left on {host}");
            assert!(sim.file(host, "/tmp/cephtest/osdmap").is_none(), "osdmap left on {host}");
        }
        assert!(live.tear_down().await.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bring_up_is_torn_down() {
        let config = small_cluster();
        let (sim, lifecycle) = lifecycle(&config);
        sim.fail_command("ceph-mon --mkfs", 1);

        let err = lifecycle.bring_up().await.unwrap_err();
        assert!(matches!(err, Error::RemoteCommand { exit_status: 1, .. }), "{err}");
        assert!(!sim.is_running(&"mon.a".parse().unwrap()));
        assert!(sim.count_commands("rm -rf --") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_wait_times_out_when_a_monitor_dies() {
        let mut config = small_cluster();
        config.timeouts.quorum = 10;
        let (sim, lifecycle) = lifecycle(&config);
        sim.fail_command("ceph-mon -f -i b", 1);

        let err = lifecycle.bring_up().await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert_eq!(sim.live_processes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_never_touches_hosts() {
        let config = test_config(&[("node0", &["osd.0"])]).unwrap();
        let (sim, lifecycle) = lifecycle(&config);

        let summary = lifecycle.run(|_| Box::pin(async { Ok::<_, Error>(()) })).await;
        assert!(!summary.success);
        assert!(summary.failure_reason.unwrap().contains("mon"));
        assert!(sim.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn body_failure_is_reported_after_teardown() {
        let config = small_cluster();
        let (sim, lifecycle) = lifecycle(&config);

        let summary = lifecycle
            .run(|_| Box::pin(async { Err::<(), _>(Error::assertion("objects went missing")) }))
            .await;
        assert!(!summary.success);
        assert!(summary
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("objects went missing"));
        assert_eq!(summary.phases.last(), Some(&LifecyclePhase::Terminated));
        assert_eq!(sim.live_processes(), 0);
        // No scrub after a failed body.
        assert_eq!(sim.count_commands("deep-scrub"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_log_errors_fail_a_passing_run() {
        let mut config = small_cluster();
        config.cluster.log_whitelist = vec!["clock skew".to_string()];
        let (sim, lifecycle) = lifecycle(&config);

        let log = sim.clone();
        let summary = lifecycle
            .run(|_| {
                Box::pin(async move {
                    log.log("2025-01-01 mon.a [WRN] clock skew detected on mon.b");
                    log.log("2025-01-01 osd.1 [ERR] 1.2 missing primary copy");
                    Ok::<_, Error>(())
                })
            })
            .await;
        assert!(!summary.success);
        assert_eq!(
            summary.failure_reason.as_deref(),
            Some("\"2025-01-01 osd.1 [ERR] 1.2 missing primary copy\" in cluster log")
        );
        // The run itself passed, so the cluster was scrubbed on the way out.
        assert_eq!(sim.count_commands("deep-scrub"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_and_stop_by_pattern() {
        let config = small_cluster();
        let (sim, lifecycle) = lifecycle(&config);
        let mut live = lifecycle.bring_up().await.unwrap();

        let before = sim.count_commands("ceph-osd -f");
        live.restart_daemons(
            Some(&["osd.*".to_string()]),
            RestartOptions {
                wait_for_healthy: true,
                wait_for_osds_up: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(sim.count_commands("ceph-osd -f"), before + 2);

        live.stop_daemons(Some(&["mon.b".to_string()])).await.unwrap();
        assert!(!sim.is_running(&"mon.b".parse().unwrap()));
        assert!(sim.is_running(&"mon.a".parse().unwrap()));

        let err = live
            .stop_daemons(Some(&["client.0".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");

        assert!(live.tear_down().await.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn health_that_never_settles_times_out() {
        let mut config = small_cluster();
        config.timeouts.healthy = 30;
        let (sim, lifecycle) = lifecycle(&config);
        sim.force_health(Some("HEALTH_WARN clock skew detected on mon.b"));

        let summary = lifecycle.run(|_| Box::pin(async { Ok::<_, Error>(()) })).await;
        assert!(!summary.success);
        assert!(summary.phases.contains(&LifecyclePhase::Converging));
        assert!(!summary.phases.contains(&LifecyclePhase::Healthy));
        assert_eq!(summary.phases.last(), Some(&LifecyclePhase::Terminated));
        let reason = summary.failure_reason.unwrap();
        assert!(reason.contains("HEALTH_WARN clock skew detected on mon.b"), "{reason}");
        assert!(reason.contains("pgs active+clean"), "{reason}");
    }

    #[tokio::test(start_paused = true)]
    async fn health_snapshot_is_fresh_each_time() {
        let config = small_cluster();
        let (sim, lifecycle) = lifecycle(&config);
        let mut live = lifecycle.bring_up().await.unwrap();

        let health = live.manager.get_health().await.unwrap();
        assert_eq!(health.status, HealthStatus::Ok);
        assert!(health.detail.is_empty());
        assert!(!health.pgs.is_empty());
        assert!(health.all_pgs_clean());

        sim.force_health(Some("HEALTH_WARN 1 osds down"));
        sim.log("2025-01-01 mon.a [INF] osd.1 marked down");
        let health = live.manager.get_health().await.unwrap();
        assert_eq!(health.status, HealthStatus::Warn);
        assert_eq!(health.detail, "1 osds down");
        assert_eq!(
            health.log_tail.last().map(String::as_str),
            Some("2025-01-01 mon.a [INF] osd.1 marked down")
        );

        sim.force_health(None);
        assert!(live.tear_down().await.errors.is_empty());
    }
}
