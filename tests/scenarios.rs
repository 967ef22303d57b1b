// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use cephqa_lib::{
        config::Config,
        lifecycle::{ClusterLifecycle, RunSummary},
        scenarios::Scenario,
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

    fn osd_cluster(osds: u32) -> Config {
        let roles: Vec<String> = (0..osds).map(|i| format!("osd.{i}")).collect();
        let mut hosts: Vec<(String, Vec<&str>)> = roles
            .iter()
            .enumerate()
            .map(|(i, role)| (format!("node{i}"), vec![role.as_str()]))
            .collect();
        hosts[0].1.push("mon.a");
        let hosts: Vec<(&str, &[&str])> = hosts
            .iter()
            .map(|(name, roles)| (name.as_str(), roles.as_slice()))
            .collect();
        test_config(&hosts).unwrap()
    }

    async fn run(scenario: Scenario, config: &Config, sim: &SimCluster) -> RunSummary {
        let lifecycle = ClusterLifecycle::new(config.clone(), sim.executor());
        lifecycle
            .run(|live| Box::pin(async move { scenario.run(live).await }))
            .await
    }

    async fn assert_passes(scenario: Scenario) {
        let config = fs_cluster();
        let sim = SimCluster::new(&config);
        let summary = run(scenario, &config, &sim).await;
        assert!(
            summary.success,
            "{scenario} failed: {:?} {:?}",
            summary.failure_reason, summary.teardown_errors
        );
        assert!(summary.teardown_errors.is_empty());
        assert_eq!(sim.firewall_rules(), 0);
        assert_eq!(sim.live_processes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn basic() {
        assert_passes(Scenario::Basic).await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart() {
        assert_passes(Scenario::Restart).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_timeout() {
        assert_passes(Scenario::ReconnectTimeout).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_eviction() {
        assert_passes(Scenario::ReconnectEviction).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_caps() {
        assert_passes(Scenario::StaleCaps).await;
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_caps() {
        assert_passes(Scenario::EvictedCaps).await;
    }

    #[tokio::test(start_paused = true)]
    async fn network_death() {
        assert_passes(Scenario::NetworkDeath).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_wait_scales_with_the_configured_timeout() {
        let config = fs_cluster();
        let sim = SimCluster::new(&config);
        sim.set_option("mds_reconnect_timeout", "150");

        let start = tokio::time::Instant::now();
        let summary = run(Scenario::ReconnectTimeout, &config, &sim).await;
        assert!(summary.success, "{:?}", summary.failure_reason);
        assert!(start.elapsed() >= std::time::Duration::from_secs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_outside_tolerance_fails() {
        let mut config = fs_cluster();
        config.recovery.lower_factor = 1.5;
        config.recovery.upper_factor = 3.0;
        let sim = SimCluster::new(&config);

        let summary = run(Scenario::ReconnectTimeout, &config, &sim).await;
        assert!(!summary.success);
        assert!(
            summary
                .failure_reason
                .as_deref()
                .unwrap()
                .contains("outside the expected window"),
            "{:?}",
            summary.failure_reason
        );
        assert_eq!(sim.live_processes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn network_fault_is_healed_after_a_failure() {
        let config = fs_cluster();
        let sim = SimCluster::new(&config);
        // Sessions go stale the moment they lose the MDS.
        sim.set_option("mds_session_timeout", "0");

        let summary = run(Scenario::NetworkDeath, &config, &sim).await;
        assert!(!summary.success);
        assert_eq!(sim.count_commands("iptables -A"), 2);
        assert_eq!(sim.count_commands("iptables -D"), 2);
        assert_eq!(sim.firewall_rules(), 0);
        assert_eq!(sim.live_processes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn divergent_priors() {
        let config = osd_cluster(3);
        let sim = SimCluster::new(&config);

        let summary = run(Scenario::DivergentPriors, &config, &sim).await;
        assert!(summary.success, "{:?}", summary.failure_reason);
        assert_eq!(sim.count_commands("rados -p foo put existing_"), 1002);
        assert_eq!(sim.count_commands("killall -9 rados"), 1);
        assert_eq!(sim.live_processes(), 0);
        for osd in 0..3 {
            assert_eq!(sim.osd_override(osd, "filestore_blackhole"), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn divergent_entry_left_in_place_fails_the_read() {
        let config = osd_cluster(3);
        let sim = SimCluster::new(&config);
        sim.set_divergent_read_failure(true);

        let summary = run(Scenario::DivergentPriors, &config, &sim).await;
        assert!(!summary.success);
        assert!(
            summary
                .failure_reason
                .as_deref()
                .unwrap()
                .contains("exited with 5"),
            "{:?}",
            summary.failure_reason
        );
    }

    #[tokio::test(start_paused = true)]
    async fn divergent_priors_needs_three_osds() {
        let config = osd_cluster(4);
        let sim = SimCluster::new(&config);

        let summary = run(Scenario::DivergentPriors, &config, &sim).await;
        assert!(!summary.success);
        assert!(summary.failure_reason.unwrap().contains("exactly 3 osds"));
        assert_eq!(sim.count_commands("osd pool create foo"), 0);
    }
}
