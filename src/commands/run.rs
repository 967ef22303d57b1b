// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use {clap::Args, log::warn};

use crate::{
    commands::{handled_error, load_config, Cli, Handle, HandledResult},
    lifecycle::{ClusterLifecycle, RunSummary},
    remote::{ssh::SshExecutor, RemoteExecutor},
    scenarios::Scenario,
    test_env::SimCluster,
};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Scenarios to run, each against a freshly built cluster. No names means every scenario
    /// the config has the roles for.
    pub scenarios: Vec<String>,

    /// Run against an in-process simulated cluster instead of the configured hosts.
    #[arg(long)]
    pub simulate: bool,

    /// ssh login user for the cluster hosts.
    #[arg(long)]
    pub user: Option<String>,
}

fn print_summary(scenario: Scenario, summary: &RunSummary, verbose: bool) {
    match &summary.failure_reason {
        None => println!("PASS {scenario}"),
        Some(reason) => println!("FAIL {scenario}: {reason}"),
    }
    for err in summary.teardown_errors.iter() {
        println!("     teardown: {err}");
    }
    if verbose {
        let phases: Vec<String> = summary.phases.iter().map(|p| p.to_string()).collect();
        println!("     phases: {}", phases.join(" -> "));
    }
}

pub async fn run(cli: &Cli, args: &RunArgs) -> HandledResult<()> {
    let config = load_config(cli)?;

    let explicit = !args.scenarios.is_empty();
    let scenarios: Vec<Scenario> = if explicit {
        args.scenarios
            .iter()
            .map(|name| name.parse())
            .collect::<crate::error::Result<_>>()
            .handle_err(|e| eprintln!("{e}"))?
    } else {
        Scenario::ALL.to_vec()
    };

    let mut failed = 0;
    let mut ran = 0;
    for scenario in scenarios {
        let unmet = scenario.unmet_requirements(&config);
        if !unmet.is_empty() {
            let unmet: Vec<String> = unmet
                .iter()
                .map(|(kind, need)| format!("{need} {kind}"))
                .collect();
            if explicit {
                eprintln!("{scenario} needs {}", unmet.join(", "));
                failed += 1;
            } else {
                warn!("skipping {scenario}: needs {}", unmet.join(", "));
            }
            continue;
        }

        let executor: Arc<dyn RemoteExecutor> = if args.simulate {
            SimCluster::new(&config).executor()
        } else {
            Arc::new(SshExecutor {
                user: args.user.clone(),
                ..Default::default()
            })
        };
        let lifecycle = ClusterLifecycle::new(config.clone(), executor);
        let summary = lifecycle
            .run(|live| Box::pin(async move { scenario.run(live).await }))
            .await;
        print_summary(scenario, &summary, cli.verbose);
        ran += 1;
        if !summary.success {
            failed += 1;
        }
    }

    println!("{ran} run, {failed} failed");
    if failed > 0 {
        return handled_error();
    }
    Ok(())
}
