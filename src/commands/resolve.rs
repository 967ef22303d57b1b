// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use clap::Args;

use crate::{
    commands::{load_config, Cli, Handle, HandledResult},
    lifecycle::LiveCluster,
    remote::ssh::SshExecutor,
    role::RoleType,
};

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// Role patterns such as `osd.0`, `mds` or `all`. No patterns means every daemon.
    pub patterns: Vec<String>,
}

pub async fn resolve(cli: &Cli, args: &ResolveArgs) -> HandledResult<()> {
    let config = load_config(cli)?;
    let mut live = LiveCluster::new(config, Arc::new(SshExecutor::default()))
        .handle_err(|e| eprintln!("{e}"))?;
    live.register_daemons()
        .await
        .handle_err(|e| eprintln!("{e}"))?;

    let patterns = (!args.patterns.is_empty()).then_some(args.patterns.as_slice());
    let roles = live
        .registry
        .resolve(patterns, &RoleType::DAEMONS)
        .handle_err(|e| eprintln!("{e}"))?;
    for role in roles {
        let host = live.cluster().host_of(&role).unwrap_or("?");
        println!("{role} {host}");
    }
    Ok(())
}
