// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    cluster::Cluster,
    commands::{load_config, Cli, HandledResult},
    role::RoleType,
};

pub fn validate(cli: &Cli) -> HandledResult<()> {
    let config = load_config(cli)?;
    let cluster = Cluster::from_config(&config);

    println!("{}: ok", cli.config_path());
    for host in cluster.hosts() {
        let roles: Vec<String> = host.roles.iter().map(|r| r.to_string()).collect();
        println!("  {}: {}", host.hostname, roles.join(", "));
        for (osd, device) in host.devices.iter() {
            println!("    osd.{osd} on {device}");
        }
    }
    for kind in RoleType::ALL {
        let count = config.roles_of_type(kind).count();
        if count > 0 {
            println!("{count} {kind}");
        }
    }
    if cli.verbose {
        print!("{}", cluster.render_conf());
    }
    Ok(())
}
