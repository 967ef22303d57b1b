// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    commands::{Cli, HandledResult},
    scenarios::Scenario,
};

pub fn list(cli: &Cli) -> HandledResult<()> {
    for scenario in Scenario::ALL {
        if cli.verbose {
            let needs: Vec<String> = scenario
                .requirements()
                .iter()
                .map(|(kind, need)| format!("{need} {kind}"))
                .collect();
            println!(
                "{:<20} {} (needs {})",
                scenario.name(),
                scenario.description(),
                needs.join(", ")
            );
        } else {
            println!("{:<20} {}", scenario.name(), scenario.description());
        }
    }
    Ok(())
}
