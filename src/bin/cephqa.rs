// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use cephqa_lib::{
    self,
    commands::{self, Cli},
};

/// The cephqa binary brings test clusters up, runs fault-injection scenarios against them, and
/// tears them down again.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("CEPHQA_LOG", "warn")).init();

    let args = Cli::parse();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
