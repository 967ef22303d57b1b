// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fs;
pub mod lifecycle;
pub mod manager;
pub mod poll;
pub mod remote;
pub mod role;
pub mod scenarios;
pub mod test_env;

pub fn default_config_path() -> String {
    match std::env::var("CEPHQA_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/cephqa/cephqa.toml".to_string(),
    }
}
