// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod resolve;
pub mod run;
pub mod scenarios;
pub mod validate;

use {resolve::ResolveArgs, run::RunArgs};

use clap::{Parser, Subcommand};

use crate::config::Config;

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` intentionally has no data about what the specific error was; the process of
/// handling the error "consumes" that information, and it is no longer needed as the error was
/// already appropriately handled.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Cluster description. Defaults to `$CEPHQA_CONFIG`, then /etc/cephqa/cephqa.toml.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring a cluster up, run scenarios against it, and tear it down.
    Run(RunArgs),
    /// Check the config without touching any host.
    Validate,
    /// Expand role patterns against the config.
    Resolve(ResolveArgs),
    /// List the available scenarios.
    Scenarios,
}

impl Cli {
    pub fn config_path(&self) -> String {
        self.config.clone().unwrap_or_else(crate::default_config_path)
    }
}

/// Load and validate the config named on the command line, reporting any problem.
fn load_config(cli: &Cli) -> HandledResult<Config> {
    let path = cli.config_path();
    let config = Config::from_file(&path).handle_err(|e| eprintln!("{e}"))?;
    config
        .validate()
        .handle_err(|e| eprintln!("Invalid config {path}: {e}"))?;
    Ok(config)
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    match &cli.command {
        Commands::Validate => return validate::validate(cli),
        Commands::Scenarios => return scenarios::list(cli),
        _ => {}
    }

    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        match &cli.command {
            Commands::Run(args) => run::run(cli, args).await,
            Commands::Resolve(args) => resolve::resolve(cli, args).await,
            Commands::Validate | Commands::Scenarios => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run() {
        let cli = Cli::try_parse_from([
            "cephqa",
            "--config",
            "/tmp/c.toml",
            "run",
            "--simulate",
            "stale_caps",
            "basic",
        ])
        .unwrap();
        assert_eq!(cli.config_path(), "/tmp/c.toml");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.simulate);
        assert_eq!(args.scenarios, vec!["stale_caps", "basic"]);
    }

    #[test]
    fn handled_errors_carry_nothing() {
        let res: std::result::Result<(), &str> = Err("boom");
        let mut seen = None;
        assert_eq!(res.handle_err(|e| seen = Some(e)), Err(HandledError {}));
        assert_eq!(seen, Some("boom"));
    }
}
