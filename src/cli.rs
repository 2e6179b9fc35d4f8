//! Flags and start-up shared by the three binaries.

use anyhow::Result;
use clap::Args;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::config::{self, Config};
use crate::exec::{CommandRunner, Host};
use crate::reboot::RebootChoice;
use crate::ui;

#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Print what would change instead of changing it
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Use this config.toml instead of the default search order
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Never prompt; accept defaults
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Treat this directory as the system root
    #[arg(long, global = true, hide = true, default_value = "/")]
    pub root: PathBuf,
}

#[derive(Debug, Args)]
pub struct RebootArgs {
    /// Reboot when finished without asking
    #[arg(long, conflicts_with = "no_reboot")]
    pub reboot: bool,

    /// Never reboot, only remind
    #[arg(long)]
    pub no_reboot: bool,
}

impl RebootArgs {
    pub fn choice(&self) -> RebootChoice {
        match (self.reboot, self.no_reboot) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

/// `RUST_LOG` wins; otherwise the level follows `-v`.
pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// Turns the result of a binary's `run` into its exit status.
pub fn exit_status(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::debug!("{:?}", e);
            ui::fail(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

impl CommonArgs {
    pub fn interactive(&self) -> bool {
        !self.yes && std::io::stdin().is_terminal()
    }

    pub fn host<'a>(&self, runner: &'a dyn CommandRunner) -> Host<'a> {
        Host::new(self.root.clone(), runner, self.dry_run, self.interactive())
    }

    pub fn load_config(&self) -> Result<Config> {
        config::load(self.config.as_deref())
    }
}
