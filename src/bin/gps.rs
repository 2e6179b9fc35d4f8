use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;

use pi_provision::cli::{self, CommonArgs, RebootArgs};
use pi_provision::exec::SystemRunner;
use pi_provision::{gps, reboot, ui};

/// Install, check and remove GPSD.
#[derive(Debug, Parser)]
#[command(name = "pi-gps", author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install gpsd, point it at the receiver and start it
    Install {
        /// Receiver device, overrides gps.device
        #[arg(long)]
        device: Option<String>,

        #[command(flatten)]
        reboot: RebootArgs,
    },
    /// Wait for a position fix from the running gpsd
    Test {
        /// Seconds to wait, overrides gps.test_timeout_secs
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Purge gpsd and undo its configuration
    Remove {
        /// Give the serial port back to the login console
        #[arg(long)]
        restore_serial: bool,

        #[command(flatten)]
        reboot: RebootArgs,
    },
    /// Finish an install after the reboot (run from cron)
    #[command(hide = true)]
    Resume,
}

fn run(args: Args) -> Result<()> {
    let mut config = args.common.load_config()?;
    let runner = SystemRunner;
    let host = args.common.host(&runner);

    match args.command {
        Command::Install { device, reboot } => {
            ui::banner("pi-gps");
            host.ensure_root()?;
            if let Some(device) = device {
                config.gps.device = device;
            }
            let exe = std::env::current_exe().context("Cannot locate the running pi-gps binary")?;
            let report = gps::install(&host, &config.gps, &exe)?;
            log::info!("installed packages: {:?}", report.packages);
            if report.reboot_needed {
                ui::done("GPSD installed, it starts after the next reboot");
            } else {
                ui::done("GPSD installed and running");
                ui::info("Check reception with: pi-gps test");
            }
            reboot::finish(&host, report.reboot_needed, reboot.choice())?;
        }
        Command::Test { timeout } => {
            if let Some(secs) = timeout {
                config.gps.test_timeout_secs = secs;
            }
            gps::smoke_test(&host, &config.gps)?;
            ui::done("GPS is working");
        }
        Command::Remove { restore_serial, reboot } => {
            ui::banner("pi-gps");
            host.ensure_root()?;
            let reboot_needed = gps::remove(&host, restore_serial)?;
            ui::done("GPSD removed");
            reboot::finish(&host, reboot_needed, reboot.choice())?;
        }
        Command::Resume => {
            host.ensure_root()?;
            gps::resume(&host)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(args.common.verbose);
    cli::exit_status(run(args))
}
