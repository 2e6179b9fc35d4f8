use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;

use pi_provision::cli::{self, CommonArgs, RebootArgs};
use pi_provision::exec::SystemRunner;
use pi_provision::power::{self, FanDaemon};
use pi_provision::{reboot, ui};

/// Fan and power button support for Pi power boards.
#[derive(Debug, Parser)]
#[command(name = "pi-power", author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install tools, enable I2C and start the fan and button services
    Install {
        #[command(flatten)]
        reboot: RebootArgs,
    },
    /// Stop and remove the services
    Uninstall {
        /// Also delete the fan curve file
        #[arg(long)]
        purge: bool,
    },
    /// Show service state, temperature and fan curve
    Status,
    /// Drive the fan from the CPU temperature (run by pi-fan.service)
    FanDaemon,
    /// Watch the power button (run by pi-button.service)
    ButtonDaemon,
    /// Tell the board to cut power (run by the systemd-shutdown hook)
    PoweroffSignal {
        /// poweroff, halt, reboot or kexec
        mode: String,

        #[arg(long)]
        bus: Option<u8>,

        /// Board address, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_address)]
        address: Option<u8>,
    },
}

fn parse_address(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid I2C address '{}': {}", s, e))
}

fn run(args: Args) -> Result<()> {
    let mut config = args.common.load_config()?;
    let runner = SystemRunner;
    let host = args.common.host(&runner);

    match args.command {
        Command::Install { reboot } => {
            ui::banner("pi-power");
            host.ensure_root()?;
            let exe = std::env::current_exe().context("Cannot locate the running pi-power binary")?;
            let report = power::install(&host, &config.power, &exe)?;
            log::info!("installed packages: {:?}", report.packages);
            ui::done("Power board support installed");
            reboot::finish(&host, report.reboot_needed, reboot.choice())?;
        }
        Command::Uninstall { purge } => {
            ui::banner("pi-power");
            host.ensure_root()?;
            power::uninstall(&host, &config.power, purge)?;
            ui::done("Power board support removed");
        }
        Command::Status => power::status(&host, &config.power)?,
        Command::FanDaemon => {
            host.ensure_root()?;
            FanDaemon::new(&host, config.power)?.run()?;
        }
        Command::ButtonDaemon => {
            host.ensure_root()?;
            power::run_button_daemon(&host, &config.power)?;
        }
        Command::PoweroffSignal { mode, bus, address } => {
            if let Some(bus) = bus {
                config.power.i2c_bus = bus;
            }
            if let Some(address) = address {
                config.power.i2c_address = address;
            }
            if power::poweroff_signal(&host, &config.power, &mode)? {
                log::info!("power cut requested on bus {}", config.power.i2c_bus);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(args.common.verbose);
    cli::exit_status(run(args))
}
