use anyhow::{Context, Result, bail};
use clap::Parser;
use inquire::validator::Validation;
use inquire::{InquireError, Password, PasswordDisplayMode, Text};
use std::process::ExitCode;

use pi_provision::cli::{self, CommonArgs, RebootArgs};
use pi_provision::config::Config;
use pi_provision::exec::{Host, SystemRunner};
use pi_provision::system::{self, RepoAction, WifiCredentials};
use pi_provision::{reboot, ui};

const DEFAULT_COUNTRY: &str = "US";

/// Base provisioning for a fresh Raspberry Pi.
#[derive(Debug, Parser)]
#[command(name = "pi-setup", author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    reboot: RebootArgs,

    #[arg(long)]
    hostname: Option<String>,

    /// WiFi network name
    #[arg(long)]
    ssid: Option<String>,

    #[arg(long, value_name = "PASSPHRASE")]
    wifi_password: Option<String>,

    /// Two letter WiFi regulatory country
    #[arg(long)]
    country: Option<String>,

    /// Git URL of the config repo to clone
    #[arg(long)]
    repo_url: Option<String>,

    /// Account to set the password for and own the repo
    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    skip_hostname: bool,

    #[arg(long)]
    skip_wifi: bool,

    #[arg(long)]
    skip_password: bool,

    #[arg(long)]
    skip_repo: bool,
}

/// Empty answers and Esc skip the step; Ctrl-C aborts.
fn answer(result: Result<String, InquireError>, trim: bool) -> Result<Option<String>> {
    match result {
        Ok(v) => {
            let v = if trim { v.trim().to_string() } else { v };
            Ok((!v.is_empty()).then_some(v))
        }
        Err(InquireError::OperationCanceled) => Ok(None),
        Err(e) => Err(e).context("Prompt aborted"),
    }
}

/// Flag, then config, then a prompt when interactive.
fn pick<F>(flag: &Option<String>, config: &Option<String>, host: &Host<'_>, prompt: F) -> Result<Option<String>>
where
    F: FnOnce() -> Result<Option<String>>,
{
    if let Some(v) = flag.as_ref().or(config.as_ref()).filter(|v| !v.is_empty()) {
        return Ok(Some(v.clone()));
    }
    if host.interactive { prompt() } else { Ok(None) }
}

fn hostname_step(args: &Args, config: &Config, host: &Host<'_>) -> Result<bool> {
    let current = system::current_hostname(host)?.unwrap_or_default();
    let name = pick(&args.hostname, &config.system.hostname, host, || {
        let prompt = Text::new("Hostname:")
            .with_default(&current)
            .with_validator(|s: &str| {
                Ok(match system::validate_hostname(s.trim()) {
                    Ok(()) => Validation::Valid,
                    Err(e) => Validation::Invalid(e.to_string().into()),
                })
            })
            .prompt();
        answer(prompt, true)
    })?;

    ui::step("🏷️  Hostname");
    match name {
        Some(name) => system::set_hostname(host, &name),
        None => {
            ui::skip("No hostname given, keeping the current one");
            Ok(false)
        }
    }
}

fn wifi_step(args: &Args, config: &Config, host: &Host<'_>) -> Result<()> {
    let system = &config.system;
    let ssid = pick(&args.ssid, &system.wifi_ssid, host, || {
        answer(Text::new("WiFi network (SSID, empty to skip):").prompt(), true)
    })?;

    ui::step("📶 WiFi");
    let Some(ssid) = ssid else {
        ui::skip("No WiFi network given, skipping");
        return Ok(());
    };

    let passphrase = pick(&args.wifi_password, &system.wifi_password, host, || {
        let prompt = Password::new(&format!("Passphrase for {}:", ssid))
            .with_display_mode(PasswordDisplayMode::Masked)
            .with_custom_confirmation_message("Passphrase again:")
            .prompt();
        answer(prompt, false)
    })?;
    let Some(passphrase) = passphrase else {
        bail!("No WiFi passphrase for '{}'; pass --wifi-password or set system.wifi_password", ssid);
    };

    let country = pick(&args.country, &system.wifi_country, host, || {
        answer(Text::new("WiFi country:").with_default(DEFAULT_COUNTRY).prompt(), true)
    })?
    .unwrap_or_else(|| DEFAULT_COUNTRY.to_string())
    .to_uppercase();

    system::configure_wifi(host, &WifiCredentials { ssid, passphrase, country })
}

fn password_step(user: &str, host: &Host<'_>) -> Result<()> {
    ui::step("🔑 Password");
    if !host.interactive {
        ui::skip("Not interactive, leaving the password unchanged");
        return Ok(());
    }
    let prompt = Password::new(&format!("New password for {} (empty to keep):", user))
        .with_display_mode(PasswordDisplayMode::Masked)
        .with_custom_confirmation_message("New password again:")
        .prompt();
    match answer(prompt, false)? {
        Some(password) => system::set_password(host, user, &password),
        None => {
            ui::skip("Password unchanged");
            Ok(())
        }
    }
}

fn repo_step(args: &Args, config: &Config, user: &str, host: &Host<'_>) -> Result<()> {
    let url = pick(&args.repo_url, &config.repo.url, host, || {
        answer(Text::new("Config repo URL (empty to skip):").prompt(), true)
    })?;

    ui::step("📂 Config repo");
    match url {
        Some(url) => {
            let action = system::clone_repo(host, &config.repo, &url, user)?;
            log::info!("config repo {:?}", action);
            if action == RepoAction::Cloned {
                ui::info(&format!("Edit it at {}", config.repo.dest_for(user).display()));
            }
            Ok(())
        }
        None => {
            ui::skip("No repo URL given, skipping");
            Ok(())
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = args.common.load_config()?;
    let runner = SystemRunner;
    let host = args.common.host(&runner);

    ui::banner("pi-setup");
    host.ensure_root()?;
    let user = args.user.clone().unwrap_or_else(|| config.user());
    log::info!("configuring for user {}", user);

    let mut reboot_needed = false;
    if !args.skip_hostname {
        reboot_needed |= hostname_step(&args, &config, &host)?;
    }
    if !args.skip_wifi {
        wifi_step(&args, &config, &host)?;
    }
    if !args.skip_password {
        password_step(&user, &host)?;
    }
    if !args.skip_repo {
        repo_step(&args, &config, &user, &host)?;
    }

    ui::done("Base setup complete");
    reboot::finish(&host, reboot_needed, args.reboot.choice())?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(args.common.verbose);
    cli::exit_status(run(args))
}
