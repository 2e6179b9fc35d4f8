use anyhow::{Context, Result};
use colored::*;
use inquire::InquireError;

use crate::exec::{Cmd, Host};
use crate::ui;

/// `--reboot` / `--no-reboot`; `None` means ask.
pub type RebootChoice = Option<bool>;

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Rebooting,
    Postponed,
    NotNeeded,
}

/// Esc declines; Ctrl-C or a broken terminal aborts the run.
fn confirmed(answer: Result<bool, InquireError>) -> Result<bool> {
    match answer {
        Ok(yes) => Ok(yes),
        Err(InquireError::OperationCanceled) => Ok(false),
        Err(e) => Err(e).context("Reboot prompt aborted"),
    }
}

pub fn finish(host: &Host<'_>, needed: bool, choice: RebootChoice) -> Result<Outcome> {
    let reboot = match choice {
        Some(explicit) => explicit,
        None if !needed => false,
        None if host.interactive => confirmed(inquire::Confirm::new("Reboot now?").with_default(true).prompt())?,
        None => false,
    };

    if reboot {
        ui::step("🔁 Rebooting...");
        host.exec(Cmd::new("systemctl").arg("reboot"))?;
        return Ok(Outcome::Rebooting);
    }
    if needed {
        println!("\n{}", "⚠️  A reboot is required for the changes to take effect.".yellow().bold());
        return Ok(Outcome::Postponed);
    }
    Ok(Outcome::NotNeeded)
}
