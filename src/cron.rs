//! `@reboot` hooks in root's crontab.
//!
//! Some steps can only finish after the firmware has picked up new boot
//! settings. The installer leaves a tagged `@reboot` line behind and the
//! resumed step deletes it again, so each hook runs on exactly one boot.

use anyhow::Result;

use crate::exec::{Cmd, Host};

fn marker(tag: &str) -> String {
    format!("# pi-provision:{}", tag)
}

fn is_tagged(line: &str, tag: &str) -> bool {
    line.trim_end().ends_with(&marker(tag))
}

pub fn has_hook(tab: &str, tag: &str) -> bool {
    tab.lines().any(|l| is_tagged(l, tag))
}

fn join(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Adds or replaces the `@reboot` line carrying `tag`.
pub fn with_reboot_hook(tab: &str, tag: &str, command: &str) -> String {
    let entry = format!("@reboot {} {}", command, marker(tag));
    let mut lines: Vec<String> = Vec::new();
    let mut placed = false;
    for line in tab.lines() {
        if is_tagged(line, tag) {
            if !placed {
                lines.push(entry.clone());
                placed = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }
    if !placed {
        lines.push(entry);
    }
    join(lines)
}

pub fn without_hook(tab: &str, tag: &str) -> String {
    join(
        tab.lines()
            .filter(|l| !is_tagged(l, tag))
            .map(str::to_string)
            .collect(),
    )
}

/// Current root crontab; "no crontab for root" reads as empty.
pub fn read_crontab(host: &Host<'_>) -> Result<String> {
    let out = host.query(Cmd::new("crontab").arg("-l"))?;
    Ok(if out.success { out.stdout } else { String::new() })
}

fn write_crontab(host: &Host<'_>, tab: &str) -> Result<()> {
    host.exec(Cmd::new("crontab").arg("-").stdin(tab))
}

/// Returns whether the crontab changed.
pub fn install_reboot_hook(host: &Host<'_>, tag: &str, command: &str) -> Result<bool> {
    let current = read_crontab(host)?;
    let updated = with_reboot_hook(&current, tag, command);
    if updated == current {
        return Ok(false);
    }
    write_crontab(host, &updated)?;
    Ok(true)
}

pub fn remove_reboot_hook(host: &Host<'_>, tag: &str) -> Result<bool> {
    let current = read_crontab(host)?;
    if !has_hook(&current, tag) {
        return Ok(false);
    }
    write_crontab(host, &without_hook(&current, tag))?;
    Ok(true)
}
