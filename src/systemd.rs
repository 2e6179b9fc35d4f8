//! systemd unit management.

use anyhow::Result;

use crate::exec::{Cmd, Host};

const UNIT_DIR: &str = "/etc/systemd/system";

fn systemctl(args: &[&str]) -> Cmd {
    Cmd::new("systemctl").args(args.iter().copied())
}

pub fn unit_path(name: &str) -> String {
    format!("{}/{}", UNIT_DIR, name)
}

/// Writes the unit file. Returns whether its content changed.
pub fn install_unit(host: &Host<'_>, name: &str, contents: &str) -> Result<bool> {
    let path = unit_path(name);
    if host.read_file(&path)?.as_deref() == Some(contents) {
        return Ok(false);
    }
    host.write_file(&path, contents, 0o644)?;
    Ok(true)
}

pub fn remove_unit(host: &Host<'_>, name: &str) -> Result<bool> {
    host.remove_file(&unit_path(name))
}

pub fn daemon_reload(host: &Host<'_>) -> Result<()> {
    host.exec(systemctl(&["daemon-reload"]))
}

pub fn enable_now(host: &Host<'_>, unit: &str) -> Result<()> {
    host.exec(systemctl(&["enable", "--now", unit]))
}

/// The unit may not exist, so failure is not fatal.
pub fn disable_now(host: &Host<'_>, unit: &str) -> bool {
    host.exec_lenient(systemctl(&["disable", "--now", unit]))
}

pub fn restart(host: &Host<'_>, unit: &str) -> Result<()> {
    host.exec(systemctl(&["restart", unit]))
}

pub fn is_active(host: &Host<'_>, unit: &str) -> Result<bool> {
    let out = host.query(systemctl(&["is-active", unit]))?;
    Ok(out.stdout.trim() == "active")
}

/// `is-active` text (`active`, `inactive`, `failed`...) for status output.
pub fn state(host: &Host<'_>, unit: &str) -> String {
    match host.query(systemctl(&["is-active", unit])) {
        Ok(out) if !out.stdout.trim().is_empty() => out.stdout.trim().to_string(),
        _ => "unknown".to_string(),
    }
}
