//! Base provisioning steps run by `pi-setup`.

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use crate::apt;
use crate::boot::RaspiConfig;
use crate::config::RepoConfig;
use crate::exec::{Cmd, Host};
use crate::ui;

const HOSTS: &str = "/etc/hosts";
const HOSTNAME: &str = "/etc/hostname";
const WPA_SUPPLICANT: &str = "/etc/wpa_supplicant/wpa_supplicant.conf";

static HOSTNAME_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("hostname pattern"));

// --- Hostname ---

pub fn validate_hostname(name: &str) -> Result<()> {
    if !HOSTNAME_LABEL.is_match(name) {
        bail!(
            "Invalid hostname '{}': use 1-63 lowercase letters, digits or hyphens, not starting or ending with a hyphen",
            name
        );
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid hostname '{}': must not be all digits", name);
    }
    Ok(())
}

pub fn current_hostname(host: &Host<'_>) -> Result<Option<String>> {
    Ok(host
        .read_file(HOSTNAME)?
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty()))
}

/// Points the Debian `127.0.1.1` alias at `name`, adding the line if absent.
pub fn hosts_with_name(text: &str, name: &str) -> String {
    let entry = format!("127.0.1.1\t{}", name);
    let mut placed = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            let is_alias = line.split_whitespace().next() == Some("127.0.1.1");
            if is_alias && !placed {
                placed = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !placed {
        lines.push(entry);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Returns whether the hostname changed.
pub fn set_hostname(host: &Host<'_>, name: &str) -> Result<bool> {
    validate_hostname(name)?;
    if current_hostname(host)?.as_deref() == Some(name) {
        ui::skip(&format!("Hostname is already {}", name));
        return Ok(false);
    }

    if let Some(raspi) = RaspiConfig::detect(host) {
        raspi.run("do_hostname", &[name])?;
    } else {
        host.edit_file(HOSTNAME, 0o644, |_| format!("{}\n", name))?;
        host.edit_file(HOSTS, 0o644, |t| hosts_with_name(t, name))?;
        host.exec_lenient(Cmd::new("hostnamectl").args(["set-hostname", name]));
    }
    ui::ok(&format!("Hostname set to {}", name));
    Ok(true)
}

// --- WiFi ---

#[derive(Debug, Clone)]
pub struct WifiCredentials {
    pub ssid: String,
    pub passphrase: String,
    pub country: String,
}

impl WifiCredentials {
    pub fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            bail!("SSID must be 1-32 bytes long");
        }
        let pass = &self.passphrase;
        let ascii_pass = (8..=63).contains(&pass.len()) && pass.chars().all(|c| (' '..='~').contains(&c));
        if !is_hex_key(pass) && !ascii_pass {
            bail!("WiFi passphrase must be 8-63 printable ASCII characters or a 64 digit hex key");
        }
        self.validate_country()
    }

    fn validate_country(&self) -> Result<()> {
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_uppercase()) {
            bail!("WiFi country must be a two letter ISO code such as US or GB, got '{}'", self.country);
        }
        Ok(())
    }
}

fn is_hex_key(pass: &str) -> bool {
    pass.len() == 64 && pass.chars().all(|c| c.is_ascii_hexdigit())
}

/// Quoted when wpa_supplicant can read it back verbatim, hex otherwise.
fn ssid_field(ssid: &str) -> String {
    if ssid.bytes().all(|b| (b' '..=b'~').contains(&b) && b != b'"') {
        format!("\"{}\"", ssid)
    } else {
        ssid.bytes().map(|b| format!("{:02x}", b)).collect()
    }
}

/// The `psk=` value for a network. A passphrase containing `"` cannot be
/// quoted in wpa_supplicant.conf, so it is hashed with `wpa_passphrase`.
pub fn psk_field(host: &Host<'_>, creds: &WifiCredentials) -> Result<String> {
    let pass = &creds.passphrase;
    if is_hex_key(pass) {
        return Ok(pass.to_lowercase());
    }
    if !pass.contains('"') {
        return Ok(format!("\"{}\"", pass));
    }
    let out = host.query(
        Cmd::new("wpa_passphrase")
            .arg(creds.ssid.as_str())
            .stdin(format!("{}\n", pass)),
    )?;
    out.stdout
        .lines()
        .filter_map(|l| l.trim().strip_prefix("psk="))
        .find(|key| is_hex_key(key))
        .map(str::to_string)
        .ok_or_else(|| anyhow!("wpa_passphrase printed no key for '{}'", creds.ssid))
}

fn network_block(ssid: &str, psk: &str) -> String {
    format!("network={{\n\tssid={}\n\tpsk={}\n\tkey_mgmt=WPA-PSK\n}}\n", ssid, psk)
}

/// Rewrites a `wpa_supplicant.conf`: sets `country=` and replaces any
/// network block for the same SSID.
pub fn wpa_supplicant_with(text: &str, creds: &WifiCredentials, psk: &str) -> String {
    let ssid = ssid_field(&creds.ssid);
    let ssid_line = format!("ssid={}", ssid);
    let mut head: Vec<String> = Vec::new();
    let mut blocks: Vec<Vec<String>> = Vec::new();
    let mut current: Option<Vec<String>> = None;

    for line in text.lines() {
        if let Some(block) = current.as_mut() {
            block.push(line.to_string());
            if line.trim() == "}" {
                blocks.extend(current.take());
            }
        } else if line.trim_start().starts_with("network={") {
            current = Some(vec![line.to_string()]);
        } else if !line.trim_start().starts_with("country=") {
            head.push(line.to_string());
        }
    }
    blocks.extend(current);

    if !head.iter().any(|l| l.starts_with("ctrl_interface=")) {
        head.insert(0, "ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev".to_string());
        head.insert(1, "update_config=1".to_string());
    }
    while head.last().is_some_and(|l| l.trim().is_empty()) {
        head.pop();
    }
    head.push(format!("country={}", creds.country));

    let mut out = head.join("\n");
    out.push('\n');
    for block in blocks.iter().filter(|b| !b.iter().any(|l| l.trim() == ssid_line)) {
        out.push('\n');
        out.push_str(&block.join("\n"));
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&network_block(&ssid, psk));
    out
}

pub fn configure_wifi(host: &Host<'_>, creds: &WifiCredentials) -> Result<()> {
    creds.validate()?;

    if let Some(raspi) = RaspiConfig::detect(host) {
        raspi.run("do_wifi_country", &[creds.country.as_str()])?;
        raspi.run_secret("do_wifi_ssid_passphrase", &[creds.ssid.as_str(), creds.passphrase.as_str()])?;
    } else if host.has_program("nmcli") {
        host.exec_lenient(Cmd::new("iw").args(["reg", "set", creds.country.as_str()]));
        host.exec(
            Cmd::new("nmcli")
                .args(["device", "wifi", "connect", creds.ssid.as_str(), "password", creds.passphrase.as_str()])
                .secret(),
        )?;
    } else {
        let psk = psk_field(host, creds)?;
        host.edit_file(WPA_SUPPLICANT, 0o600, |t| wpa_supplicant_with(t, creds, &psk))?;
        host.exec_lenient(Cmd::new("rfkill").args(["unblock", "wifi"]));
        host.exec_lenient(Cmd::new("wpa_cli").args(["-i", "wlan0", "reconfigure"]));
    }
    ui::ok(&format!("WiFi configured for {} ({})", creds.ssid, creds.country));
    Ok(())
}

// --- Password ---

pub fn user_exists(host: &Host<'_>, user: &str) -> Result<bool> {
    let passwd = host.read_file("/etc/passwd")?.unwrap_or_default();
    Ok(passwd
        .lines()
        .any(|l| l.split(':').next() == Some(user)))
}

pub fn set_password(host: &Host<'_>, user: &str, password: &str) -> Result<()> {
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    if password.contains(['\n', '\r']) {
        bail!("Password must not contain line breaks");
    }
    if user.contains(':') || !user_exists(host, user)? {
        bail!("User '{}' does not exist", user);
    }
    host.exec(Cmd::new("chpasswd").stdin(format!("{}:{}\n", user, password)))?;
    ui::ok(&format!("Password updated for {}", user));
    Ok(())
}

// --- Config repo ---

#[derive(Debug, PartialEq, Eq)]
pub enum RepoAction {
    Cloned,
    Updated,
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)
        .with_context(|| format!("Failed to list {}", path.display()))?
        .next()
        .is_none())
}

/// Clones the config repo for `user`, or fast-forwards an existing clone.
pub fn clone_repo(host: &Host<'_>, repo: &RepoConfig, url: &str, user: &str) -> Result<RepoAction> {
    apt::install(host, &["git"])?;

    let dest = repo.dest_for(user);
    let dest_str = dest.to_string_lossy().into_owned();
    let local = host.path(&dest);
    let local_str = local.to_string_lossy().into_owned();

    let action = if local.join(".git").exists() {
        host.exec(Cmd::new("git").args(["-C", local_str.as_str(), "pull", "--ff-only"]))?;
        RepoAction::Updated
    } else if local.exists() && !is_empty_dir(&local)? {
        bail!("{} exists and is not a git checkout; move it away first", dest_str);
    } else {
        host.exec(Cmd::new("git").args([
            "clone",
            "--depth",
            "1",
            "--branch",
            repo.branch.as_str(),
            url,
            local_str.as_str(),
        ]))?;
        RepoAction::Cloned
    };

    if user != "root" {
        let owner = format!("{}:{}", user, user);
        host.exec(Cmd::new("chown").args(["-R", owner.as_str(), local_str.as_str()]))?;
    }
    match action {
        RepoAction::Cloned => ui::ok(&format!("Cloned {} into {}", url, dest_str)),
        RepoAction::Updated => ui::ok(&format!("Updated {}", dest_str)),
    }
    Ok(action)
}
