//! Optional `config.toml` shared by all three tools.
//!
//! Every field has a default so a fresh Pi works without any file at all;
//! command-line flags override whatever is loaded here.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "PI_PROVISION_CONFIG";
const SYSTEM_CONFIG: &str = "/etc/pi-provision/config.toml";

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub repo: RepoConfig,
    pub system: SystemConfig,
    pub power: PowerConfig,
    pub gps: GpsConfig,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    pub user: Option<String>, // Login account the Pi is set up for
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RepoConfig {
    pub url: Option<String>,
    pub branch: String,
    pub dest: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            url: None,
            branch: "main".to_string(),
            dest: "~/pi-config".to_string(),
        }
    }
}

impl RepoConfig {
    /// Resolves `dest` for `user`; `~` means that user's home, not ours.
    pub fn dest_for(&self, user: &str) -> PathBuf {
        let home = home_of(user);
        let expanded = shellexpand::tilde_with_context(&self.dest, || Some(home.to_string_lossy().into_owned()));
        PathBuf::from(expanded.as_ref())
    }
}

pub fn home_of(user: &str) -> PathBuf {
    if user == "root" {
        PathBuf::from("/root")
    } else {
        Path::new("/home").join(user)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct SystemConfig {
    pub hostname: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub wifi_country: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PowerConfig {
    pub i2c_bus: u8,
    pub i2c_address: u8,
    pub fan_curve_file: String,
    pub poll_interval_secs: u64,
    pub hysteresis: f64,  // Degrees C the CPU must cool before the fan slows
    pub gpio_chip: String,
    pub gpio_line: u32,   // Line the board pulses for button events
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            i2c_address: 0x1a,
            fan_curve_file: "/etc/pi-fan.conf".to_string(),
            poll_interval_secs: 30,
            hysteresis: 3.0,
            gpio_chip: "gpiochip0".to_string(),
            gpio_line: 4,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GpsConfig {
    pub device: String,
    pub gpsd_options: String,
    pub usb_auto: bool,
    pub host: String,
    pub port: u16,
    pub test_timeout_secs: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            device: "/dev/serial0".to_string(),
            gpsd_options: "-n".to_string(),
            usb_auto: true,
            host: "127.0.0.1".to_string(),
            port: 2947,
            test_timeout_secs: 30,
        }
    }
}

impl Config {
    /// The account to configure: config, then `$SUDO_USER`, then `pi`.
    pub fn user(&self) -> String {
        self.global
            .user
            .clone()
            .or_else(|| std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty() && u != "root"))
            .unwrap_or_else(|| "pi".to_string())
    }
}

/// First existing candidate: explicit path, `$PI_PROVISION_CONFIG`, the
/// per-user config dir, then `/etc/pi-provision/config.toml`.
pub fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }
    }
    let user_config = dirs::config_dir().map(|d| d.join("pi-provision/config.toml"));
    user_config
        .into_iter()
        .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG)))
        .find(|p| p.exists())
}

pub fn parse(text: &str) -> Result<Config> {
    toml::from_str(text).context("Failed to parse config.toml. Check for syntax errors.")
}

/// Loads the configuration. An explicitly named file must exist.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let Some(path) = find_config(explicit) else {
        log::debug!("no config file found, using defaults");
        return Ok(Config::default());
    };
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    log::info!("loaded config from {}", path.display());
    parse(&text).with_context(|| format!("Invalid config: {}", path.display()))
}
