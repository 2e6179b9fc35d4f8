//! Power management board support: case fan control and the power button.
//!
//! The board listens on I2C for a single byte. `0..=100` sets the fan duty
//! cycle in percent and `0xff` cuts power, which is sent from a
//! systemd-shutdown hook after the OS has halted. Button presses arrive as a
//! pulse on a GPIO line whose width selects reboot or shutdown.

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use crate::apt;
use crate::boot;
use crate::config::PowerConfig;
use crate::exec::{Cmd, Host};
use crate::kvconf;
use crate::systemd;
use crate::ui;

pub const PACKAGES: &[&str] = &["i2c-tools", "gpiod"];
pub const BINARY: &str = "/usr/local/bin/pi-power";
pub const FAN_UNIT: &str = "pi-fan.service";
pub const BUTTON_UNIT: &str = "pi-button.service";
pub const SHUTDOWN_HOOK: &str = "/lib/systemd/system-shutdown/pi-power-off";
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";
const POWER_CUT: u8 = 0xff;

static GPIOD_VERSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"v(\d+)\.").expect("version pattern"));

pub const DEFAULT_CURVE: &str = "\
# CPU temperature (C) = fan speed (%)
# The fan runs at the speed of the highest temperature reached.
55=10
60=55
65=100
";

// --- Fan curve ---

#[derive(Debug, Clone, PartialEq)]
pub struct FanCurve {
    points: Vec<(f64, u8)>, // Sorted by temperature
}

impl FanCurve {
    pub fn parse(text: &str) -> Result<Self> {
        let mut points: Vec<(f64, u8)> = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let Some((key, value)) = kvconf::entries(line).into_iter().next() else {
                continue;
            };
            let line_no = number + 1;
            let temp = key
                .parse::<f64>()
                .ok()
                .filter(|t: &f64| t.is_finite())
                .ok_or_else(|| anyhow!("line {}: '{}' is not a temperature", line_no, key))?;
            let speed = value
                .parse::<u8>()
                .ok()
                .filter(|s| *s <= 100)
                .ok_or_else(|| anyhow!("line {}: fan speed must be 0-100, got '{}'", line_no, value))?;
            if points.iter().any(|(t, _)| *t == temp) {
                bail!("line {}: temperature {} is listed twice", line_no, key);
            }
            points.push((temp, speed));
        }
        if points.is_empty() {
            bail!("fan curve has no temp=speed entries");
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { points })
    }

    /// Speed of the highest point at or below `temp`; 0 below the first one.
    pub fn speed_for(&self, temp: f64) -> u8 {
        self.points
            .iter()
            .rev()
            .find(|(t, _)| *t <= temp)
            .map(|(_, s)| *s)
            .unwrap_or(0)
    }

    pub fn points(&self) -> &[(f64, u8)] {
        &self.points
    }
}

/// Follows the curve upward immediately but only slows the fan once the CPU
/// has cooled `hysteresis` degrees past the step it climbed.
#[derive(Debug)]
pub struct FanController {
    curve: FanCurve,
    hysteresis: f64,
    current: Option<u8>,
}

impl FanController {
    pub fn new(curve: FanCurve, hysteresis: f64) -> Self {
        Self { curve, hysteresis: hysteresis.max(0.0), current: None }
    }

    pub fn current(&self) -> Option<u8> {
        self.current
    }

    /// New speed to send, or `None` when it stays the same.
    pub fn next(&mut self, temp: f64) -> Option<u8> {
        let rising = self.curve.speed_for(temp);
        let target = match self.current {
            None => rising,
            Some(current) if rising >= current => rising,
            Some(current) => self.curve.speed_for(temp + self.hysteresis).min(current),
        };
        if self.current == Some(target) {
            return None;
        }
        self.current = Some(target);
        Some(target)
    }

    /// Forget the last speed so the next reading is sent again.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

pub fn read_cpu_temp(host: &Host<'_>) -> Result<f64> {
    let raw = host
        .read_file(THERMAL_ZONE)?
        .with_context(|| format!("{} not found", THERMAL_ZONE))?;
    let millis: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("Unexpected thermal reading '{}'", raw.trim()))?;
    Ok(millis / 1000.0)
}

pub fn load_curve(host: &Host<'_>, config: &PowerConfig) -> Result<FanCurve> {
    match host.read_file(&config.fan_curve_file)? {
        Some(text) => FanCurve::parse(&text)
            .with_context(|| format!("Invalid fan curve in {}", config.fan_curve_file)),
        None => {
            log::warn!("{} missing, using the built-in curve", config.fan_curve_file);
            FanCurve::parse(DEFAULT_CURVE)
        }
    }
}

fn board_write(host: &Host<'_>, config: &PowerConfig, value: u8) -> Result<()> {
    host.exec(Cmd::new("i2cset").args([
        "-y".to_string(),
        config.i2c_bus.to_string(),
        format!("0x{:02x}", config.i2c_address),
        format!("0x{:02x}", value),
    ]))
}

pub fn set_fan_speed(host: &Host<'_>, config: &PowerConfig, speed: u8) -> Result<()> {
    board_write(host, config, speed.min(100))
}

// --- Fan daemon ---

pub struct FanDaemon<'h, 'a> {
    host: &'h Host<'a>,
    config: PowerConfig,
    controller: FanController,
}

impl<'h, 'a> FanDaemon<'h, 'a> {
    pub fn new(host: &'h Host<'a>, config: PowerConfig) -> Result<Self> {
        let curve = load_curve(host, &config)?;
        let controller = FanController::new(curve, config.hysteresis);
        Ok(Self { host, config, controller })
    }

    /// One poll: read the temperature and push a new speed if it changed.
    pub fn tick(&mut self) -> Result<Option<u8>> {
        let temp = read_cpu_temp(self.host)?;
        let Some(speed) = self.controller.next(temp) else {
            return Ok(None);
        };
        if let Err(e) = set_fan_speed(self.host, &self.config, speed) {
            // Resend on the next tick instead of believing the board took it.
            self.controller.reset();
            return Err(e);
        }
        log::info!("cpu {:.1}°C, fan {}%", temp, speed);
        Ok(Some(speed))
    }

    pub fn run(&mut self) -> Result<()> {
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        log::info!("fan daemon started, polling every {}s", interval.as_secs());
        loop {
            if let Err(e) = self.tick() {
                log::error!("fan update failed: {:#}", e);
            }
            std::thread::sleep(interval);
        }
    }
}

// --- Power button ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Reboot,
    Shutdown,
}

impl ButtonAction {
    pub fn systemctl_verb(self) -> &'static str {
        match self {
            ButtonAction::Reboot => "reboot",
            ButtonAction::Shutdown => "poweroff",
        }
    }
}

pub fn classify_pulse(width_ms: u64) -> Option<ButtonAction> {
    match width_ms {
        15..=35 => Some(ButtonAction::Reboot),
        36..=60 => Some(ButtonAction::Shutdown),
        _ => None,
    }
}

/// Turns `gpiomon` event lines into button actions.
///
/// Accepts `<edge> <secs> <nsecs>` (libgpiod 1.x `%e %s %n`) and
/// `<edge> <secs>.<fraction>` (2.x `%e %S`); edge `1` is rising, `0` or `2`
/// falling.
#[derive(Debug, Default)]
pub struct PulseTracker {
    rising_ns: Option<u128>,
}

fn parse_timestamp(parts: &[&str]) -> Option<u128> {
    match parts {
        [secs, nsecs] => Some(secs.parse::<u128>().ok()? * 1_000_000_000 + nsecs.parse::<u128>().ok()?),
        [stamp] => {
            let stamp: &str = stamp;
            let (secs, frac) = stamp.split_once('.').unwrap_or((stamp, "0"));
            let frac: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
            Some(secs.parse::<u128>().ok()? * 1_000_000_000 + frac.parse::<u128>().ok()?)
        }
        _ => None,
    }
}

impl PulseTracker {
    pub fn feed(&mut self, line: &str) -> Option<ButtonAction> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let (edge, stamp) = parts.split_first()?;
        let at = parse_timestamp(stamp)?;
        match *edge {
            "1" => {
                self.rising_ns = Some(at);
                None
            }
            "0" | "2" => {
                let start = self.rising_ns.take()?;
                let width_ms = at.saturating_sub(start) / 1_000_000;
                let action = classify_pulse(width_ms as u64);
                log::debug!("button pulse {} ms -> {:?}", width_ms, action);
                action
            }
            _ => None,
        }
    }
}

pub fn gpiomon_major_version(version_output: &str) -> u32 {
    GPIOD_VERSION
        .captures(version_output)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(1)
}

pub fn gpiomon_args(major: u32, chip: &str, line: u32) -> Vec<String> {
    if major >= 2 {
        vec!["--format=%e %S".into(), "-c".into(), chip.into(), line.to_string()]
    } else {
        vec!["-b".into(), "--format=%e %s %n".into(), chip.into(), line.to_string()]
    }
}

/// Streams `gpiomon` and acts on button pulses. Returns when `gpiomon` exits.
pub fn run_button_daemon(host: &Host<'_>, config: &PowerConfig) -> Result<()> {
    let version = host
        .query(Cmd::new("gpiomon").arg("--version"))
        .map(|o| o.stdout)
        .unwrap_or_default();
    let args = gpiomon_args(gpiomon_major_version(&version), &config.gpio_chip, config.gpio_line);
    log::info!("watching {} line {} for button pulses", config.gpio_chip, config.gpio_line);

    let mut child = Command::new("gpiomon")
        .args(&args)
        .stdout(Stdio::piped())
        .spawn()
        .context("Failed to start gpiomon (is gpiod installed?)")?;
    let stdout = child.stdout.take().context("gpiomon stdout missing")?;

    let mut tracker = PulseTracker::default();
    for line in BufReader::new(stdout).lines() {
        let line = line.context("Failed to read gpiomon output")?;
        if let Some(action) = tracker.feed(&line) {
            log::info!("button requested {}", action.systemctl_verb());
            host.exec(Cmd::new("systemctl").arg(action.systemctl_verb()))?;
        }
    }

    let status = child.wait().context("Failed to wait for gpiomon")?;
    bail!("gpiomon exited ({})", status)
}

/// Called by the systemd-shutdown hook with the final action.
pub fn poweroff_signal(host: &Host<'_>, config: &PowerConfig, mode: &str) -> Result<bool> {
    if !matches!(mode, "poweroff" | "halt") {
        log::info!("shutdown mode {}, leaving board power on", mode);
        return Ok(false);
    }
    board_write(host, config, POWER_CUT)?;
    Ok(true)
}

// --- Install / uninstall ---

fn unit(description: &str, command: &str) -> String {
    format!(
        "[Unit]
Description={description}
After=multi-user.target

[Service]
Type=simple
Environment=RUST_LOG=info
ExecStart={BINARY} {command}
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
"
    )
}

pub fn fan_unit() -> String {
    unit("Power board case fan control", "fan-daemon")
}

pub fn button_unit() -> String {
    unit("Power board button monitor", "button-daemon")
}

pub fn shutdown_hook(config: &PowerConfig) -> String {
    format!(
        "#!/bin/sh
# Installed by pi-power. Runs after the system has halted.
exec {BINARY} poweroff-signal \"$1\" --bus {} --address {}
",
        config.i2c_bus, config.i2c_address
    )
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub reboot_needed: bool,
    pub packages: Vec<String>,
}

/// `exe` is the binary copied to [`BINARY`] for the units to run.
pub fn install(host: &Host<'_>, config: &PowerConfig, exe: &Path) -> Result<InstallReport> {
    ui::step("📦 Installing board tools...");
    let packages = apt::install(host, PACKAGES)?;

    ui::step("🔌 Enabling I2C...");
    let reboot_needed = boot::enable_i2c(host)?;
    if reboot_needed {
        ui::ok("I2C enabled (takes effect after reboot)");
    } else {
        ui::skip("I2C already enabled");
    }

    ui::step("🌀 Installing fan and button services...");
    if host.read_file(&config.fan_curve_file)?.is_none() {
        host.write_file(&config.fan_curve_file, DEFAULT_CURVE, 0o644)?;
        ui::ok(&format!("Wrote default fan curve to {}", config.fan_curve_file));
    } else {
        // Validate rather than overwrite the user's curve.
        load_curve(host, config)?;
        ui::skip(&format!("Keeping existing fan curve {}", config.fan_curve_file));
    }

    let mut changed = host.install_file(exe, BINARY, 0o755)?;
    changed |= systemd::install_unit(host, FAN_UNIT, &fan_unit())?;
    changed |= systemd::install_unit(host, BUTTON_UNIT, &button_unit())?;
    host.write_file(SHUTDOWN_HOOK, &shutdown_hook(config), 0o755)?;
    systemd::daemon_reload(host)?;
    for name in [FAN_UNIT, BUTTON_UNIT] {
        // `enable --now` leaves an already running daemon on the old binary.
        let running = systemd::is_active(host, name)?;
        systemd::enable_now(host, name)?;
        if running && changed {
            systemd::restart(host, name)?;
            ui::ok(&format!("{} restarted", name));
        } else {
            ui::ok(&format!("{} enabled", name));
        }
    }

    Ok(InstallReport { reboot_needed, packages })
}

pub fn uninstall(host: &Host<'_>, config: &PowerConfig, purge: bool) -> Result<()> {
    ui::step("🧹 Removing fan and button services...");
    for name in [FAN_UNIT, BUTTON_UNIT] {
        systemd::disable_now(host, name);
        if systemd::remove_unit(host, name)? {
            ui::ok(&format!("Removed {}", name));
        }
    }
    systemd::daemon_reload(host)?;

    if host.remove_file(SHUTDOWN_HOOK)? {
        ui::ok("Removed power-cut shutdown hook");
    }
    host.remove_file(BINARY)?;

    if purge {
        if host.remove_file(&config.fan_curve_file)? {
            ui::ok(&format!("Removed {}", config.fan_curve_file));
        }
    } else {
        ui::skip(&format!("Keeping {} (use --purge to remove)", config.fan_curve_file));
    }
    Ok(())
}

pub fn status(host: &Host<'_>, config: &PowerConfig) -> Result<()> {
    ui::step("🌡️  Power board status");
    for name in [FAN_UNIT, BUTTON_UNIT] {
        ui::info(&format!("{}: {}", name, systemd::state(host, name)));
    }
    let hook = if host.path(SHUTDOWN_HOOK).exists() { "installed" } else { "missing" };
    ui::info(&format!("power-cut hook: {}", hook));

    let curve = load_curve(host, config)?;
    match read_cpu_temp(host) {
        Ok(temp) => ui::info(&format!("CPU {:.1}°C, curve speed {}%", temp, curve.speed_for(temp))),
        Err(e) => ui::warn(&format!("Could not read CPU temperature: {:#}", e)),
    }
    let points: Vec<String> = curve.points().iter().map(|(t, s)| format!("{}°C→{}%", t, s)).collect();
    ui::info(&format!("curve: {}", points.join(", ")));
    Ok(())
}
