//! Raspberry Pi firmware and kernel command line settings.
//!
//! `raspi-config nonint` is preferred when present since it knows about
//! every OS release. Without it (minimal images, Ubuntu) the equivalent edits
//! are made to `config.txt` and `cmdline.txt` directly.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;

use crate::exec::{Cmd, Host};
use crate::kvconf;

const FIRMWARE_DIR: &str = "/boot/firmware";
const LEGACY_DIR: &str = "/boot";

static SERIAL_CONSOLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^console=(serial0|serial1|ttyAMA0|ttyS0)(,\d+)?$").expect("serial console pattern")
});

fn boot_file(host: &Host<'_>, name: &str) -> String {
    let current = format!("{}/{}", FIRMWARE_DIR, name);
    if host.path(&current).exists() {
        current
    } else {
        format!("{}/{}", LEGACY_DIR, name)
    }
}

pub fn config_txt(host: &Host<'_>) -> String {
    boot_file(host, "config.txt")
}

pub fn cmdline_txt(host: &Host<'_>) -> String {
    boot_file(host, "cmdline.txt")
}

/// Identity of a setting: `dtparam=i2c_arm=on` is keyed on `dtparam=i2c_arm`,
/// anything else on the part before the first `=`.
fn setting_key(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
        return None;
    }
    let first = line.find('=')?;
    let key = &line[..first];
    if key == "dtparam" || key == "dtoverlay" {
        match line[first + 1..].find('=') {
            Some(second) => Some(&line[..first + 1 + second]),
            None => Some(line),
        }
    } else {
        Some(key)
    }
}

fn last_section(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| l.starts_with('[') && l.ends_with(']'))
}

/// Makes sure `line` is active in config.txt text.
pub fn ensure_setting(text: &str, line: &str) -> String {
    let Some(wanted) = setting_key(line) else {
        return text.to_string();
    };
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();

    if let Some(slot) = lines.iter().position(|l| setting_key(l) == Some(wanted)) {
        lines[slot] = line.to_string();
    } else if let Some(slot) = lines.iter().position(|l| {
        l.trim_start()
            .strip_prefix('#')
            .and_then(|rest| setting_key(rest))
            == Some(wanted)
    }) {
        lines[slot] = line.to_string();
    } else {
        if last_section(&lines).is_some_and(|s| s != "[all]") {
            lines.push(String::new());
            lines.push("[all]".to_string());
        }
        lines.push(line.to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Drops serial login console tokens, keeping the rest of the single line.
pub fn strip_serial_console(cmdline: &str) -> String {
    let kept: Vec<&str> = cmdline
        .split_whitespace()
        .filter(|token| !SERIAL_CONSOLE.is_match(token))
        .collect();
    format!("{}\n", kept.join(" "))
}

pub fn has_serial_console(cmdline: &str) -> bool {
    strip_serial_console(cmdline).trim() != cmdline.trim()
}

/// `raspi-config nonint` wrapper.
pub struct RaspiConfig<'h, 'a> {
    host: &'h Host<'a>,
}

impl<'h, 'a> RaspiConfig<'h, 'a> {
    pub fn detect(host: &'h Host<'a>) -> Option<Self> {
        host.has_program("raspi-config").then_some(Self { host })
    }

    /// `get_<name>` prints `0` for "on".
    pub fn enabled(&self, name: &str) -> Result<bool> {
        let out = self
            .host
            .query(Cmd::new("raspi-config").arg("nonint").arg(format!("get_{}", name)))?;
        Ok(out.success && out.stdout.trim() == "0")
    }

    pub fn run(&self, function: &str, args: &[&str]) -> Result<()> {
        self.host.exec(
            Cmd::new("raspi-config")
                .args(["nonint", function])
                .args(args.iter().copied()),
        )
    }

    pub fn run_secret(&self, function: &str, args: &[&str]) -> Result<()> {
        self.host.exec(
            Cmd::new("raspi-config")
                .args(["nonint", function])
                .args(args.iter().copied())
                .secret(),
        )
    }
}

/// Turns on the ARM I2C bus. Returns whether anything changed (reboot needed).
pub fn enable_i2c(host: &Host<'_>) -> Result<bool> {
    if let Some(raspi) = RaspiConfig::detect(host) {
        if raspi.enabled("i2c")? {
            return Ok(false);
        }
        raspi.run("do_i2c", &["0"])?;
        return Ok(true);
    }

    let config = config_txt(host);
    let changed = host.edit_file(&config, 0o755, |t| ensure_setting(t, "dtparam=i2c_arm=on"))?;
    let module = host.edit_file("/etc/modules", 0o644, |t| {
        if t.lines().any(|l| l.trim() == "i2c-dev") {
            t.to_string()
        } else {
            let mut out = t.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("i2c-dev\n");
            out
        }
    })?;
    Ok(changed || module)
}

/// Enables the UART and frees it from the login console.
pub fn enable_serial_hardware(host: &Host<'_>) -> Result<bool> {
    if let Some(raspi) = RaspiConfig::detect(host) {
        let mut changed = false;
        if !raspi.enabled("serial_hw")? {
            raspi.run("do_serial_hw", &["0"])?;
            changed = true;
        }
        if raspi.enabled("serial_cons")? {
            raspi.run("do_serial_cons", &["1"])?;
            changed = true;
        }
        return Ok(changed);
    }

    let config = config_txt(host);
    let uart = host.edit_file(&config, 0o755, |t| ensure_setting(t, "enable_uart=1"))?;
    let cmdline = cmdline_txt(host);
    let console = match host.read_file(&cmdline)? {
        Some(text) if has_serial_console(&text) => {
            host.edit_file(&cmdline, 0o755, strip_serial_console)?
        }
        _ => false,
    };
    Ok(uart || console)
}

/// Gives the serial port back to the login console.
pub fn restore_serial_console(host: &Host<'_>) -> Result<bool> {
    if let Some(raspi) = RaspiConfig::detect(host) {
        if raspi.enabled("serial_cons")? {
            return Ok(false);
        }
        raspi.run("do_serial_cons", &["0"])?;
        return Ok(true);
    }
    host.restore_backup(&cmdline_txt(host))
}

/// `enable_uart` as set in config.txt, for status output.
pub fn uart_enabled(host: &Host<'_>) -> Result<bool> {
    let text = host.read_file(&config_txt(host))?.unwrap_or_default();
    Ok(kvconf::get(&text, "enable_uart").as_deref() == Some("1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CmdOutput;
    use crate::testutil::{self, RecordingRunner};

    const CONFIG: &str = "\
# For more options and information see
# http://rptl.io/configtxt
#dtparam=i2c_arm=on
#dtparam=spi=on
dtparam=audio=on

[cm4]
otg_mode=1
";

    #[test]
    fn uncomments_matching_dtparam_only() {
        let out = ensure_setting(CONFIG, "dtparam=i2c_arm=on");
        assert!(out.contains("\ndtparam=i2c_arm=on\n#dtparam=spi=on\ndtparam=audio=on\n"));
        assert_eq!(ensure_setting(&out, "dtparam=i2c_arm=on"), out);
    }

    #[test]
    fn appends_under_all_section() {
        let out = ensure_setting(CONFIG, "enable_uart=1");
        assert!(out.ends_with("otg_mode=1\n\n[all]\nenable_uart=1\n"));

        let again = ensure_setting(&out, "dtparam=i2c_arm=off");
        assert!(again.contains("\ndtparam=i2c_arm=off\n"));
        assert_eq!(again.matches("[all]").count(), 1);
    }

    #[test]
    fn replaces_existing_value() {
        let out = ensure_setting("enable_uart=0\n", "enable_uart=1");
        assert_eq!(out, "enable_uart=1\n");
        assert_eq!(ensure_setting("", "enable_uart=1"), "enable_uart=1\n");
    }

    #[test]
    fn strips_only_serial_console() {
        let cmdline = "console=serial0,115200 console=tty1 root=PARTUUID=deadbeef-02 rootfstype=ext4 fsck.repair=yes rootwait\n";
        let out = strip_serial_console(cmdline);
        assert_eq!(out, "console=tty1 root=PARTUUID=deadbeef-02 rootfstype=ext4 fsck.repair=yes rootwait\n");
        assert!(has_serial_console(cmdline));
        assert!(!has_serial_console(&out));
    }

    #[test]
    fn serial_fallback_edits_boot_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let host = testutil::host(&dir, &runner);
        testutil::put(&dir, "/boot/firmware/config.txt", CONFIG);
        testutil::put(&dir, "/boot/firmware/cmdline.txt", "console=serial0,115200 console=tty1 rootwait\n");

        assert!(enable_serial_hardware(&host).unwrap());
        assert!(testutil::read(&dir, "/boot/firmware/config.txt").ends_with("enable_uart=1\n"));
        assert_eq!(testutil::read(&dir, "/boot/firmware/cmdline.txt"), "console=tty1 rootwait\n");
        assert!(uart_enabled(&host).unwrap());
        assert!(!enable_serial_hardware(&host).unwrap());

        assert!(restore_serial_console(&host).unwrap());
        assert!(testutil::read(&dir, "/boot/firmware/cmdline.txt").starts_with("console=serial0"));
    }

    #[test]
    fn raspi_config_skips_when_already_on() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.respond("raspi-config nonint get_i2c", CmdOutput::ok("0\n"));
        testutil::install_program(&dir, "raspi-config");
        let host = testutil::host(&dir, &runner);

        assert!(!enable_i2c(&host).unwrap());
        assert_eq!(runner.calls(), vec!["raspi-config nonint get_i2c"]);
    }

    #[test]
    fn i2c_fallback_loads_module_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let host = testutil::host(&dir, &runner);
        testutil::put(&dir, "/boot/config.txt", CONFIG);
        testutil::put(&dir, "/etc/modules", "# modules to load\n");

        assert!(enable_i2c(&host).unwrap());
        assert_eq!(testutil::read(&dir, "/etc/modules"), "# modules to load\ni2c-dev\n");
        assert!(!enable_i2c(&host).unwrap());
    }
}
