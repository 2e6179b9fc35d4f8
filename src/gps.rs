//! GPSD install, smoke test and removal.
//!
//! A GPS hat on the Pi's UART needs the serial console moved out of the way,
//! which only takes effect after a reboot. In that case the install finishes
//! through a one-shot `@reboot` cron hook that runs `pi-gps resume`.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::apt;
use crate::boot;
use crate::config::GpsConfig;
use crate::cron;
use crate::exec::Host;
use crate::kvconf;
use crate::systemd;
use crate::ui;

pub const PACKAGES: &[&str] = &["gpsd", "gpsd-clients"];
pub const DEFAULTS_FILE: &str = "/etc/default/gpsd";
pub const BINARY: &str = "/usr/local/bin/pi-gps";
pub const RESUME_TAG: &str = "gps-resume";
const SOCKET_UNIT: &str = "gpsd.socket";
const SERVICE_UNIT: &str = "gpsd.service";
const WATCH: &str = "?WATCH={\"enable\":true,\"json\":true};\n";

pub fn is_serial_device(device: &str) -> bool {
    ["/dev/serial", "/dev/ttyAMA", "/dev/ttyS"]
        .iter()
        .any(|prefix| device.starts_with(prefix))
}

/// `/etc/default/gpsd` with our device and options applied.
pub fn gpsd_defaults(text: &str, gps: &GpsConfig) -> String {
    let usb = if gps.usb_auto { "true" } else { "false" };
    let text = kvconf::set(text, "START_DAEMON", &kvconf::quote("true"));
    let text = kvconf::set(&text, "USBAUTO", &kvconf::quote(usb));
    let text = kvconf::set(&text, "DEVICES", &kvconf::quote(&gps.device));
    kvconf::set(&text, "GPSD_OPTIONS", &kvconf::quote(&gps.gpsd_options))
}

// --- Install / resume / remove ---

#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub reboot_needed: bool,
    pub packages: Vec<String>,
}

pub fn install(host: &Host<'_>, gps: &GpsConfig, exe: &Path) -> Result<InstallReport> {
    ui::step("📦 Installing GPSD...");
    let packages = apt::install(host, PACKAGES)?;

    ui::step("⚙️  Configuring GPSD...");
    if host.edit_file(DEFAULTS_FILE, 0o644, |t| gpsd_defaults(t, gps))? {
        ui::ok(&format!("{} now uses {}", DEFAULTS_FILE, gps.device));
    } else {
        ui::skip(&format!("{} already configured", DEFAULTS_FILE));
    }

    let mut reboot_needed = false;
    if gps.device.split_whitespace().any(is_serial_device) {
        ui::step("🔌 Enabling serial port...");
        reboot_needed = boot::enable_serial_hardware(host)?;
        if reboot_needed {
            ui::ok("UART enabled and serial console disabled");
        } else {
            ui::skip("Serial port already set up");
        }
    }

    if reboot_needed {
        host.install_file(exe, BINARY, 0o755)?;
        let command = format!("{} resume", BINARY);
        cron::install_reboot_hook(host, RESUME_TAG, &command)?;
        ui::ok("GPSD will be started by a one-time hook after the reboot");
    } else {
        start_gpsd(host)?;
    }
    Ok(InstallReport { reboot_needed, packages })
}

fn start_gpsd(host: &Host<'_>) -> Result<()> {
    systemd::enable_now(host, SOCKET_UNIT)?;
    systemd::restart(host, SERVICE_UNIT)?;
    ui::ok("GPSD started");
    Ok(())
}

/// Second half of an install that needed a reboot.
pub fn resume(host: &Host<'_>) -> Result<()> {
    ui::step("▶️  Resuming GPSD setup after reboot...");
    start_gpsd(host)?;
    if cron::remove_reboot_hook(host, RESUME_TAG)? {
        ui::ok("Removed one-time reboot hook");
    }
    Ok(())
}

/// Returns whether a reboot is needed (only when the console was restored).
pub fn remove(host: &Host<'_>, restore_serial: bool) -> Result<bool> {
    ui::step("🧹 Removing GPSD...");
    systemd::disable_now(host, SOCKET_UNIT);
    systemd::disable_now(host, SERVICE_UNIT);
    apt::purge(host, PACKAGES)?;

    // Purging deletes the conffile; a leftover file means gpsd was not ours.
    if host.path(DEFAULTS_FILE).exists() {
        if host.restore_backup(DEFAULTS_FILE)? {
            ui::ok(&format!("Restored original {}", DEFAULTS_FILE));
        }
    } else {
        host.discard_backup(DEFAULTS_FILE)?;
    }

    if cron::remove_reboot_hook(host, RESUME_TAG)? {
        ui::ok("Removed pending reboot hook");
    }
    host.remove_file(BINARY)?;

    let mut reboot_needed = false;
    if restore_serial {
        ui::step("🔌 Restoring serial console...");
        reboot_needed = boot::restore_serial_console(host)?;
        if reboot_needed {
            ui::ok("Serial console restored");
        } else {
            ui::skip("Serial console was not changed");
        }
    }
    Ok(reboot_needed)
}

// --- Test ---

#[derive(Deserialize, Debug)]
pub struct DeviceInfo {
    pub path: Option<String>,
    pub driver: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Satellite {
    #[serde(default)]
    pub used: bool,
}

/// The gpsd reports the test cares about; everything else is `Other`.
#[derive(Deserialize, Debug)]
#[serde(tag = "class")]
pub enum Report {
    #[serde(rename = "VERSION")]
    Version { release: String },
    #[serde(rename = "DEVICES")]
    Devices {
        #[serde(default)]
        devices: Vec<DeviceInfo>,
    },
    #[serde(rename = "DEVICE")]
    Device(DeviceInfo),
    #[serde(rename = "TPV")]
    Tpv {
        #[serde(default)]
        mode: u8,
        time: Option<String>,
        lat: Option<f64>,
        lon: Option<f64>,
        alt: Option<f64>,
        #[serde(rename = "altMSL")]
        alt_msl: Option<f64>,
    },
    #[serde(rename = "SKY")]
    Sky {
        #[serde(default)]
        satellites: Vec<Satellite>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub mode: u8,
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    pub time: Option<String>,
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.mode >= 3 { "3D" } else { "2D" };
        write!(f, "{} fix at {:.6}, {:.6}", kind, self.lat, self.lon)?;
        if let Some(alt) = self.alt {
            write!(f, ", altitude {:.1} m", alt)?;
        }
        if let Some(time) = &self.time {
            write!(f, " ({})", time)?;
        }
        Ok(())
    }
}

/// What has been seen so far on the gpsd stream.
#[derive(Debug, Default)]
pub struct Session {
    pub release: Option<String>,
    pub devices: Vec<String>,
    pub satellites_seen: usize,
    pub satellites_used: usize,
    pub best_mode: u8,
}

impl Session {
    /// Feeds one JSON line; returns a fix once mode is 2D or better.
    pub fn ingest(&mut self, line: &str) -> Option<Fix> {
        let report: Report = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("skipping unparsable gpsd line: {}", e);
                return None;
            }
        };
        match report {
            Report::Version { release } => self.release = Some(release),
            Report::Devices { devices } => {
                for device in devices {
                    self.add_device(device);
                }
            }
            Report::Device(device) => self.add_device(device),
            // Some SKY reports only carry DOP values and no satellite list.
            Report::Sky { satellites } if !satellites.is_empty() => {
                self.satellites_seen = satellites.len();
                self.satellites_used = satellites.iter().filter(|s| s.used).count();
            }
            Report::Tpv { mode, time, lat, lon, alt, alt_msl } => {
                self.best_mode = self.best_mode.max(mode);
                if mode >= 2 {
                    if let (Some(lat), Some(lon)) = (lat, lon) {
                        return Some(Fix { mode, lat, lon, alt: alt_msl.or(alt), time });
                    }
                }
            }
            Report::Sky { .. } | Report::Other => {}
        }
        None
    }

    fn add_device(&mut self, device: DeviceInfo) {
        let Some(path) = device.path else { return };
        let label = match device.driver {
            Some(driver) => format!("{} ({})", path, driver),
            None => path,
        };
        if !self.devices.contains(&label) {
            self.devices.push(label);
        }
    }

    pub fn summary(&self) -> String {
        let release = self.release.as_deref().unwrap_or("no version report");
        let devices = if self.devices.is_empty() { "none".to_string() } else { self.devices.join(", ") };
        format!(
            "gpsd {}; devices: {}; satellites used {}/{} visible; best mode {}",
            release, devices, self.satellites_used, self.satellites_seen, self.best_mode
        )
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Reads reports until a fix arrives, the stream ends, or `deadline` passes.
///
/// `limit_wait` is called before every read with the time left, so a source
/// that goes quiet cannot hold the caller past `deadline`.
pub fn watch<R, F>(mut reader: R, deadline: Instant, session: &mut Session, mut limit_wait: F) -> Result<Option<Fix>>
where
    R: BufRead,
    F: FnMut(Duration) -> std::io::Result<()>,
{
    let mut line = String::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(None);
        }
        limit_wait(left).context("Failed to set the gpsd read timeout")?;
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                if let Some(fix) = session.ingest(line.trim_end()) {
                    return Ok(Some(fix));
                }
            }
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(e).context("Failed reading from gpsd"),
        }
    }
}

pub fn smoke_test(host: &Host<'_>, gps: &GpsConfig) -> Result<Fix> {
    ui::step("🛰️  Testing GPSD...");
    let socket = systemd::is_active(host, SOCKET_UNIT).unwrap_or(false);
    let service = systemd::is_active(host, SERVICE_UNIT).unwrap_or(false);
    if !socket && !service {
        ui::warn("Neither gpsd.socket nor gpsd.service is active");
    }

    let timeout = Duration::from_secs(gps.test_timeout_secs.max(1));
    let addr = (gps.host.as_str(), gps.port)
        .to_socket_addrs()
        .with_context(|| format!("Cannot resolve {}:{}", gps.host, gps.port))?
        .next()
        .ok_or_else(|| anyhow!("No address for {}:{}", gps.host, gps.port))?;
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))
        .with_context(|| format!("Cannot connect to gpsd at {}", addr))?;
    stream.write_all(WATCH.as_bytes()).context("Failed to send WATCH to gpsd")?;
    ui::info(&format!("Connected to {}, waiting up to {}s for a fix...", addr, timeout.as_secs()));

    let mut session = Session::default();
    let control = stream.try_clone().context("Failed to clone the gpsd socket")?;
    let fix = watch(BufReader::new(stream), Instant::now() + timeout, &mut session, |left| {
        control.set_read_timeout(Some(left))
    })?;
    match fix {
        Some(fix) => {
            ui::ok(&fix.to_string());
            ui::info(&session.summary());
            Ok(fix)
        }
        None => bail!("No GPS fix within {}s: {}", timeout.as_secs(), session.summary()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CmdOutput;
    use crate::testutil::{self, RecordingRunner};
    use std::io::Cursor;

    const STREAM: &str = r#"{"class":"VERSION","release":"3.22","rev":"3.22","proto_major":3,"proto_minor":14}
{"class":"DEVICES","devices":[{"class":"DEVICE","path":"/dev/serial0","driver":"NMEA0183","bps":9600}]}
{"class":"WATCH","enable":true,"json":true}
{"class":"SKY","device":"/dev/serial0","satellites":[{"PRN":5,"used":true},{"PRN":7,"used":false},{"PRN":9,"used":true}]}
{"class":"TPV","device":"/dev/serial0","mode":1}
not json at all
{"class":"TPV","device":"/dev/serial0","mode":3,"time":"2026-10-14T12:00:00.000Z","lat":51.5007,"lon":-0.1246,"alt":40.2,"altMSL":35.1}
"#;

    fn gps() -> GpsConfig {
        GpsConfig::default()
    }

    #[test]
    fn defaults_file_is_rewritten() {
        let stock = "START_DAEMON=\"false\"\nUSBAUTO=\"true\"\nDEVICES=\"\"\nGPSD_OPTIONS=\"\"\n";
        let out = gpsd_defaults(stock, &gps());
        assert_eq!(
            out,
            "START_DAEMON=\"true\"\nUSBAUTO=\"true\"\nDEVICES=\"/dev/serial0\"\nGPSD_OPTIONS=\"-n\"\n"
        );
        assert_eq!(gpsd_defaults(&out, &gps()), out);
    }

    #[test]
    fn stream_yields_fix_and_summary() {
        let mut session = Session::default();
        let far = Instant::now() + Duration::from_secs(60);
        let fix = watch(Cursor::new(STREAM), far, &mut session, |_| Ok(())).unwrap().unwrap();

        assert_eq!(fix.mode, 3);
        assert_eq!(fix.alt, Some(35.1));
        assert_eq!(fix.to_string(), "3D fix at 51.500700, -0.124600, altitude 35.1 m (2026-10-14T12:00:00.000Z)");
        assert_eq!(session.release.as_deref(), Some("3.22"));
        assert_eq!(session.devices, vec!["/dev/serial0 (NMEA0183)"]);
        assert_eq!((session.satellites_used, session.satellites_seen), (2, 3));
    }

    #[test]
    fn no_fix_reports_what_was_seen() {
        let partial: String = STREAM.lines().take(5).map(|l| format!("{}\n", l)).collect();
        let mut session = Session::default();
        let far = Instant::now() + Duration::from_secs(60);
        assert!(watch(Cursor::new(partial), far, &mut session, |_| Ok(())).unwrap().is_none());
        assert_eq!(
            session.summary(),
            "gpsd 3.22; devices: /dev/serial0 (NMEA0183); satellites used 2/3 visible; best mode 1"
        );
    }

    #[test]
    fn each_read_waits_only_for_the_time_left() {
        let mut session = Session::default();
        let mut waits = Vec::new();
        let far = Instant::now() + Duration::from_secs(60);
        watch(Cursor::new(STREAM), far, &mut session, |left| {
            waits.push(left);
            Ok(())
        })
        .unwrap();
        assert_eq!(waits.len(), 7);
        assert!(waits.windows(2).all(|w| w[1] <= w[0]));
        assert!(waits.iter().all(|w| *w <= Duration::from_secs(60)));

        let mut called = false;
        let past = Instant::now();
        let fix = watch(Cursor::new(STREAM), past, &mut Session::default(), |_| {
            called = true;
            Ok(())
        });
        assert!(fix.unwrap().is_none());
        assert!(!called);
    }

    #[test]
    fn serial_devices_detected() {
        assert!(is_serial_device("/dev/serial0"));
        assert!(is_serial_device("/dev/ttyAMA0"));
        assert!(!is_serial_device("/dev/ttyUSB0"));
        assert!(!is_serial_device("/dev/ttyACM0"));
    }

    #[test]
    fn usb_install_starts_gpsd_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let host = testutil::host(&dir, &runner);
        testutil::put(&dir, DEFAULTS_FILE, "DEVICES=\"\"\n");
        let usb = GpsConfig { device: "/dev/ttyUSB0".into(), ..gps() };

        let report = install(&host, &usb, Path::new("/nonexistent")).unwrap();
        assert!(!report.reboot_needed);
        assert_eq!(report.packages, vec!["gpsd", "gpsd-clients"]);
        let calls = runner.calls();
        assert!(calls.contains(&"systemctl enable --now gpsd.socket".to_string()));
        assert!(calls.contains(&"systemctl restart gpsd.service".to_string()));
        assert!(testutil::read(&dir, DEFAULTS_FILE).contains("DEVICES=\"/dev/ttyUSB0\""));
        assert!(testutil::exists(&dir, "/etc/default/gpsd.pi-provision.bak"));
    }

    #[test]
    fn serial_install_defers_to_reboot_hook() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.respond("crontab -l", CmdOutput { success: false, ..Default::default() });
        let host = testutil::host(&dir, &runner);
        testutil::put(&dir, "/boot/firmware/config.txt", "[all]\n");
        testutil::put(&dir, "/boot/firmware/cmdline.txt", "console=serial0,115200 console=tty1 rootwait\n");
        let exe = dir.path().join("pi-gps-build");
        std::fs::write(&exe, b"binary").unwrap();

        let report = install(&host, &gps(), &exe).unwrap();
        assert!(report.reboot_needed);
        assert_eq!(testutil::read(&dir, BINARY), "binary");
        let hook = runner.commands().into_iter().find(|c| c.program == "crontab" && c.args == vec!["-"]).unwrap();
        assert_eq!(
            hook.stdin.as_deref(),
            Some("@reboot /usr/local/bin/pi-gps resume # pi-provision:gps-resume\n")
        );
        assert!(!runner.calls().iter().any(|c| c.starts_with("systemctl")));
    }

    #[test]
    fn resume_starts_and_clears_hook() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.respond(
            "crontab -l",
            CmdOutput::ok("@reboot /usr/local/bin/pi-gps resume # pi-provision:gps-resume\n"),
        );
        let host = testutil::host(&dir, &runner);

        resume(&host).unwrap();
        let write = runner.commands().into_iter().find(|c| c.args == vec!["-"]).unwrap();
        assert_eq!(write.stdin.as_deref(), Some(""));
        assert!(runner.calls().contains(&"systemctl restart gpsd.service".to_string()));
    }

    #[test]
    fn remove_purges_and_cleans_backup() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.respond("dpkg-query -W -f=${Status} gpsd", CmdOutput::ok("install ok installed"));
        let host = testutil::host(&dir, &runner);
        testutil::put(&dir, "/etc/default/gpsd.pi-provision.bak", "DEVICES=\"\"\n");

        assert!(!remove(&host, false).unwrap());
        assert!(!testutil::exists(&dir, "/etc/default/gpsd.pi-provision.bak"));
        let calls = runner.calls();
        assert!(calls.contains(&"systemctl disable --now gpsd.socket".to_string()));
        assert!(calls.contains(&"env DEBIAN_FRONTEND=noninteractive apt-get purge -y gpsd".to_string()));
    }
}
