#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use pi_provision::exec::{Cmd, CmdOutput, CommandRunner, Host};
use tempfile::TempDir;

pub const STOCK_GPSD_DEFAULTS: &str = "\
# Devices gpsd should collect to at boot time.
# They need to be read/writeable, either by user gpsd or the group dialout.
DEVICES=\"\"

# Other options you want to pass to gpsd
GPSD_OPTIONS=\"\"

# Automatically hot add/remove USB GPS devices via gpsdctl
USBAUTO=\"true\"
";

pub const CONFIG_TXT: &str = "\
# For more options and information see
# http://rptl.io/configtxt
#dtparam=i2c_arm=on
#dtparam=spi=on
dtparam=audio=on

[cm4]
otg_mode=1
";

pub const CMDLINE_TXT: &str =
    "console=serial0,115200 console=tty1 root=PARTUUID=deadbeef-02 rootfstype=ext4 fsck.repair=yes rootwait\n";

#[derive(Default)]
struct State {
    calls: Vec<Cmd>,
    packages: BTreeSet<String>,
    active: BTreeSet<String>,
    crontab: Option<String>,
}

/// Pretends to be a Raspberry Pi OS image: apt, systemd and cron keep state
/// between calls, and installing gpsd drops its stock defaults file.
pub struct FakePi {
    pub dir: TempDir,
    state: RefCell<State>,
}

fn render(cmd: &Cmd) -> String {
    std::iter::once(cmd.program.as_str())
        .chain(cmd.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn failed(stderr: &str) -> CmdOutput {
    CmdOutput { success: false, stdout: String::new(), stderr: stderr.to_string() }
}

impl FakePi {
    pub fn new() -> Self {
        let pi = Self { dir: tempfile::tempdir().unwrap(), state: RefCell::new(State::default()) };
        pi.put("/boot/firmware/config.txt", CONFIG_TXT);
        pi.put("/boot/firmware/cmdline.txt", CMDLINE_TXT);
        pi.put("/etc/hostname", "raspberrypi\n");
        pi.put("/etc/hosts", "127.0.0.1\tlocalhost\n127.0.1.1\t\traspberrypi\n");
        pi.put("/etc/passwd", "root:x:0:0:root:/root:/bin/bash\npi:x:1000:1000:,,,:/home/pi:/bin/bash\n");
        pi.put("/etc/modules", "# /etc/modules: kernel modules to load at boot time.\n");
        pi.put("/sys/class/thermal/thermal_zone0/temp", "61250\n");
        pi
    }

    pub fn host(&self) -> Host<'_> {
        Host::new(self.dir.path().to_path_buf(), self, false, false)
    }

    pub fn dry_host(&self) -> Host<'_> {
        Host::new(self.dir.path().to_path_buf(), self, true, false)
    }

    pub fn path(&self, abs: &str) -> PathBuf {
        self.dir.path().join(abs.trim_start_matches('/'))
    }

    pub fn put(&self, abs: &str, contents: &str) {
        let path = self.path(abs);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    pub fn read(&self, abs: &str) -> String {
        std::fs::read_to_string(self.path(abs)).unwrap()
    }

    pub fn exists(&self, abs: &str) -> bool {
        self.path(abs).exists()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.iter().map(render).collect()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn crontab(&self) -> String {
        self.state.borrow().crontab.clone().unwrap_or_default()
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.state.borrow().packages.contains(name)
    }

    pub fn is_active(&self, unit: &str) -> bool {
        self.state.borrow().active.contains(unit)
    }

    fn apt(&self, state: &mut State, args: &[String]) -> CmdOutput {
        let Some(verb) = args.iter().find(|a| !a.starts_with('-')) else {
            return failed("apt-get: no verb");
        };
        let names = args.iter().skip_while(|a| *a != verb).skip(1).filter(|a| !a.starts_with('-'));
        match verb.as_str() {
            "install" => {
                for name in names {
                    if name == "gpsd" {
                        self.put("/etc/default/gpsd", STOCK_GPSD_DEFAULTS);
                    }
                    state.packages.insert(name.clone());
                }
            }
            "purge" => {
                for name in names {
                    if name == "gpsd" {
                        let _ = std::fs::remove_file(self.path("/etc/default/gpsd"));
                    }
                    state.packages.remove(name);
                }
            }
            _ => {}
        }
        CmdOutput::ok("")
    }

    fn systemctl(&self, state: &mut State, args: &[String]) -> CmdOutput {
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["enable", "--now", unit] | ["restart", unit] => {
                state.active.insert(unit.to_string());
                CmdOutput::ok("")
            }
            ["disable", "--now", unit] => {
                if state.active.remove(*unit) {
                    CmdOutput::ok("")
                } else {
                    failed(&format!("Failed to disable unit: Unit file {} does not exist.", unit))
                }
            }
            ["is-active", unit] => {
                let text = if state.active.contains(*unit) { "active\n" } else { "inactive\n" };
                CmdOutput { success: state.active.contains(*unit), stdout: text.into(), stderr: String::new() }
            }
            _ => CmdOutput::ok(""),
        }
    }
}

impl CommandRunner for FakePi {
    fn run(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
        let mut state = self.state.borrow_mut();
        state.calls.push(cmd.clone());
        let args = &cmd.args;
        let out = match cmd.program.as_str() {
            "id" => CmdOutput::ok("0\n"),
            "dpkg-query" => {
                let name = args.last().cloned().unwrap_or_default();
                if state.packages.contains(&name) {
                    CmdOutput::ok("install ok installed")
                } else {
                    failed(&format!("dpkg-query: no packages found matching {}", name))
                }
            }
            "env" if args.get(1).map(String::as_str) == Some("apt-get") => self.apt(&mut state, &args[2..]),
            "systemctl" => self.systemctl(&mut state, args),
            "crontab" if args.first().map(String::as_str) == Some("-l") => match &state.crontab {
                Some(tab) => CmdOutput::ok(tab),
                None => failed("no crontab for root"),
            },
            "crontab" => {
                state.crontab = Some(cmd.stdin.clone().unwrap_or_default());
                CmdOutput::ok("")
            }
            _ => CmdOutput::ok(""),
        };
        Ok(out)
    }
}

/// A stand-in for the running executable that install copies into place.
pub fn fake_exe(dir: &Path) -> PathBuf {
    let exe = dir.join("self-exe");
    std::fs::write(&exe, "#!/bin/sh\necho pi-provision\n").unwrap();
    exe
}
