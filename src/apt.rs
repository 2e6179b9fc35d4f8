//! Conditional package installs through apt.

use anyhow::Result;

use crate::exec::{Cmd, Host};
use crate::ui;

pub fn is_installed(host: &Host<'_>, package: &str) -> Result<bool> {
    let out = host.query(Cmd::new("dpkg-query").args(["-W", "-f=${Status}", package]))?;
    Ok(out.success && out.stdout.contains("install ok installed"))
}

fn apt_get<'a>(args: impl IntoIterator<Item = &'a str>) -> Cmd {
    Cmd::new("env")
        .args(["DEBIAN_FRONTEND=noninteractive", "apt-get"])
        .args(args)
}

fn partition(host: &Host<'_>, packages: &[&str]) -> Result<(Vec<String>, Vec<String>)> {
    let mut installed = Vec::new();
    let mut missing = Vec::new();
    for &package in packages {
        if is_installed(host, package)? {
            installed.push(package.to_string());
        } else {
            missing.push(package.to_string());
        }
    }
    Ok((installed, missing))
}

/// Installs whichever of `packages` are missing. Returns what was installed.
pub fn install(host: &Host<'_>, packages: &[&str]) -> Result<Vec<String>> {
    let (_, missing) = partition(host, packages)?;
    if missing.is_empty() {
        ui::skip(&format!("Already installed: {}", packages.join(" ")));
        return Ok(missing);
    }

    ui::info(&format!("Installing {}", missing.join(" ")));
    host.exec(apt_get(["update"]))?;
    host.exec(
        apt_get(["install", "-y", "--no-install-recommends"])
            .args(missing.iter().cloned()),
    )?;
    ui::ok(&format!("Installed {}", missing.join(" ")));
    Ok(missing)
}

/// Purges whichever of `packages` are installed. Returns what was removed.
pub fn purge(host: &Host<'_>, packages: &[&str]) -> Result<Vec<String>> {
    let (installed, _) = partition(host, packages)?;
    if installed.is_empty() {
        ui::skip(&format!("Not installed: {}", packages.join(" ")));
        return Ok(installed);
    }

    host.exec(apt_get(["purge", "-y"]).args(installed.iter().cloned()))?;
    host.exec_lenient(apt_get(["autoremove", "-y"]));
    ui::ok(&format!("Removed {}", installed.join(" ")));
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CmdOutput;
    use crate::testutil::{self, RecordingRunner};

    fn installed(runner: &RecordingRunner, package: &str) {
        runner.respond(
            &format!("dpkg-query -W -f=${{Status}} {}", package),
            CmdOutput::ok("install ok installed"),
        );
    }

    #[test]
    fn installs_only_missing_packages() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        installed(&runner, "gpsd");
        runner.respond("dpkg-query -W -f=${Status} gpsd-clients", CmdOutput { success: false, ..Default::default() });
        let host = testutil::host(&dir, &runner);

        let got = install(&host, &["gpsd", "gpsd-clients"]).unwrap();
        assert_eq!(got, vec!["gpsd-clients"]);
        let calls = runner.calls();
        assert!(calls.contains(&"env DEBIAN_FRONTEND=noninteractive apt-get update".to_string()));
        assert!(calls.contains(
            &"env DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends gpsd-clients".to_string()
        ));
    }

    #[test]
    fn nothing_missing_skips_apt() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        installed(&runner, "git");
        let host = testutil::host(&dir, &runner);

        assert!(install(&host, &["git"]).unwrap().is_empty());
        assert!(runner.calls().iter().all(|c| !c.contains("apt-get")));
    }

    #[test]
    fn purge_skips_absent_packages() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        installed(&runner, "gpsd");
        let host = testutil::host(&dir, &runner);

        assert_eq!(purge(&host, &["gpsd", "gpsd-clients"]).unwrap(), vec!["gpsd"]);
        assert!(runner.calls().contains(&"env DEBIAN_FRONTEND=noninteractive apt-get purge -y gpsd".to_string()));
    }
}
