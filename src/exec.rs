//! Command execution and the target-system handle.
//!
//! All external programs go through a [`CommandRunner`] so that `--dry-run`
//! and tests never touch the machine. File paths go through [`Host::path`]
//! so an alternate root (an image mount, a test directory) can stand in for `/`.

use anyhow::{Context, Result, anyhow};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::ui;

/// Directories searched by [`Host::has_program`].
const PROGRAM_DIRS: &[&str] = &[
    "/usr/local/sbin", "/usr/local/bin", "/usr/sbin", "/usr/bin", "/sbin", "/bin",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// Arguments carry credentials; never print them.
    pub secret: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            secret: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        if self.secret {
            return write!(f, " <redacted>");
        }
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: &str) -> Self {
        Self { success: true, stdout: stdout.to_string(), stderr: String::new() }
    }
}

pub trait CommandRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput>;
}

/// Spawns real processes.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", cmd.program))?;

        if let Some(input) = &cmd.stdin {
            child
                .stdin
                .take()
                .context("stdin pipe missing")?
                .write_all(input.as_bytes())
                .with_context(|| format!("Failed to write stdin of {}", cmd.program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd.program))?;
        Ok(CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// The machine being provisioned.
pub struct Host<'a> {
    pub root: PathBuf,
    pub runner: &'a dyn CommandRunner,
    pub dry_run: bool,
    pub interactive: bool,
}

impl<'a> Host<'a> {
    pub fn new(root: PathBuf, runner: &'a dyn CommandRunner, dry_run: bool, interactive: bool) -> Self {
        Self { root, runner, dry_run, interactive }
    }

    /// Maps an absolute system path under the configured root.
    pub fn path(&self, abs: impl AsRef<Path>) -> PathBuf {
        let abs = abs.as_ref();
        let relative = abs.strip_prefix("/").unwrap_or(abs);
        self.root.join(relative)
    }

    /// Runs a mutating command. Non-zero exit is an error.
    pub fn exec(&self, cmd: Cmd) -> Result<()> {
        if self.dry_run {
            ui::would("run", &cmd.to_string());
            return Ok(());
        }
        log::debug!("exec: {}", cmd);
        let out = self.runner.run(&cmd)?;
        if !out.success {
            let stderr = out.stderr.trim();
            return Err(anyhow!(
                "Command failed: {}{}",
                cmd,
                if stderr.is_empty() { String::new() } else { format!(": {}", stderr) }
            ));
        }
        Ok(())
    }

    /// Like [`Host::exec`] but a failure only warns. Returns whether it worked.
    pub fn exec_lenient(&self, cmd: Cmd) -> bool {
        let shown = cmd.to_string();
        match self.exec(cmd) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("ignored failure: {:#}", e);
                ui::warn(&format!("{} failed (continuing)", shown));
                false
            }
        }
    }

    /// Runs a read-only command, also under `--dry-run`.
    pub fn query(&self, cmd: Cmd) -> Result<CmdOutput> {
        log::debug!("query: {}", cmd);
        self.runner.run(&cmd)
    }

    pub fn has_program(&self, name: &str) -> bool {
        PROGRAM_DIRS
            .iter()
            .any(|dir| self.path(Path::new(dir).join(name)).is_file())
    }

    pub fn ensure_root(&self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let out = self.query(Cmd::new("id").arg("-u"))?;
        if out.stdout.trim() != "0" {
            let tool = std::env::args().next().unwrap_or_else(|| "this tool".to_string());
            return Err(anyhow!("Root privileges are required. Try: sudo {} ...", tool));
        }
        Ok(())
    }
}
