use std::cell::RefCell;
use std::path::Path;
use tempfile::TempDir;

use crate::exec::{Cmd, CmdOutput, CommandRunner, Host};

/// Records every command and answers with canned output keyed by the
/// leading words of the rendered command line. Unknown commands succeed with
/// empty output.
pub struct RecordingRunner {
    calls: RefCell<Vec<Cmd>>,
    responses: RefCell<Vec<(String, CmdOutput)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self { calls: RefCell::new(Vec::new()), responses: RefCell::new(Vec::new()) }
    }

    /// Later registrations win over earlier ones for the same prefix.
    pub fn respond(&self, prefix: &str, output: CmdOutput) {
        self.responses.borrow_mut().insert(0, (prefix.to_string(), output));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(render).collect()
    }

    pub fn commands(&self) -> Vec<Cmd> {
        self.calls.borrow().clone()
    }
}

fn render(cmd: &Cmd) -> String {
    std::iter::once(cmd.program.as_str())
        .chain(cmd.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

impl CommandRunner for RecordingRunner {
    fn run(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
        self.calls.borrow_mut().push(cmd.clone());
        let line = render(cmd);
        let found = self
            .responses
            .borrow()
            .iter()
            .find(|(prefix, _)| line == *prefix || line.starts_with(&format!("{} ", prefix)))
            .map(|(_, out)| out.clone());
        Ok(found.unwrap_or_else(|| CmdOutput::ok("")))
    }
}

pub fn host<'a>(dir: &TempDir, runner: &'a RecordingRunner) -> Host<'a> {
    Host::new(dir.path().to_path_buf(), runner, false, false)
}

pub fn put(dir: &TempDir, abs: &str, contents: &str) {
    let path = dir.path().join(abs.trim_start_matches('/'));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

pub fn read(dir: &TempDir, abs: &str) -> String {
    std::fs::read_to_string(dir.path().join(abs.trim_start_matches('/'))).unwrap()
}

pub fn exists(dir: &TempDir, abs: &str) -> bool {
    Path::new(&dir.path().join(abs.trim_start_matches('/'))).exists()
}

/// Makes `has_program(name)` true under the test root.
pub fn install_program(dir: &TempDir, name: &str) {
    put(dir, &format!("/usr/bin/{}", name), "#!/bin/sh\n");
}
