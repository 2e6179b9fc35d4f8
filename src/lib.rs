//! Raspberry Pi provisioning toolkit.
//!
//! Shared plumbing for the `pi-setup`, `pi-power` and `pi-gps` binaries:
//! command execution with dry-run support, backup-before-modify file edits,
//! package and service management, and the Pi specific steps built on top.

pub mod apt;
pub mod boot;
pub mod cli;
pub mod config;
pub mod cron;
pub mod exec;
pub mod fsops;
pub mod gps;
pub mod kvconf;
pub mod power;
pub mod reboot;
pub mod system;
pub mod systemd;
pub mod ui;

#[cfg(test)]
pub(crate) mod testutil;
