//! File writes with backup-before-modify.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::exec::Host;
use crate::ui;

const BACKUP_SUFFIX: &str = "pi-provision.bak";

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Writes through a temp file in the target directory, then renames it into place.
pub fn write_atomic(path: &Path, contents: &str, mode: u32) -> Result<()> {
    let parent = path.parent().context("Target path has no parent directory")?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move new file into {}", path.display()))?;
    Ok(())
}

/// Keeps the first pristine copy of `path`; later calls leave it alone.
pub fn backup_once(path: &Path) -> Result<Option<PathBuf>> {
    let backup = backup_path(path);
    if !path.exists() || backup.exists() {
        return Ok(None);
    }
    fs::copy(path, &backup)
        .with_context(|| format!("Failed to back up {}", path.display()))?;
    Ok(Some(backup))
}

pub fn restore_backup(path: &Path) -> Result<bool> {
    let backup = backup_path(path);
    if !backup.exists() {
        return Ok(false);
    }
    fs::rename(&backup, path)
        .with_context(|| format!("Failed to restore {}", path.display()))?;
    Ok(true)
}

pub fn discard_backup(path: &Path) -> Result<bool> {
    let backup = backup_path(path);
    if !backup.exists() {
        return Ok(false);
    }
    fs::remove_file(&backup)
        .with_context(|| format!("Failed to remove {}", backup.display()))?;
    Ok(true)
}

impl Host<'_> {
    /// `None` when the file does not exist.
    pub fn read_file(&self, abs: &str) -> Result<Option<String>> {
        let path = self.path(abs);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    pub fn write_file(&self, abs: &str, contents: &str, mode: u32) -> Result<()> {
        if self.dry_run {
            ui::would("write", &format!("{} ({} bytes, mode {:o})", abs, contents.len(), mode));
            return Ok(());
        }
        log::debug!("write: {}", abs);
        write_atomic(&self.path(abs), contents, mode)
    }

    /// Applies `edit` to the file's text (empty when missing). Backs up the
    /// original and writes only when the text changed.
    pub fn edit_file<F>(&self, abs: &str, mode: u32, edit: F) -> Result<bool>
    where
        F: FnOnce(&str) -> String,
    {
        let current = self.read_file(abs)?.unwrap_or_default();
        let updated = edit(&current);
        if updated == current {
            return Ok(false);
        }
        if self.dry_run {
            ui::would("modify", abs);
            return Ok(true);
        }
        if let Some(backup) = backup_once(&self.path(abs))? {
            log::info!("backed up {} to {}", abs, backup.display());
        }
        self.write_file(abs, &updated, mode)?;
        Ok(true)
    }

    pub fn remove_file(&self, abs: &str) -> Result<bool> {
        let path = self.path(abs);
        if !path.exists() {
            return Ok(false);
        }
        if self.dry_run {
            ui::would("remove", abs);
            return Ok(true);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(true)
    }

    /// Copies a local file (usually our own executable) onto the target.
    /// Returns false when the target already holds the same bytes.
    pub fn install_file(&self, src: &Path, abs: &str, mode: u32) -> Result<bool> {
        let dest = self.path(abs);
        if fs::canonicalize(src).ok() == fs::canonicalize(&dest).ok() && dest.exists() {
            return Ok(false);
        }
        let bytes = fs::read(src).with_context(|| format!("Failed to read {}", src.display()))?;
        if fs::read(&dest).ok().as_deref() == Some(bytes.as_slice()) {
            return Ok(false);
        }
        if self.dry_run {
            ui::would("install", &format!("{} -> {}", src.display(), abs));
            return Ok(true);
        }
        let parent = dest.parent().context("Target path has no parent directory")?;
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(mode))?;
        tmp.persist(&dest)
            .with_context(|| format!("Failed to install {}", dest.display()))?;
        Ok(true)
    }

    pub fn restore_backup(&self, abs: &str) -> Result<bool> {
        if self.dry_run {
            let present = backup_path(&self.path(abs)).exists();
            if present {
                ui::would("restore", &format!("{} from backup", abs));
            }
            return Ok(present);
        }
        restore_backup(&self.path(abs))
    }

    pub fn discard_backup(&self, abs: &str) -> Result<bool> {
        if self.dry_run {
            return Ok(backup_path(&self.path(abs)).exists());
        }
        discard_backup(&self.path(abs))
    }
}
