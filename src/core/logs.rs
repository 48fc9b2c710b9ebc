//! Per-instance log files with size-capped rotation

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::settings::EngineSettings;

/// Rotates `<dir>/<name>.log` into `<name>.log.1` .. `<name>.log.<keep>`
#[derive(Debug, Clone)]
pub struct LogRotator {
    dir: PathBuf,
    max_bytes: u64,
    keep: usize,
}

impl LogRotator {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            keep: keep.max(1),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.get_logs_directory(),
            settings.log_max_bytes,
            settings.log_keep,
        )
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.log", name))
    }

    pub fn rotated_path(&self, name: &str, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", name, index))
    }

    fn needs_rotation(&self, path: &Path) -> bool {
        self.max_bytes > 0
            && std::fs::metadata(path)
                .map(|m| m.len() >= self.max_bytes)
                .unwrap_or(false)
    }

    /// Shift `.1..keep-1` up by one, dropping the oldest
    fn shift(&self, name: &str) -> io::Result<()> {
        let oldest = self.rotated_path(name, self.keep);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for index in (1..self.keep).rev() {
            let from = self.rotated_path(name, index);
            if from.exists() {
                std::fs::rename(&from, self.rotated_path(name, index + 1))?;
            }
        }
        Ok(())
    }

    /// Rename-based rotation; only safe while no process writes the file
    pub fn rotate_if_needed(&self, name: &str) -> io::Result<bool> {
        let path = self.log_path(name);
        if !self.needs_rotation(&path) {
            return Ok(false);
        }
        self.shift(name)?;
        std::fs::rename(&path, self.rotated_path(name, 1))?;
        info!(instance = name, "Rotated log file");
        Ok(true)
    }

    /// Copy-then-truncate rotation for logs a live process appends to
    pub fn copy_truncate_if_needed(&self, name: &str) -> io::Result<bool> {
        let path = self.log_path(name);
        if !self.needs_rotation(&path) {
            return Ok(false);
        }
        self.shift(name)?;
        std::fs::copy(&path, self.rotated_path(name, 1))?;
        OpenOptions::new().write(true).open(&path)?.set_len(0)?;
        debug!(instance = name, "Copy-truncated log file");
        Ok(true)
    }

    /// Open the instance log for appending, rotating first if it is oversized
    pub fn open_for_append(&self, name: &str) -> io::Result<File> {
        std::fs::create_dir_all(&self.dir)?;
        self.rotate_if_needed(name)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(name))
    }
}
