//! Rotating JSON-lines file sink.
//!
//! One line per event, rotated after `max_records` lines: the current file
//! becomes `<path>.1`, existing backups shift `.N` → `.N+1` (oldest first so
//! renames never clobber), and anything past `max_backups` is deleted.
//! Writes and rotations are synchronous; the dispatcher calls them inline.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

pub struct FileWriter {
    path: PathBuf,
    max_records: usize,
    max_backups: usize,
    file: Option<File>,
    count: usize,
}

impl FileWriter {
    pub fn new(path: PathBuf, max_records: usize, max_backups: usize) -> Self {
        Self {
            path,
            max_records,
            max_backups: max_backups.max(1),
            file: None,
            count: 0,
        }
    }

    /// Append one line, rotating when the record threshold is reached.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        if self.file.is_none() {
            self.open()?;
        }
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{line}")
                .with_context(|| format!("write to {}", self.path.display()))?;
        }

        self.count += 1;
        if self.count >= self.max_records {
            self.rotate()?;
        }
        Ok(())
    }

    /// Flush and close the current file.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .with_context(|| format!("flush {}", self.path.display()))?;
        }
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        // A leftover file from a previous run is rotated away, not appended to.
        if self.path.exists() {
            self.shift_backups();
            if let Err(e) = fs::rename(&self.path, backup_path(&self.path, 1)) {
                debug!(path = %self.path.display(), error = %e, "startup rotation failed");
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        self.file = Some(file);
        self.count = 0;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.file = None;

        self.shift_backups();
        if let Err(e) = fs::rename(&self.path, backup_path(&self.path, 1)) {
            debug!(path = %self.path.display(), error = %e, "rotation rename failed");
        }

        self.open()
    }

    /// Shift existing backups `.N` → `.N+1`, deleting the ones that would
    /// exceed `max_backups`. Highest index first so renames never clobber.
    fn shift_backups(&self) {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let Some(base) = self.path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return;
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };

        let prefix = format!("{base}.");
        let mut backup_nums: Vec<usize> = entries
            .flatten()
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .strip_prefix(&prefix)
                    .and_then(|suffix| suffix.parse::<usize>().ok())
            })
            .filter(|&n| n > 0)
            .collect();
        backup_nums.sort_unstable_by(|a, b| b.cmp(a));

        for num in backup_nums {
            let old = backup_path(&self.path, num);
            if num + 1 > self.max_backups {
                let _ = fs::remove_file(&old);
            } else {
                let _ = fs::rename(&old, backup_path(&self.path, num + 1));
            }
        }
    }
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}
