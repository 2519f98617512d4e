use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, info, warn};

use super::text_buffer::{BufferEvent, TextBuffer};
use crate::clock::{Clock, SystemClock};
use crate::config::BufferConfig;
use crate::error::{BufferError, Result};

/// Numbered backups tried after `<path>~` is taken.
const MAX_BACKUP_SUFFIX: usize = 15;

impl TextBuffer {
    /// Opens `path`. A missing file yields an empty buffer that will be
    /// created on first save.
    pub fn load(path: impl AsRef<Path>, config: BufferConfig) -> Result<Self> {
        Self::load_with_clock(path, config, Rc::new(SystemClock))
    }

    pub fn load_with_clock(
        path: impl AsRef<Path>,
        config: BufferConfig,
        clock: Rc<dyn Clock>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = if path.exists() {
            fs::read_to_string(path)?
        } else {
            String::new()
        };
        info!(path = %path.display(), bytes = text.len(), "loaded buffer");

        let mut buffer = Self::with_clock(&text, config, clock);
        buffer.path = Some(path.to_path_buf());
        Ok(buffer)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    pub fn save(&mut self) -> Result<()> {
        let path = self.path.clone().ok_or(BufferError::NoFilePath)?;
        self.save_as(path)
    }

    /// Writes the text to `path` and makes it the buffer's file. With
    /// backups enabled an existing file is copied aside first and put back
    /// if the write fails.
    pub fn save_as(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let text = self.get_text();
        write_with_backup(&path, &text, self.config.backup)?;
        info!(path = %path.display(), bytes = text.len(), "saved buffer");

        self.saved_text = text;
        self.path = Some(path.clone());
        self.emitter.emit(&BufferEvent::DidSave(path));
        Ok(())
    }

    /// Re-reads the file as one undoable edit and marks the buffer unmodified.
    pub fn reload(&mut self) -> Result<()> {
        let path = self.path.clone().ok_or(BufferError::NoFilePath)?;
        let text = fs::read_to_string(&path)?;
        self.set_text(&text)?;
        self.saved_text = text;
        info!(path = %path.display(), "reloaded buffer");
        self.emitter.emit(&BufferEvent::DidReload);
        Ok(())
    }
}

/// First free name among `<path>~`, `<path>~1` .. `<path>~15`.
pub fn backup_path_for(path: &Path) -> Result<PathBuf> {
    let candidates = std::iter::once(String::from("~"))
        .chain((1..=MAX_BACKUP_SUFFIX).map(|suffix| format!("~{suffix}")));
    for suffix in candidates {
        let mut name = OsString::from(path.as_os_str());
        name.push(suffix);
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(BufferError::BackupExhausted(path.to_path_buf()))
}

fn write_with_backup(path: &Path, contents: &str, backup: bool) -> Result<()> {
    write_with_backup_using(path, backup, |path| fs::write(path, contents))
}

fn write_with_backup_using<W>(path: &Path, backup: bool, write: W) -> Result<()>
where
    W: FnOnce(&Path) -> io::Result<()>,
{
    let backup_path = if backup && path.exists() {
        let backup_path = backup_path_for(path)?;
        fs::copy(path, &backup_path)?;
        debug!(backup = %backup_path.display(), "wrote backup");
        Some(backup_path)
    } else {
        None
    };

    if let Err(err) = write(path) {
        if let Some(backup_path) = &backup_path {
            match fs::copy(backup_path, path) {
                Ok(_) => {
                    debug!(backup = %backup_path.display(), "restored backup after failed write");
                    remove_backup(backup_path);
                }
                Err(restore_err) => warn!(
                    backup = %backup_path.display(),
                    %restore_err,
                    "could not restore backup, leaving it in place"
                ),
            }
        }
        return Err(err.into());
    }

    if let Some(backup_path) = &backup_path {
        remove_backup(backup_path);
    }
    Ok(())
}

fn remove_backup(backup_path: &Path) {
    if let Err(err) = fs::remove_file(backup_path) {
        warn!(backup = %backup_path.display(), %err, "could not remove backup");
    }
}
