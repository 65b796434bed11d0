//! Storage root layout and filesystem helpers.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

use crate::error::{Error, Result};

/// Default storage root: `%APPDATA%/LightRAG` on Windows, `~/.lightrag` elsewhere.
pub fn default_storage_dir() -> PathBuf {
    if cfg!(windows) {
        if let Some(dir) = dirs::config_dir() {
            return dir.join("LightRAG");
        }
    }
    match dirs::home_dir() {
        Some(home) => home.join(".lightrag"),
        None => PathBuf::from(".lightrag"),
    }
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} exists and is not a directory",
            path.display()
        )));
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// Probe writability by creating and removing a marker file.
pub fn is_directory_writable(path: &Path) -> bool {
    let probe = path.join(".write_test");
    match fs::write(&probe, b"test") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// `base/workspace`, created on demand.
pub fn working_dir(workspace: &str, base: &Path) -> Result<PathBuf> {
    let dir = base.join(workspace);
    ensure_directory(&dir)?;
    Ok(dir)
}

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    config_override: Option<PathBuf>,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_override: None,
        }
    }

    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_override = path;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_override
            .clone()
            .unwrap_or_else(|| self.root.join("app_config.json"))
    }

    pub fn config_backups_dir(&self) -> PathBuf {
        self.root.join("config_backups")
    }

    pub fn default_working_dir(&self) -> PathBuf {
        self.root.join("rag_storage")
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.root.join("inputs")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lightrag_server.lock")
    }

    pub fn create_all(&self) -> Result<()> {
        ensure_directory(&self.root)?;
        ensure_directory(&self.config_backups_dir())?;
        ensure_directory(&self.default_working_dir())?;
        ensure_directory(&self.inputs_dir())?;
        Ok(())
    }
}

/// Exclusive lock on the storage root, held for the lifetime of the server.
pub struct StorageLock {
    lock_file: Option<File>,
}

impl StorageLock {
    pub fn acquire(layout: &StorageLayout) -> Result<Self> {
        ensure_directory(layout.root())?;
        let path = layout.lock_file();
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        match lock_file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                lock_file: Some(lock_file),
            }),
            Err(_) => Err(Error::StorageLocked(layout.root().display().to_string())),
        }
    }

    pub fn release(&mut self) {
        if let Some(file) = self.lock_file.take() {
            if let Err(err) = file.unlock() {
                warn!("Failed to release storage lock: {err}");
            }
        }
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        self.release();
    }
}
