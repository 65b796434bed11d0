//! Persistent configuration file with rolling backups.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{AppConfig, ConfigSection};
use crate::error::{Error, Result};
use crate::paths::ensure_directory;

const KEEP_BACKUPS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ConfigInfo {
    pub config_file: String,
    pub config_dir: String,
    pub backup_dir: String,
    pub exists: bool,
    pub file_size: Option<u64>,
    pub last_modified: Option<String>,
    pub backup_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub size: u64,
    pub modified: String,
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_file: PathBuf,
    backup_dir: PathBuf,
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S_%6f").to_string()
}

fn modified_of(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!("Failed to set permissions on {}: {}", path.display(), err);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}

impl ConfigStore {
    pub fn new(config_file: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn ensure_directories(&self) -> Result<()> {
        if let Some(parent) = self.config_file.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }
        ensure_directory(&self.backup_dir)?;
        restrict_permissions(&self.backup_dir, 0o700);
        Ok(())
    }

    /// Load the configuration, writing defaults when the file is missing.
    ///
    /// An unreadable file is moved aside into the backup directory and
    /// replaced with defaults.
    pub fn load(&self) -> Result<AppConfig> {
        self.ensure_directories()?;
        if !self.config_file.exists() {
            info!("No configuration file at {}, writing defaults", self.config_file.display());
            let config = AppConfig::default();
            self.write_atomic(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.config_file)?;
        match serde_json::from_str::<AppConfig>(&raw) {
            Ok(config) => {
                debug!("Configuration loaded from {}", self.config_file.display());
                Ok(config)
            }
            Err(err) => {
                let corrupted = self.fresh_backup_path("config_corrupted_");
                warn!(
                    "Configuration file is corrupted ({}), moving it to {}",
                    err,
                    corrupted.display()
                );
                fs::rename(&self.config_file, &corrupted)
                    .or_else(|_| fs::copy(&self.config_file, &corrupted).map(|_| ()))?;
                restrict_permissions(&corrupted, 0o600);
                let config = AppConfig::default();
                self.write_atomic(&config)?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        config.validate()?;
        self.ensure_directories()?;
        self.create_backup()?;
        self.write_atomic(config)?;
        info!("Configuration saved to {}", self.config_file.display());
        Ok(())
    }

    fn write_atomic(&self, config: &AppConfig) -> Result<()> {
        let body = serde_json::to_string_pretty(config)?;
        let tmp = self.config_file.with_extension("tmp");
        fs::write(&tmp, body)?;
        restrict_permissions(&tmp, 0o600);
        fs::rename(&tmp, &self.config_file).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            Error::ConfigStorage(format!("Failed to replace configuration file: {err}"))
        })?;
        Ok(())
    }

    /// `<prefix><timestamp>.json`, with a `_N` suffix if that name is already taken.
    fn fresh_backup_path(&self, prefix: &str) -> PathBuf {
        let stamp = timestamp();
        let mut path = self.backup_dir.join(format!("{prefix}{stamp}.json"));
        let mut n = 1;
        while path.exists() {
            path = self.backup_dir.join(format!("{prefix}{stamp}_{n}.json"));
            n += 1;
        }
        path
    }

    fn create_backup(&self) -> Result<Option<PathBuf>> {
        if !self.config_file.exists() {
            return Ok(None);
        }
        let backup = self.fresh_backup_path("config_");
        fs::copy(&self.config_file, &backup)?;
        restrict_permissions(&backup, 0o600);
        self.cleanup_old_backups();
        Ok(Some(backup))
    }

    fn backup_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.backup_dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("config_"))
            })
            .collect();
        // newest first
        files.sort_by(|a, b| {
            modified_of(b)
                .cmp(&modified_of(a))
                .then_with(|| b.file_name().cmp(&a.file_name()))
        });
        files
    }

    fn cleanup_old_backups(&self) {
        for stale in self.backup_files().into_iter().skip(KEEP_BACKUPS) {
            if let Err(err) = fs::remove_file(&stale) {
                warn!("Failed to remove old backup {}: {}", stale.display(), err);
            } else {
                debug!("Old backup removed: {}", stale.display());
            }
        }
    }

    pub fn reset(&self, section: ConfigSection) -> Result<AppConfig> {
        let mut config = self.load()?;
        config.reset_section(section);
        self.save(&config)?;
        info!(?section, "Configuration reset to defaults");
        Ok(config)
    }

    pub fn info(&self) -> ConfigInfo {
        let meta = fs::metadata(&self.config_file).ok();
        ConfigInfo {
            config_file: self.config_file.display().to_string(),
            config_dir: self
                .config_file
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            backup_dir: self.backup_dir.display().to_string(),
            exists: meta.is_some(),
            file_size: meta.as_ref().map(|m| m.len()),
            last_modified: meta
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
            backup_count: self.backup_files().len(),
        }
    }

    /// Move the configuration file into the backup directory.
    pub fn delete(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Ok(());
        }
        self.ensure_directories()?;
        let target = self.fresh_backup_path("config_deleted_");
        fs::copy(&self.config_file, &target)?;
        restrict_permissions(&target, 0o600);
        fs::remove_file(&self.config_file)?;
        info!("Configuration deleted, backup kept at {}", target.display());
        Ok(())
    }

    pub fn restore_from_backup(&self, name: Option<&str>) -> Result<AppConfig> {
        let path = match name {
            Some(name) => {
                if name.contains('/') || name.contains('\\') || name.contains("..") {
                    return Err(Error::InvalidArgument(format!(
                        "Invalid backup file name: {name}"
                    )));
                }
                let path = self.backup_dir.join(name);
                if !path.is_file() {
                    return Err(Error::NotFound(format!("Backup file does not exist: {name}")));
                }
                path
            }
            None => self
                .backup_files()
                .into_iter()
                .next()
                .ok_or_else(|| Error::NotFound("No configuration backups available".into()))?,
        };

        let raw = fs::read_to_string(&path)?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        self.ensure_directories()?;
        self.write_atomic(&config)?;
        info!("Configuration restored from {}", path.display());
        Ok(config)
    }

    pub fn list_backups(&self) -> Vec<BackupInfo> {
        self.backup_files()
            .into_iter()
            .filter_map(|path| {
                let meta = fs::metadata(&path).ok()?;
                Some(BackupInfo {
                    name: path.file_name()?.to_string_lossy().into_owned(),
                    size: meta.len(),
                    modified: meta
                        .modified()
                        .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}
