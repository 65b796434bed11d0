//! Input directory handling for uploaded files.

pub mod extract;

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::constants::ENQUEUED_DIR;
use crate::paths::ensure_directory;
use crate::{Error, Result};

pub use extract::{extract_text, ExtractionFailure};

pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".pdf", ".docx", ".pptx", ".xlsx", ".rtf", ".odt", ".tex", ".epub", ".html",
    ".htm", ".csv", ".json", ".xml", ".yaml", ".yml", ".log", ".conf", ".ini", ".properties",
    ".sql", ".bat", ".sh", ".c", ".cpp", ".py", ".java", ".js", ".ts", ".swift", ".go", ".rb",
    ".php", ".css", ".scss", ".less",
];

/// Lowercased extension with its leading dot, or an empty string.
pub fn dotted_extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Files waiting in `<inputs>/<workspace>`.
pub struct DocumentManager {
    input_dir: PathBuf,
    indexed_files: Mutex<HashSet<PathBuf>>,
}

impl DocumentManager {
    pub fn new(input_dir: PathBuf) -> Result<Self> {
        ensure_directory(&input_dir)?;
        Ok(Self {
            input_dir,
            indexed_files: Mutex::new(HashSet::new()),
        })
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn enqueued_dir(&self) -> PathBuf {
        self.input_dir.join(ENQUEUED_DIR)
    }

    pub fn is_supported_file(&self, name: &str) -> bool {
        let ext = dotted_extension(Path::new(name));
        SUPPORTED_EXTENSIONS.contains(&ext.as_str())
    }

    pub fn supported_extensions_display(&self) -> String {
        let quoted: Vec<String> = SUPPORTED_EXTENSIONS.iter().map(|e| format!("'{e}'")).collect();
        format!("[{}]", quoted.join(", "))
    }

    /// Supported files not yet indexed, skipping the enqueued archive.
    pub fn scan_directory_for_new_files(&self) -> Vec<PathBuf> {
        let indexed = match self.indexed_files.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let mut found: Vec<PathBuf> = WalkDir::new(&self.input_dir)
            .into_iter()
            .filter_entry(|e| e.file_name() != ENQUEUED_DIR)
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| self.is_supported_file(&n.to_string_lossy()))
            })
            .filter(|p| !indexed.contains(p))
            .collect();
        found.sort();
        debug!(dir = %self.input_dir.display(), count = found.len(), "Scanned input directory");
        found
    }

    pub fn mark_as_indexed(&self, path: &Path) {
        match self.indexed_files.lock() {
            Ok(mut guard) => guard.insert(path.to_path_buf()),
            Err(poisoned) => poisoned.into_inner().insert(path.to_path_buf()),
        };
    }

    /// Number of entries directly in the input dir, then remove them all.
    pub fn clear(&self) -> Result<usize> {
        if !self.input_dir.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.input_dir)? {
            let path = entry?.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), "Failed to remove input entry: {err}"),
            }
        }
        Ok(removed)
    }
}

/// Strip separators, traversal and control characters from an uploaded name.
pub fn sanitize_filename(name: &str, input_dir: &Path) -> Result<String> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Filename cannot be empty".to_string()));
    }
    let cleaned: String = name
        .replace(['/', '\\'], "")
        .replace("..", "")
        .chars()
        .filter(|&c| (c as u32) >= 32 && c != '\x7f')
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        return Err(Error::Validation(
            "Invalid filename after sanitization".to_string(),
        ));
    }
    let candidate = input_dir.join(&cleaned);
    let stays_inside = candidate.starts_with(input_dir)
        && candidate
            .strip_prefix(input_dir)
            .map(|rest| rest.components().all(|c| matches!(c, Component::Normal(_))))
            .unwrap_or(false);
    if !stays_inside {
        return Err(Error::Validation("Unsafe filename detected".to_string()));
    }
    Ok(cleaned)
}

/// Free name in `dir`: `stem_001.ext` to `stem_999.ext`, then a timestamp suffix.
pub fn unique_enqueued_name(dir: &Path, name: &str) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..=999)
        .map(|i| format!("{stem}_{i:03}{ext}"))
        .find(|candidate| !dir.join(candidate).exists())
        .unwrap_or_else(|| format!("{stem}_{}{ext}", chrono::Utc::now().timestamp()))
}
