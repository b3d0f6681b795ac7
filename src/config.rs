use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fs::{parse_sort_key, parse_suffix_style, SortKey, SuffixStyle};
use crate::logging::{parse_log_level, LogSettings};

const SETTINGS_FILE: &str = "settings.json";
const MIN_SEARCH_CHUNK: usize = 4 * 1024;
const MAX_HEX_ROW_WIDTH: usize = 256;

fn default_sort_by() -> String {
    "name".to_string()
}

fn default_worker_threads() -> usize {
    4
}

fn default_kdf_iterations() -> u32 {
    crate::crypto::DEFAULT_KDF_ITERATIONS
}

fn default_search_chunk_size() -> usize {
    crate::inspect::DEFAULT_CHUNK_SIZE
}

fn default_hex_row_width() -> usize {
    16
}

fn default_nested_archive_depth() -> usize {
    1
}

fn default_conflict_suffix() -> String {
    "timestamp".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// User settings, stored as JSON under the config dir
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Sandbox directory; `None` picks the platform documents dir
    #[serde(default)]
    pub sandbox_root: Option<PathBuf>,
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    #[serde(default = "default_search_chunk_size")]
    pub search_chunk_size: usize,
    #[serde(default = "default_hex_row_width")]
    pub hex_row_width: usize,
    #[serde(default = "default_nested_archive_depth")]
    pub nested_archive_depth: usize,
    /// "timestamp" or "counter"
    #[serde(default = "default_conflict_suffix")]
    pub conflict_suffix: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sandbox_root: None,
            sort_by: default_sort_by(),
            worker_threads: default_worker_threads(),
            kdf_iterations: default_kdf_iterations(),
            search_chunk_size: default_search_chunk_size(),
            hex_row_width: default_hex_row_width(),
            nested_archive_depth: default_nested_archive_depth(),
            conflict_suffix: default_conflict_suffix(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Settings {
    /// `~/.filevault`
    pub fn config_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".filevault"))
    }

    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join(SETTINGS_FILE))
    }

    /// Load settings; a missing file yields defaults, a broken one an error message
    pub fn load_with_error() -> Result<Self, String> {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let settings: Settings =
            serde_json::from_str(&content).map_err(|e| format!("Invalid settings in {}: {}", path.display(), e))?;
        Ok(settings.validated())
    }

    pub fn save(&self) -> Result<(), String> {
        let path = Self::settings_path().ok_or_else(|| "Cannot determine home directory".to_string())?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(path, json).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
    }

    /// Clamp numeric fields into their working ranges
    pub fn validated(mut self) -> Self {
        self.worker_threads = self.worker_threads.max(1);
        self.hex_row_width = self.hex_row_width.clamp(1, MAX_HEX_ROW_WIDTH);
        self.search_chunk_size = self.search_chunk_size.max(MIN_SEARCH_CHUNK);
        self.kdf_iterations = self.kdf_iterations.max(1);
        self
    }

    /// Configured root, else `<documents>/filevault`, else `~/.filevault/Documents`
    pub fn sandbox_root_path(&self) -> Option<PathBuf> {
        if let Some(root) = &self.sandbox_root {
            return Some(root.clone());
        }
        dirs::document_dir()
            .map(|d| d.join("filevault"))
            .or_else(|| Self::config_dir().map(|d| d.join("Documents")))
    }

    pub fn sort_key(&self) -> SortKey {
        parse_sort_key(&self.sort_by)
    }

    pub fn suffix_style(&self) -> SuffixStyle {
        parse_suffix_style(&self.conflict_suffix)
    }

    /// Relative log file names land in the config dir
    pub fn log_settings(&self) -> LogSettings {
        let file = self.log_file.as_ref().map(|f| {
            if f.is_absolute() {
                f.clone()
            } else {
                Self::config_dir().map(|d| d.join(f)).unwrap_or_else(|| f.clone())
            }
        });
        LogSettings {
            level: parse_log_level(&self.log_level),
            file,
        }
    }
}
