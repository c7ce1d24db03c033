use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default size of each byte-range request (2 MB).
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 2 * 1024 * 1024;

/// Read buffer used when streaming a file through the hasher (64 KB).
pub const HASH_BUFFER_BYTES: usize = 64 * 1024;

/// Prefix of the per-operation staging directories created inside an install path.
pub const STAGING_DIR_PREFIX: &str = "_temp_";

/// File name of the downloaded archive inside a staging directory.
pub const STAGED_ARCHIVE_NAME: &str = "package.zip";

/// Sub-directory of a staging directory that receives the extracted archive.
pub const STAGED_EXTRACT_DIR: &str = "extract";

/// Default location of the installed-titles record, relative to the client directory.
pub const DEFAULT_STATE_FILE: &str = "installed_titles.json";

/// Top-level configuration for the install engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Base URL of the catalog/transfer service.
    pub api_base_url: String,
    /// Size of each download chunk in bytes.
    pub chunk_size: u64,
    /// Path of the persisted installed-titles file.
    pub state_file: PathBuf,
    /// How long `stop` waits for a killed process to exit.
    pub stop_timeout_ms: u64,
    /// Upper bound for the play time report issued after a game exits.
    pub report_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE_BYTES,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            stop_timeout_ms: 5_000,
            report_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Fields missing from the file keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing engine config {}", path.display()))?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE_BYTES;
        }
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }
}
