// Durable record of installed titles: one pretty-printed JSON file rewritten wholesale.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::InstalledTitle;
use crate::error::EngineError;

pub struct LocalStateStore {
    path: PathBuf,
    /// Serializes load-modify-save cycles from engines sharing this store.
    write_lock: Mutex<()>,
}

impl LocalStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All installed titles. A missing file is a first run and yields an empty list;
    /// an unreadable or malformed file yields [`EngineError::CorruptedState`].
    pub fn load(&self) -> Result<Vec<InstalledTitle>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no state file at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(EngineError::CorruptedState {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }
                .into())
            }
        };

        serde_json::from_str(&raw).map_err(|e| {
            warn!("state file {} is malformed: {}", self.path.display(), e);
            EngineError::CorruptedState {
                path: self.path.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Replace the whole file with `titles`. Written to a sibling temp file first,
    /// then renamed over the old one.
    pub fn save(&self, titles: &[InstalledTitle]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write_all(titles)
    }

    fn write_all(&self, titles: &[InstalledTitle]) -> Result<()> {
        let json = serde_json::to_string_pretty(titles).context("serializing installed titles")?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing state file {}", self.path.display()))?;
        debug!("saved {} installed title(s) to {}", titles.len(), self.path.display());
        Ok(())
    }

    pub fn find(&self, title_id: &str) -> Result<Option<InstalledTitle>> {
        Ok(self.load()?.into_iter().find(|t| t.title_id == title_id))
    }

    /// Insert or replace the record for `title.title_id`.
    pub fn upsert(&self, title: &InstalledTitle) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut titles = self.load()?;
        match titles.iter_mut().find(|t| t.title_id == title.title_id) {
            Some(existing) => *existing = title.clone(),
            None => titles.push(title.clone()),
        }
        self.write_all(&titles)
    }

    /// Move a corrupted state file aside to `<file>.corrupted` so the next load starts empty.
    /// Returns the backup path, or `None` when there was no file.
    pub fn quarantine_corrupted(&self) -> Result<Option<PathBuf>> {
        let _guard = self.write_lock.lock();
        if !self.path.exists() {
            return Ok(None);
        }
        let mut backup = self.path.clone().into_os_string();
        backup.push(".corrupted");
        let backup = PathBuf::from(backup);
        fs::rename(&self.path, &backup)
            .with_context(|| format!("moving {} aside", self.path.display()))?;
        info!("moved corrupted state file to {}", backup.display());
        Ok(Some(backup))
    }
}
