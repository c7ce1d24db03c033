use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Macos,
    Linux,
}

impl Platform {
    /// Platform the engine itself was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Macos
        } else {
            Platform::Linux
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Windows => "windows",
            Platform::Macos => "macos",
            Platform::Linux => "linux",
        };
        f.write_str(name)
    }
}

/// Expected (path, hash, size) triple. Also used to report corrupted or missing files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifestEntry {
    pub relative_path: String,
    pub content_hash: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogVersion {
    pub version: String,
    pub platform: Platform,
    pub storage_locator: String,
    pub file_size_bytes: u64,
    pub content_hash: String,
    #[serde(default)]
    pub file_manifest: Vec<FileManifestEntry>,
    /// Executable path relative to the install root, when the catalog declares one.
    #[serde(default)]
    pub entry_point: Option<String>,
}

/// Directed edge `from_version -> to_version` in a title's version graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPatch {
    pub from_version: String,
    pub to_version: String,
    pub platform: Platform,
    pub storage_locator: String,
    pub file_size_bytes: u64,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogAddon {
    pub addon_id: String,
    pub versions: Vec<CatalogVersion>,
}

/// Read-only view of everything the catalog service knows about one title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub title_id: String,
    /// Name token used by the Linux executable scan.
    #[serde(default)]
    pub executable_name: Option<String>,
    #[serde(default)]
    pub versions: Vec<CatalogVersion>,
    #[serde(default)]
    pub patches: Vec<CatalogPatch>,
    #[serde(default)]
    pub addons: Vec<CatalogAddon>,
}

impl CatalogSnapshot {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parsing catalog snapshot")
    }

    /// Exact-match lookup of a version entry for `platform`.
    pub fn version(&self, platform: Platform, version: &str) -> Option<&CatalogVersion> {
        self.versions
            .iter()
            .find(|v| v.platform == platform && v.version == version)
    }

    /// Patches that apply on `platform`.
    pub fn patches_for(&self, platform: Platform) -> Vec<CatalogPatch> {
        self.patches
            .iter()
            .filter(|p| p.platform == platform)
            .cloned()
            .collect()
    }

    pub fn addon(&self, addon_id: &str) -> Option<&CatalogAddon> {
        self.addons.iter().find(|a| a.addon_id == addon_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledAddon {
    pub addon_id: String,
    pub installed_version: String,
    #[serde(default)]
    pub file_manifest: Vec<FileManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledTitle {
    pub title_id: String,
    pub install_path: PathBuf,
    pub installed_version: String,
    #[serde(default)]
    pub installed_addons: Vec<InstalledAddon>,
}

impl InstalledTitle {
    pub fn addon(&self, addon_id: &str) -> Option<&InstalledAddon> {
        self.installed_addons.iter().find(|a| a.addon_id == addon_id)
    }

    /// Replace the record for `addon.addon_id`, or append it when the addon is new.
    pub fn record_addon(&mut self, addon: InstalledAddon) {
        match self
            .installed_addons
            .iter_mut()
            .find(|a| a.addon_id == addon.addon_id)
        {
            Some(existing) => *existing = addon,
            None => self.installed_addons.push(addon),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_parses_camel_case_json() {
        let raw = r#"{
            "titleId": "starfall",
            "versions": [{
                "version": "1.2.0",
                "platform": "linux",
                "storageLocator": "starfall/linux/1.2.0.zip",
                "fileSizeBytes": 42,
                "contentHash": "ab",
                "fileManifest": [{ "relativePath": "bin/starfall", "contentHash": "cd", "sizeBytes": 7 }],
                "entryPoint": "bin/starfall"
            }],
            "patches": [{
                "fromVersion": "1.1.0",
                "toVersion": "1.2.0",
                "platform": "linux",
                "storageLocator": "starfall/linux/1.1.0-1.2.0.zip",
                "fileSizeBytes": 9,
                "contentHash": "ef"
            }]
        }"#;

        let snapshot = CatalogSnapshot::from_json(raw).unwrap();
        assert_eq!(snapshot.title_id, "starfall");
        let v = snapshot.version(Platform::Linux, "1.2.0").unwrap();
        assert_eq!(v.entry_point.as_deref(), Some("bin/starfall"));
        assert_eq!(v.file_manifest[0].size_bytes, 7);
        assert!(snapshot.version(Platform::Windows, "1.2.0").is_none());
        assert_eq!(snapshot.patches_for(Platform::Linux).len(), 1);
        assert!(snapshot.addons.is_empty());
    }

    #[test]
    fn record_addon_updates_or_appends() {
        let mut title = InstalledTitle {
            title_id: "t".into(),
            install_path: PathBuf::from("/games/t"),
            installed_version: "1.0.0".into(),
            installed_addons: Vec::new(),
        };
        let addon = |version: &str| InstalledAddon {
            addon_id: "soundtrack".into(),
            installed_version: version.into(),
            file_manifest: Vec::new(),
        };

        title.record_addon(addon("1.0"));
        title.record_addon(addon("1.1"));
        assert_eq!(title.installed_addons.len(), 1);
        assert_eq!(title.addon("soundtrack").unwrap().installed_version, "1.1");
    }
}
