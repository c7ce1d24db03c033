// Version selection: latest build per platform, update detection and single-hop patch choice.

use std::cmp::Ordering;

use super::model::{CatalogAddon, CatalogPatch, CatalogVersion, InstalledAddon, Platform};

/// Parsed form of a catalog version string, used only for ordering.
///
/// Accepts `MAJOR[.MINOR[.PATCH[...]]][-PRERELEASE][+BUILD]`. Missing trailing
/// components compare as zero, a pre-release sorts below its release and build
/// metadata is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionKey {
    components: Vec<u64>,
    pre_release: Option<String>,
}

impl VersionKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let without_build = raw.split_once('+').map_or(raw, |(core, _)| core);
        let (core, pre_release) = match without_build.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return None,
            None => (without_build, None),
        };
        let core = core
            .strip_prefix(|c: char| c == 'v' || c == 'V')
            .unwrap_or(core);
        if core.is_empty() {
            return None;
        }

        let components = core
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            components,
            pre_release,
        })
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        match (&self.pre_release, &other.pre_release) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Unparseable versions rank below every parseable one (`None < Some`).
fn rank(version: &str) -> Option<VersionKey> {
    VersionKey::parse(version)
}

/// Newest version published for `platform`, or `None` when the platform is unsupported.
///
/// Equal-ranked entries keep list order: the first one wins.
pub fn latest_version(versions: &[CatalogVersion], platform: Platform) -> Option<&CatalogVersion> {
    let mut best: Option<(&CatalogVersion, Option<VersionKey>)> = None;
    for candidate in versions.iter().filter(|v| v.platform == platform) {
        let key = rank(&candidate.version);
        let replace = match &best {
            None => true,
            Some((_, best_key)) => key > *best_key,
        };
        if replace {
            best = Some((candidate, key));
        }
    }
    best.map(|(v, _)| v)
}

/// Identity check, not ordering: any case-insensitive difference means an update is due.
pub fn needs_update(installed_version: &str, latest_version: &str) -> bool {
    installed_version.to_lowercase() != latest_version.to_lowercase()
}

/// Best single hop out of `from_version`: the patch with the highest `to_version`.
///
/// Callers re-invoke after each applied patch; nothing here guarantees the hops
/// reach the newest full version.
pub fn next_patch<'a>(patches: &'a [CatalogPatch], from_version: &str) -> Option<&'a CatalogPatch> {
    let mut best: Option<(&CatalogPatch, Option<VersionKey>)> = None;
    for patch in patches.iter().filter(|p| p.from_version == from_version) {
        let key = rank(&patch.to_version);
        let replace = match &best {
            None => true,
            Some((_, best_key)) => key > *best_key,
        };
        if replace {
            best = Some((patch, key));
        }
    }
    best.map(|(p, _)| p)
}

/// The addon version to install, if the addon is new or its installed version is stale.
pub fn addon_needs_install<'a>(
    addon: &'a CatalogAddon,
    installed: &[InstalledAddon],
    platform: Platform,
) -> Option<&'a CatalogVersion> {
    let latest = latest_version(&addon.versions, platform)?;
    match installed.iter().find(|a| a.addon_id == addon.addon_id) {
        None => Some(latest),
        Some(current) if needs_update(&current.installed_version, &latest.version) => Some(latest),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(v: &str, platform: Platform) -> CatalogVersion {
        CatalogVersion {
            version: v.to_string(),
            platform,
            storage_locator: format!("title/{platform}/{v}.zip"),
            file_size_bytes: 1,
            content_hash: String::new(),
            file_manifest: Vec::new(),
            entry_point: None,
        }
    }

    fn patch(from: &str, to: &str) -> CatalogPatch {
        CatalogPatch {
            from_version: from.to_string(),
            to_version: to.to_string(),
            platform: Platform::Linux,
            storage_locator: format!("title/patch/{from}-{to}.zip"),
            file_size_bytes: 1,
            content_hash: String::new(),
        }
    }

    #[test]
    fn version_key_ordering() {
        let key = |s| VersionKey::parse(s).unwrap();
        assert!(key("1.10.0") > key("1.9.3"));
        assert_eq!(key("1.2").cmp(&key("1.2.0")), Ordering::Equal);
        assert!(key("2.0.0-beta") < key("2.0.0"));
        assert!(key("2.0.0-beta") > key("1.99"));
        assert_eq!(key("v1.0.0+build.7").cmp(&key("1.0.0")), Ordering::Equal);
        assert!(VersionKey::parse("latest").is_none());
        assert!(VersionKey::parse("1..2").is_none());
        assert!(VersionKey::parse("1.0-").is_none());
    }

    #[test]
    fn latest_version_filters_platform_and_orders_numerically() {
        let versions = vec![
            version("1.9.0", Platform::Linux),
            version("1.10.0", Platform::Linux),
            version("3.0.0", Platform::Windows),
            version("garbage", Platform::Linux),
        ];
        assert_eq!(latest_version(&versions, Platform::Linux).unwrap().version, "1.10.0");
        assert_eq!(latest_version(&versions, Platform::Windows).unwrap().version, "3.0.0");
        assert!(latest_version(&versions, Platform::Macos).is_none());
    }

    #[test]
    fn latest_version_keeps_first_of_equal_entries() {
        let mut a = version("1.0", Platform::Linux);
        a.storage_locator = "first".into();
        let b = version("1.0.0", Platform::Linux);
        let versions = vec![a, b];
        assert_eq!(latest_version(&versions, Platform::Linux).unwrap().storage_locator, "first");
    }

    #[test]
    fn needs_update_is_case_insensitive_identity() {
        assert!(!needs_update("1.0.0", "1.0.0"));
        assert!(needs_update("1.0.0", "1.0.1"));
        assert!(needs_update("1.0.0", "1.0.0 "));
        assert!(!needs_update("1.0.0-RC1", "1.0.0-rc1"));
        assert!(needs_update("2.0.0", "1.0.0"));
        assert!(needs_update("???", "!!!"));
    }

    #[test]
    fn next_patch_picks_highest_target_from_exact_source() {
        let patches = vec![
            patch("1.0.0", "1.1.0"),
            patch("1.0.0", "1.3.0"),
            patch("1.0.0", "1.2.0"),
            patch("1.0", "9.0.0"),
        ];
        assert_eq!(next_patch(&patches, "1.0.0").unwrap().to_version, "1.3.0");
        assert_eq!(next_patch(&patches, "1.0").unwrap().to_version, "9.0.0");
        assert!(next_patch(&patches, "1.3.0").is_none());
    }

    #[test]
    fn addon_detection() {
        let addon = CatalogAddon {
            addon_id: "maps".into(),
            versions: vec![version("1.0", Platform::Linux), version("1.1", Platform::Linux)],
        };
        let installed = |v: &str| InstalledAddon {
            addon_id: "maps".into(),
            installed_version: v.into(),
            file_manifest: Vec::new(),
        };

        assert_eq!(addon_needs_install(&addon, &[], Platform::Linux).unwrap().version, "1.1");
        assert_eq!(
            addon_needs_install(&addon, &[installed("1.0")], Platform::Linux).unwrap().version,
            "1.1"
        );
        assert!(addon_needs_install(&addon, &[installed("1.1")], Platform::Linux).is_none());
        assert!(addon_needs_install(&addon, &[], Platform::Windows).is_none());
    }
}
