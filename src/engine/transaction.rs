// Install transaction: download -> extract into staging -> plan -> merge -> verify -> cleanup.
//
// Everything up to the merge plan happens inside a `_temp_*` directory under the
// install path; the install tree is only touched by the final merge.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::integrity;
use super::transfer::{ChunkedTransferClient, ProgressFn, TransferTarget};
use crate::catalog::{CatalogPatch, CatalogVersion, FileManifestEntry, InstalledAddon, InstalledTitle};
use crate::config::{STAGED_ARCHIVE_NAME, STAGED_EXTRACT_DIR, STAGING_DIR_PREFIX};
use crate::error::EngineError;

/// Remote archive to download and merge.
#[derive(Debug, Clone)]
struct Package<'a> {
    locator: &'a str,
    size_bytes: u64,
    content_hash: &'a str,
}

impl<'a> From<&'a CatalogVersion> for Package<'a> {
    fn from(v: &'a CatalogVersion) -> Self {
        Self {
            locator: &v.storage_locator,
            size_bytes: v.file_size_bytes,
            content_hash: &v.content_hash,
        }
    }
}

impl<'a> From<&'a CatalogPatch> for Package<'a> {
    fn from(p: &'a CatalogPatch) -> Self {
        Self {
            locator: &p.storage_locator,
            size_bytes: p.file_size_bytes,
            content_hash: &p.content_hash,
        }
    }
}

/// One file move of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStep {
    /// `/`-separated path relative to the install root.
    pub relative_path: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

pub struct InstallTransaction {
    transfer: Arc<ChunkedTransferClient>,
    chunk_size: u64,
}

impl InstallTransaction {
    pub fn new(transfer: Arc<ChunkedTransferClient>, chunk_size: u64) -> Self {
        Self {
            transfer,
            chunk_size,
        }
    }

    /// Download `version` and merge it into a freshly created `install_path`.
    pub async fn full_install(
        &self,
        title_id: &str,
        version: &CatalogVersion,
        install_path: &Path,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<InstalledTitle> {
        info!(
            "full install title={} version={} path={}",
            title_id,
            version.version,
            install_path.display()
        );
        let created = !install_path.exists();
        fs::create_dir_all(install_path)
            .with_context(|| format!("creating install path {}", install_path.display()))?;

        let result = match self
            .stage_and_merge(install_path, version.into(), progress, cancel)
            .await
        {
            Ok(_) => verify_merged(install_path, &version.file_manifest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if created {
                discard_install_dir(install_path);
            }
            return Err(e);
        }

        Ok(InstalledTitle {
            title_id: title_id.to_string(),
            install_path: install_path.to_path_buf(),
            installed_version: version.version.clone(),
            installed_addons: Vec::new(),
        })
    }

    /// Overlay `patch` onto the existing tree. `target_manifest` is the catalog manifest
    /// of `patch.to_version`; when non-empty it must verify before the version changes.
    pub async fn apply_patch(
        &self,
        installed: &mut InstalledTitle,
        patch: &CatalogPatch,
        target_manifest: &[FileManifestEntry],
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if installed.installed_version != patch.from_version {
            return Err(anyhow!(
                "patch {} -> {} does not apply to installed version {}",
                patch.from_version,
                patch.to_version,
                installed.installed_version
            ));
        }
        info!(
            "applying patch title={} {} -> {}",
            installed.title_id, patch.from_version, patch.to_version
        );

        self.stage_and_merge(&installed.install_path, patch.into(), progress, cancel)
            .await?;
        verify_merged(&installed.install_path, target_manifest).await?;

        installed.installed_version = patch.to_version.clone();
        Ok(())
    }

    /// Merge an addon package at the title's install root and record it.
    pub async fn install_addon(
        &self,
        installed: &mut InstalledTitle,
        addon_id: &str,
        version: &CatalogVersion,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(
            "installing addon title={} addon={} version={}",
            installed.title_id, addon_id, version.version
        );
        let merged = self
            .stage_and_merge(&installed.install_path, version.into(), progress, cancel)
            .await?;

        let file_manifest = if version.file_manifest.is_empty() {
            describe_merged(&installed.install_path, merged).await?
        } else {
            verify_merged(&installed.install_path, &version.file_manifest).await?;
            version.file_manifest.clone()
        };

        installed.record_addon(InstalledAddon {
            addon_id: addon_id.to_string(),
            installed_version: version.version.clone(),
            file_manifest,
        });
        Ok(())
    }

    /// Shared pipeline. Returns the relative paths that were merged.
    async fn stage_and_merge(
        &self,
        install_path: &Path,
        package: Package<'_>,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_DIR_PREFIX)
            .tempdir_in(install_path)
            .with_context(|| format!("creating staging directory in {}", install_path.display()))?;
        let archive = staging.path().join(STAGED_ARCHIVE_NAME);

        let target = TransferTarget {
            remote_locator: package.locator.to_string(),
            destination_path: archive.clone(),
            expected_size_bytes: (package.size_bytes > 0).then_some(package.size_bytes),
        };
        self.transfer
            .download(&target, self.chunk_size, progress, cancel)
            .await?;

        // From here on nothing is cancellable.
        let expected_hash = package.content_hash.trim().to_string();
        let extract_root = staging.path().join(STAGED_EXTRACT_DIR);
        let install_root = install_path.to_path_buf();
        let plan = tokio::task::spawn_blocking(move || -> Result<Vec<MergeStep>> {
            if !expected_hash.is_empty() {
                let actual = integrity::hash_file(&archive)?;
                if !actual.eq_ignore_ascii_case(&expected_hash) {
                    return Err(EngineError::HashMismatch {
                        path: archive,
                        expected: expected_hash,
                        actual,
                    }
                    .into());
                }
            }
            let entries = extract_archive(&archive, &extract_root)?;
            debug!("extracted {} file(s) from {}", entries, archive.display());
            fs::remove_file(&archive)
                .with_context(|| format!("removing archive {}", archive.display()))?;

            let content_root = unwrap_single_directory(&extract_root)?;
            plan_merge(&content_root, &install_root)
        })
        .await
        .context("staging task panicked")??;

        let merged: Vec<String> = plan.iter().map(|s| s.relative_path.clone()).collect();
        let count = plan.len();
        tokio::task::spawn_blocking(move || execute_merge(&plan))
            .await
            .context("merge task panicked")??;
        info!("merged {} file(s) into {}", count, install_path.display());

        close_staging(staging);
        Ok(merged)
    }
}

fn close_staging(staging: TempDir) {
    let path = staging.path().to_path_buf();
    if let Err(e) = staging.close() {
        warn!("could not remove staging directory {}: {}", path.display(), e);
    }
}

fn discard_install_dir(install_path: &Path) {
    match fs::remove_dir_all(install_path) {
        Ok(()) => debug!("removed unfinished install {}", install_path.display()),
        Err(e) => warn!(
            "could not remove unfinished install {}: {}",
            install_path.display(),
            e
        ),
    }
}

async fn verify_merged(install_path: &Path, manifest: &[FileManifestEntry]) -> Result<()> {
    if manifest.is_empty() {
        return Ok(());
    }
    let root = install_path.to_path_buf();
    let manifest = manifest.to_vec();
    let check_root = root.clone();
    let corrupted =
        tokio::task::spawn_blocking(move || integrity::verify_manifest(&check_root, &manifest))
            .await
            .context("verification task panicked")?;
    if corrupted.is_empty() {
        Ok(())
    } else {
        Err(EngineError::IntegrityFailure { root, corrupted }.into())
    }
}

async fn describe_merged(install_path: &Path, merged: Vec<String>) -> Result<Vec<FileManifestEntry>> {
    let root = install_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        merged
            .iter()
            .map(|relative| integrity::describe_file(&root, relative))
            .collect::<Result<Vec<_>>>()
    })
    .await
    .context("manifest task panicked")?
}

/// Extract a zip archive into `dest`. Entries that would escape `dest` are skipped.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("reading archive {}", archive_path.display()))?;
    fs::create_dir_all(dest)?;

    let mut files = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let output_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&output_path)?;
            continue;
        }
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&output_path)
            .with_context(|| format!("creating {}", output_path.display()))?;
        io::copy(&mut entry, &mut outfile)
            .with_context(|| format!("extracting {}", output_path.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&output_path, fs::Permissions::from_mode(mode))?;
        }
        files += 1;
    }
    Ok(files)
}

/// If `root` holds exactly one entry and it is a directory, that directory is the
/// real content root (archives are often packed with a wrapper folder).
pub fn unwrap_single_directory(root: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(root)
        .with_context(|| format!("listing {}", root.display()))?
        .collect::<io::Result<Vec<_>>>()?;
    if entries.len() == 1 {
        let only = entries.remove(0);
        if only.file_type()?.is_dir() {
            debug!("skipping wrapper directory {}", only.path().display());
            return Ok(only.path());
        }
    }
    Ok(root.to_path_buf())
}

/// Every regular file under `content_root`, mapped to its destination under `install_root`.
pub fn plan_merge(content_root: &Path, install_root: &Path) -> Result<Vec<MergeStep>> {
    let mut plan = Vec::new();
    for entry in WalkDir::new(content_root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(content_root)
            .with_context(|| format!("{} escapes staging root", entry.path().display()))?;
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        plan.push(MergeStep {
            relative_path,
            source: entry.path().to_path_buf(),
            destination: install_root.join(relative),
        });
    }
    Ok(plan)
}

/// Move every staged file onto its destination, overwriting existing files.
pub fn execute_merge(plan: &[MergeStep]) -> Result<()> {
    for step in plan {
        if let Some(parent) = step.destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        if step.destination.is_dir() {
            return Err(anyhow!(
                "cannot overwrite directory {} with a file",
                step.destination.display()
            ));
        }
        if step.destination.exists() {
            fs::remove_file(&step.destination)
                .with_context(|| format!("replacing {}", step.destination.display()))?;
        }
        if fs::rename(&step.source, &step.destination).is_err() {
            fs::copy(&step.source, &step.destination).with_context(|| {
                format!("copying {} into place", step.destination.display())
            })?;
            fs::remove_file(&step.source)?;
        }
    }
    Ok(())
}

/// Delete files listed in `previous` whose path is not in `keep`. Paths that are not
/// plain relative paths are ignored. Returns the number of files removed.
pub fn remove_obsolete_files(
    install_path: &Path,
    previous: &[FileManifestEntry],
    keep: &HashSet<String>,
) -> Result<usize> {
    let mut removed = 0;
    for entry in previous {
        if keep.contains(entry.relative_path.as_str()) {
            continue;
        }
        let relative = Path::new(&entry.relative_path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            warn!("ignoring unsafe manifest path {}", entry.relative_path);
            continue;
        }
        let path = install_path.join(relative);
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("removing obsolete {}", path.display()))
            }
        }
    }
    if removed > 0 {
        info!("removed {} obsolete file(s) from {}", removed, install_path.display());
    }
    Ok(removed)
}

/// Remove `_temp_*` staging directories left behind by an interrupted operation.
pub fn sweep_stale_staging(install_path: &Path) -> Result<usize> {
    let entries = match fs::read_dir(install_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("listing {}", install_path.display())),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let is_staging = entry.file_name().to_string_lossy().starts_with(STAGING_DIR_PREFIX);
        if is_staging && entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())
                .with_context(|| format!("removing stale staging {}", entry.path().display()))?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!("swept {} stale staging dir(s) from {}", removed, install_path.display());
    }
    Ok(removed)
}
