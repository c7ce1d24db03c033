// Title engine: update checks, install/patch/addon transactions and game launch for one title.

pub mod events;
pub mod executable;
pub mod integrity;
pub mod process;
pub mod state;
pub mod stats;
pub mod transaction;
pub mod transfer;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::resolver::{addon_needs_install, latest_version, needs_update, next_patch};
use crate::catalog::{CatalogSnapshot, CatalogVersion, FileManifestEntry, InstalledTitle, Platform};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::source::auth::AuthContext;
use crate::source::traits::PlaytimeReporter;

use self::events::EngineEvent;
use self::process::{LaunchSpec, LifecycleState, ProcessLifecycleManager};
use self::state::LocalStateStore;
use self::transaction::{sweep_stale_staging, InstallTransaction};
use self::transfer::{ChunkedTransferClient, ProgressFn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    NotInstalled,
    /// The catalog has no version for this platform.
    Unsupported,
    UpToDate { version: String },
    UpdateAvailable { installed: String, latest: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Patched { hops: usize, version: String },
    /// The patch chain dead-ended or looped, so the latest version was installed in full.
    Reinstalled { version: String },
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonUpdate {
    pub addon_id: String,
    pub version: CatalogVersion,
}

pub struct TitleEngine {
    title_id: String,
    platform: Platform,
    catalog: RwLock<Arc<CatalogSnapshot>>,
    store: Arc<LocalStateStore>,
    transaction: InstallTransaction,
    install_lock: Mutex<()>,
    events: broadcast::Sender<EngineEvent>,
    process: ProcessLifecycleManager,
}

impl TitleEngine {
    /// Build the engine for `catalog.title_id`. Must be called inside a tokio runtime.
    ///
    /// Leftover staging directories of an interrupted operation are swept here.
    pub fn new(
        config: &EngineConfig,
        catalog: CatalogSnapshot,
        platform: Platform,
        store: Arc<LocalStateStore>,
        auth: Arc<AuthContext>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let reporter: Arc<dyn PlaytimeReporter> = auth.clone();
        let process = ProcessLifecycleManager::spawn(
            reporter,
            events.clone(),
            config.stop_timeout(),
            config.report_timeout(),
        );
        let transfer = Arc::new(ChunkedTransferClient::new(auth));

        let engine = Self {
            title_id: catalog.title_id.clone(),
            platform,
            catalog: RwLock::new(Arc::new(catalog)),
            store,
            transaction: InstallTransaction::new(transfer, config.chunk_size),
            install_lock: Mutex::new(()),
            events,
            process,
        };
        engine.sweep_staging();
        engine
    }

    fn sweep_staging(&self) {
        match self.store.find(&self.title_id) {
            Ok(Some(title)) => {
                if let Err(e) = sweep_stale_staging(&title.install_path) {
                    warn!("staging sweep for {} failed: {:#}", self.title_id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("skipping staging sweep for {}: {:#}", self.title_id, e),
        }
    }

    pub fn title_id(&self) -> &str {
        &self.title_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn catalog(&self) -> Arc<CatalogSnapshot> {
        self.catalog.read().clone()
    }

    /// Swap in a newer catalog snapshot for the same title.
    pub fn set_catalog(&self, catalog: CatalogSnapshot) -> Result<()> {
        if catalog.title_id != self.title_id {
            return Err(anyhow!(
                "catalog for {} given to engine of {}",
                catalog.title_id,
                self.title_id
            ));
        }
        *self.catalog.write() = Arc::new(catalog);
        Ok(())
    }

    pub fn installed(&self) -> Result<Option<InstalledTitle>> {
        self.store.find(&self.title_id)
    }

    fn require_installed(&self) -> Result<InstalledTitle> {
        self.installed()?.ok_or_else(|| {
            EngineError::NotInstalled {
                title_id: self.title_id.clone(),
            }
            .into()
        })
    }

    fn lock_install(&self) -> Result<MutexGuard<'_, ()>> {
        self.install_lock.try_lock().map_err(|_| {
            EngineError::OperationInProgress {
                title_id: self.title_id.clone(),
            }
            .into()
        })
    }

    fn persist(&self, title: &InstalledTitle) -> Result<()> {
        self.store.upsert(title)?;
        let _ = self.events.send(EngineEvent::CurrentGameChanged {
            title: title.clone(),
        });
        Ok(())
    }

    pub fn check_for_update(&self) -> Result<UpdateStatus> {
        let Some(installed) = self.installed()? else {
            return Ok(UpdateStatus::NotInstalled);
        };
        let catalog = self.catalog();
        let Some(latest) = latest_version(&catalog.versions, self.platform) else {
            return Ok(UpdateStatus::Unsupported);
        };
        if needs_update(&installed.installed_version, &latest.version) {
            Ok(UpdateStatus::UpdateAvailable {
                installed: installed.installed_version,
                latest: latest.version.clone(),
            })
        } else {
            Ok(UpdateStatus::UpToDate {
                version: installed.installed_version,
            })
        }
    }

    /// Files of the installed version and its addons that are missing or corrupted.
    /// Nothing is repaired.
    pub async fn verify_integrity(&self) -> Result<Vec<FileManifestEntry>> {
        self.verify_integrity_with_progress(|_, _| {}).await
    }

    /// Like [`verify_integrity`](Self::verify_integrity); `progress(checked, total)` is
    /// called after each file from a blocking worker thread.
    pub async fn verify_integrity_with_progress<F>(
        &self,
        progress: F,
    ) -> Result<Vec<FileManifestEntry>>
    where
        F: Fn(usize, usize) + Send + 'static,
    {
        let _guard = self.lock_install()?;
        let installed = self.require_installed()?;
        let catalog = self.catalog();
        let mut manifest = match catalog.version(self.platform, &installed.installed_version) {
            Some(version) => version.file_manifest.clone(),
            None => {
                warn!(
                    "catalog has no manifest for {} {}",
                    self.title_id, installed.installed_version
                );
                Vec::new()
            }
        };
        for addon in &installed.installed_addons {
            manifest.extend(addon.file_manifest.iter().cloned());
        }

        let root = installed.install_path.clone();
        let corrupted = tokio::task::spawn_blocking(move || {
            integrity::verify_manifest_with_progress(&root, &manifest, progress)
        })
        .await
        .context("verification task panicked")?;
        info!(
            "integrity check of {} found {} problem file(s)",
            self.title_id,
            corrupted.len()
        );
        Ok(corrupted)
    }

    /// Install the latest version into `install_path`. `Ok(false)` when the catalog
    /// has nothing for this platform.
    pub async fn install_full(
        &self,
        install_path: &Path,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let _guard = self.lock_install()?;
        let catalog = self.catalog();
        let Some(latest) = latest_version(&catalog.versions, self.platform) else {
            info!("no {} build of {} to install", self.platform, self.title_id);
            return Ok(false);
        };

        let existing = self.installed()?;
        if let Some(existing) = &existing {
            if existing.install_path != install_path {
                return Err(anyhow!(
                    "{} is already installed at {}",
                    self.title_id,
                    existing.install_path.display()
                ));
            }
        }

        let mut title = self
            .transaction
            .full_install(&self.title_id, latest, install_path, progress, cancel)
            .await?;
        if let Some(existing) = existing {
            title.installed_addons = existing.installed_addons;
        }
        self.persist(&title)?;
        Ok(true)
    }

    /// Apply one patch hop if the installed version is stale and a patch leaves it.
    pub async fn apply_patch_if_available(
        &self,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let _guard = self.lock_install()?;
        let mut installed = self.require_installed()?;
        self.patch_once(&mut installed, progress, cancel).await
    }

    async fn patch_once(
        &self,
        installed: &mut InstalledTitle,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let catalog = self.catalog();
        let Some(latest) = latest_version(&catalog.versions, self.platform) else {
            return Ok(false);
        };
        if !needs_update(&installed.installed_version, &latest.version) {
            return Ok(false);
        }
        let patches = catalog.patches_for(self.platform);
        let Some(patch) = next_patch(&patches, &installed.installed_version) else {
            debug!(
                "no patch leaves {} {}",
                self.title_id, installed.installed_version
            );
            return Ok(false);
        };
        let target_manifest = catalog
            .version(self.platform, &patch.to_version)
            .map(|v| v.file_manifest.clone())
            .unwrap_or_default();

        self.transaction
            .apply_patch(installed, patch, &target_manifest, progress, cancel)
            .await?;
        self.persist(installed)?;
        Ok(true)
    }

    /// Walk patch hops until the install is current. If the chain loops or dead-ends
    /// before reaching the latest version, the latest version is installed in full
    /// over the existing install path.
    pub async fn update_to_latest(
        &self,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        let _guard = self.lock_install()?;
        let mut installed = self.require_installed()?;
        let catalog = self.catalog();
        let Some(latest) = latest_version(&catalog.versions, self.platform) else {
            return Ok(UpdateOutcome::Unavailable);
        };
        if !needs_update(&installed.installed_version, &latest.version) {
            return Ok(UpdateOutcome::UpToDate);
        }

        let mut visited = HashSet::new();
        let mut walked = vec![installed.installed_version.clone()];
        let mut hops = 0usize;
        while needs_update(&installed.installed_version, &latest.version) {
            if !visited.insert(installed.installed_version.to_lowercase()) {
                warn!(
                    "patch chain of {} loops at {}",
                    self.title_id, installed.installed_version
                );
                break;
            }
            if !self.patch_once(&mut installed, progress, cancel).await? {
                break;
            }
            hops += 1;
            walked.push(installed.installed_version.clone());
        }

        if !needs_update(&installed.installed_version, &latest.version) {
            return Ok(UpdateOutcome::Patched {
                hops,
                version: installed.installed_version,
            });
        }

        info!(
            "patch chain of {} stopped at {}, reinstalling {}",
            self.title_id, installed.installed_version, latest.version
        );
        let mut title = self
            .transaction
            .full_install(&self.title_id, latest, &installed.install_path, progress, cancel)
            .await?;
        title.installed_addons = installed.installed_addons;

        // Files shipped by any version walked through but dropped by the latest one.
        let previous: Vec<FileManifestEntry> = walked
            .iter()
            .filter_map(|v| catalog.version(self.platform, v))
            .flat_map(|v| v.file_manifest.iter().cloned())
            .collect();
        let keep: HashSet<String> = latest
            .file_manifest
            .iter()
            .chain(title.installed_addons.iter().flat_map(|a| &a.file_manifest))
            .map(|e| e.relative_path.clone())
            .collect();
        let root = title.install_path.clone();
        let removed = tokio::task::spawn_blocking(move || {
            transaction::remove_obsolete_files(&root, &previous, &keep)
        })
        .await
        .context("cleanup task panicked")?;
        if let Err(e) = removed {
            warn!("obsolete file cleanup for {} failed: {:#}", self.title_id, e);
        }

        self.persist(&title)?;
        Ok(UpdateOutcome::Reinstalled {
            version: title.installed_version,
        })
    }

    /// Addons that are new or whose installed version is stale.
    pub fn addons_needing_install(&self) -> Result<Vec<AddonUpdate>> {
        let installed = self.require_installed()?;
        let catalog = self.catalog();
        Ok(catalog
            .addons
            .iter()
            .filter_map(|addon| {
                addon_needs_install(addon, &installed.installed_addons, self.platform).map(
                    |version| AddonUpdate {
                        addon_id: addon.addon_id.clone(),
                        version: version.clone(),
                    },
                )
            })
            .collect())
    }

    /// Install or update one addon. `Ok(false)` when it is current or has no build
    /// for this platform.
    pub async fn install_addon(
        &self,
        addon_id: &str,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let _guard = self.lock_install()?;
        let mut installed = self.require_installed()?;
        let catalog = self.catalog();
        let Some(addon) = catalog.addon(addon_id) else {
            return Err(anyhow!("addon {} is not in the catalog of {}", addon_id, self.title_id));
        };
        let Some(version) = addon_needs_install(addon, &installed.installed_addons, self.platform)
        else {
            return Ok(false);
        };

        self.transaction
            .install_addon(&mut installed, addon_id, version, progress, cancel)
            .await?;
        self.persist(&installed)?;
        Ok(true)
    }

    /// Launch the installed game. `Ok(false)` when it is already running.
    ///
    /// Refused with `OperationInProgress` while an install, patch or addon merge owns
    /// the install tree.
    pub async fn launch(&self, args: Vec<String>) -> Result<bool> {
        let _guard = self.lock_install()?;
        let installed = self.require_installed()?;
        let catalog = self.catalog();
        let spec = LaunchSpec {
            platform: self.platform,
            entry_point: catalog
                .version(self.platform, &installed.installed_version)
                .and_then(|v| v.entry_point.clone()),
            name_token: Some(
                catalog
                    .executable_name
                    .clone()
                    .unwrap_or_else(|| self.title_id.clone()),
            ),
            args,
        };
        self.process.launch(&installed, spec).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.process.stop().await
    }

    pub fn process_state(&self) -> LifecycleState {
        self.process.state()
    }

    pub fn watch_process_state(&self) -> tokio::sync::watch::Receiver<LifecycleState> {
        self.process.watch_state()
    }
}
