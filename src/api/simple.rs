use std::path::Path;
use std::sync::{Arc, Once};

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::catalog::{CatalogSnapshot, Platform};
use crate::config::EngineConfig;
use crate::engine::state::LocalStateStore;
use crate::engine::TitleEngine;
use crate::source::auth::{AuthContext, Credential};
use crate::source::http_source::HttpSource;

static INIT_TRACING: Once = Once::new();

/// Install the global fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("launcher engine tracing initialized");
    });
}

/// Wire an engine for one title against the HTTP backend at `config.api_base_url`.
pub fn open_title(
    config: &EngineConfig,
    catalog: CatalogSnapshot,
    credential: Credential,
) -> TitleEngine {
    let backend = Arc::new(HttpSource::new(config.api_base_url.clone()));
    let auth = Arc::new(AuthContext::new(backend, credential));
    let store = Arc::new(LocalStateStore::new(config.state_file.clone()));
    TitleEngine::new(config, catalog, Platform::current(), store, auth)
}

/// Same as [`open_title`], reading the config and catalog from JSON files.
pub fn open_title_from_files(
    config_path: &Path,
    catalog_path: &Path,
    credential: Credential,
) -> Result<TitleEngine> {
    let config = EngineConfig::from_json_file(config_path)?;
    let raw = std::fs::read_to_string(catalog_path)?;
    let catalog = CatalogSnapshot::from_json(&raw)?;
    Ok(open_title(&config, catalog, credential))
}
