use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::{PlaytimeReporter, RemoteBackend};
use crate::error::EngineError;

/// Bearer credential. Never mutated: a refresh produces a new value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Backend handle plus the credential currently in use.
///
/// The credential slot only ever holds complete values; a refresh swaps in a
/// new `Arc` rather than editing headers of a shared client.
pub struct AuthContext {
    backend: Arc<dyn RemoteBackend>,
    current: RwLock<Arc<Credential>>,
    refresh_lock: Mutex<()>,
    refresh_count: AtomicU64,
}

impl AuthContext {
    pub fn new(backend: Arc<dyn RemoteBackend>, credential: Credential) -> Self {
        Self {
            backend,
            current: RwLock::new(Arc::new(credential)),
            refresh_lock: Mutex::new(()),
            refresh_count: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn RemoteBackend> {
        &self.backend
    }

    pub fn current(&self) -> Arc<Credential> {
        self.current.read().clone()
    }

    /// Number of refreshes performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::Relaxed)
    }

    /// Replace `stale` with a fresh credential. If another caller already replaced
    /// it, the newer credential is returned without a second refresh.
    pub async fn refresh(&self, stale: &Arc<Credential>) -> Result<Arc<Credential>> {
        let _guard = self.refresh_lock.lock().await;
        {
            let current = self.current.read();
            if !Arc::ptr_eq(&*current, stale) {
                debug!("credential already refreshed by another request");
                return Ok(current.clone());
            }
        }

        let fresh = Arc::new(self.backend.refresh_credential(stale).await?);
        *self.current.write() = fresh.clone();
        self.refresh_count.fetch_add(1, Ordering::Relaxed);
        info!("credential refreshed");
        Ok(fresh)
    }

    /// Run `op` with the current credential. On an authorization rejection the
    /// credential is refreshed exactly once and `op` retried once; a second
    /// failure is returned as is.
    pub async fn with_auth_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<Credential>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let credential = self.current();
        match op(credential.clone()).await {
            Err(e) if EngineError::is_auth_rejected(&e) => {
                warn!("{} auth rejected, refreshing credential and retrying once", what);
                let fresh = self.refresh(&credential).await?;
                op(fresh).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl PlaytimeReporter for AuthContext {
    async fn report_playtime(&self, title_id: &str, elapsed: Duration) -> Result<()> {
        let backend = &self.backend;
        self.with_auth_retry("playtime report", |credential| async move {
            backend.report_playtime(title_id, elapsed, &credential).await
        })
        .await
    }
}
