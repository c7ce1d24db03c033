use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::auth::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub size_bytes: u64,
}

/// Streamed response body of one byte-range request.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Remote catalog/transfer service as seen by the engine.
///
/// Every call carries the credential to use explicitly. Implementations report
/// authorization failures as [`EngineError::AuthRejected`](crate::error::EngineError).
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn object_info(&self, locator: &str, credential: &Credential) -> Result<ObjectInfo>;

    /// Bytes `[offset, offset + length)` of the object at `locator`.
    async fn fetch_range(
        &self,
        locator: &str,
        offset: u64,
        length: u64,
        credential: &Credential,
    ) -> Result<ByteStream>;

    async fn refresh_credential(&self, expired: &Credential) -> Result<Credential>;

    async fn report_playtime(
        &self,
        title_id: &str,
        elapsed: Duration,
        credential: &Credential,
    ) -> Result<()>;
}

/// Sink for the elapsed play time of a finished session.
#[async_trait]
pub trait PlaytimeReporter: Send + Sync {
    async fn report_playtime(&self, title_id: &str, elapsed: Duration) -> Result<()>;
}
