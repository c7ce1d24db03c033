use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use super::auth::Credential;
use super::traits::{ByteStream, ObjectInfo, RemoteBackend};
use crate::error::EngineError;

/// `RemoteBackend` over the catalog service's HTTP API.
pub struct HttpSource {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaytimeReport {
    elapsed_seconds: u64,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn object_url(&self, locator: &str) -> String {
        format!("{}/storage/{}", self.base_url, locator.trim_start_matches('/'))
    }

    /// Attach the bearer token of `credential` to a request.
    fn authorized(&self, req: RequestBuilder, credential: &Credential) -> RequestBuilder {
        req.bearer_auth(&credential.access_token)
    }

    /// Map auth statuses to `AuthRejected` and other failures to `RemoteStatus`.
    fn check_status(resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!("{} auth rejected status={}", what, status.as_u16());
            return Err(EngineError::AuthRejected {
                status: status.as_u16(),
            }
            .into());
        }
        if !status.is_success() {
            warn!("{} failed status={}", what, status.as_u16());
            return Err(EngineError::RemoteStatus {
                what: what.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        Ok(resp)
    }
}

#[async_trait]
impl RemoteBackend for HttpSource {
    async fn object_info(&self, locator: &str, credential: &Credential) -> Result<ObjectInfo> {
        let url = format!("{}/metadata", self.object_url(locator));
        let resp = self
            .authorized(self.client.get(&url), credential)
            .send()
            .await
            .with_context(|| format!("requesting metadata for {}", locator))?;
        let resp = Self::check_status(resp, "object metadata")?;
        let info: ObjectInfo = resp.json().await.context("decoding object metadata")?;
        debug!("object {} metadata size={}", locator, info.size_bytes);
        Ok(info)
    }

    async fn fetch_range(
        &self,
        locator: &str,
        offset: u64,
        length: u64,
        credential: &Credential,
    ) -> Result<ByteStream> {
        if length == 0 {
            return Err(anyhow!("empty range requested for {}", locator));
        }
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let resp = self
            .authorized(self.client.get(self.object_url(locator)), credential)
            .header(reqwest::header::RANGE, &range)
            .send()
            .await
            .with_context(|| format!("requesting {} of {}", range, locator))?;
        let resp = Self::check_status(resp, "range fetch")?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(anyhow!(
                "range fetch for {} returned HTTP {} instead of 206",
                locator,
                resp.status().as_u16()
            ));
        }

        Ok(resp.bytes_stream().map_err(anyhow::Error::from).boxed())
    }

    async fn refresh_credential(&self, expired: &Credential) -> Result<Credential> {
        let url = format!("{}/auth/refresh", self.base_url);
        let body = RefreshRequest {
            refresh_token: expired.refresh_token.as_deref(),
        };
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("requesting credential refresh")?;
        let resp = Self::check_status(resp, "credential refresh")?;
        let mut fresh: Credential = resp.json().await.context("decoding refreshed credential")?;
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = expired.refresh_token.clone();
        }
        Ok(fresh)
    }

    async fn report_playtime(
        &self,
        title_id: &str,
        elapsed: Duration,
        credential: &Credential,
    ) -> Result<()> {
        let url = format!("{}/titles/{}/playtime", self.base_url, title_id);
        let body = PlaytimeReport {
            elapsed_seconds: elapsed.as_secs(),
        };
        let resp = self
            .authorized(self.client.put(&url), credential)
            .json(&body)
            .send()
            .await
            .context("sending playtime report")?;
        Self::check_status(resp, "playtime report")?;
        debug!("reported {}s of playtime for {}", body.elapsed_seconds, title_id);
        Ok(())
    }
}
