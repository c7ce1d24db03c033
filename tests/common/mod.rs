#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use launcher_engine::catalog::{CatalogPatch, CatalogVersion, FileManifestEntry, Platform};
use launcher_engine::error::EngineError;
use launcher_engine::source::auth::Credential;
use launcher_engine::source::traits::{ByteStream, ObjectInfo, PlaytimeReporter, RemoteBackend};

/// In-memory storage service. Tokens are accepted until `reject_next` forces
/// rejections; each refresh hands out a new token.
pub struct FakeBackend {
    objects: Mutex<HashMap<String, Bytes>>,
    valid_token: Mutex<String>,
    reject_next: AtomicU32,
    fail_refresh: AtomicBool,
    fail_reports: AtomicBool,
    fetch_delay: Mutex<Duration>,
    pub fetch_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub reports: Mutex<Vec<(String, Duration)>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            valid_token: Mutex::new("token-0".to_string()),
            reject_next: AtomicU32::new(0),
            fail_refresh: AtomicBool::new(false),
            fail_reports: AtomicBool::new(false),
            fetch_delay: Mutex::new(Duration::ZERO),
            fetch_calls: AtomicU32::new(0),
            refresh_calls: AtomicU32::new(0),
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn credential() -> Credential {
        Credential::new("token-0").with_refresh_token("refresh-0")
    }

    pub fn put(&self, locator: &str, data: impl Into<Bytes>) {
        self.objects.lock().insert(locator.to_string(), data.into());
    }

    /// Reject the next `n` authorized calls regardless of the token presented.
    pub fn reject_next(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reports(&self, fail: bool) {
        self.fail_reports.store(fail, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    fn authorize(&self, credential: &Credential) -> Result<()> {
        let forced = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced || credential.access_token != *self.valid_token.lock() {
            return Err(EngineError::AuthRejected { status: 401 }.into());
        }
        Ok(())
    }

    fn object(&self, locator: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .get(locator)
            .cloned()
            .ok_or_else(|| {
                EngineError::RemoteStatus {
                    what: format!("object {}", locator),
                    status: 404,
                }
                .into()
            })
    }
}

#[async_trait]
impl RemoteBackend for FakeBackend {
    async fn object_info(&self, locator: &str, credential: &Credential) -> Result<ObjectInfo> {
        self.authorize(credential)?;
        let data = self.object(locator)?;
        Ok(ObjectInfo {
            size_bytes: data.len() as u64,
        })
    }

    async fn fetch_range(
        &self,
        locator: &str,
        offset: u64,
        length: u64,
        credential: &Credential,
    ) -> Result<ByteStream> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.authorize(credential)?;
        let data = self.object(locator)?;
        let start = offset as usize;
        let end = (offset + length).min(data.len() as u64) as usize;
        let body = data.slice(start..end);

        // Two pieces, so callers have to reassemble the chunk.
        let mid = body.len() / 2;
        let pieces = vec![Ok(body.slice(..mid)), Ok(body.slice(mid..))];
        Ok(futures::stream::iter(pieces).boxed())
    }

    async fn refresh_credential(&self, expired: &Credential) -> Result<Credential> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(EngineError::AuthRejected { status: 401 }.into());
        }
        if expired.refresh_token.is_none() {
            return Err(anyhow!("no refresh token"));
        }
        let token = format!("token-{}", n);
        *self.valid_token.lock() = token.clone();
        Ok(Credential::new(token).with_refresh_token(format!("refresh-{}", n)))
    }

    async fn report_playtime(
        &self,
        title_id: &str,
        elapsed: Duration,
        credential: &Credential,
    ) -> Result<()> {
        self.authorize(credential)?;
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(EngineError::RemoteStatus {
                what: "playtime report".to_string(),
                status: 503,
            }
            .into());
        }
        self.reports.lock().push((title_id.to_string(), elapsed));
        Ok(())
    }
}

/// Reporter that records what it is given, optionally slow or failing.
#[derive(Default)]
pub struct RecordingReporter {
    pub fail: AtomicBool,
    pub delay: Mutex<Duration>,
    pub reports: Mutex<Vec<(String, Duration)>>,
}

#[async_trait]
impl PlaytimeReporter for RecordingReporter {
    async fn report_playtime(&self, title_id: &str, elapsed: Duration) -> Result<()> {
        self.reports.lock().push((title_id.to_string(), elapsed));
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("report endpoint unreachable"));
        }
        Ok(())
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Build a deflated zip holding `files` (path, content).
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (path, content) in files {
        writer.start_file(*path, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Manifest entries for `files`, with an optional wrapper directory stripped.
pub fn manifest(files: &[(&str, &[u8])], strip: &str) -> Vec<FileManifestEntry> {
    files
        .iter()
        .map(|(path, content)| FileManifestEntry {
            relative_path: path.strip_prefix(strip).unwrap_or(path).to_string(),
            content_hash: sha256_hex(content),
            size_bytes: content.len() as u64,
        })
        .collect()
}

/// Upload a zip of `files` under `locator` and describe it as a catalog version.
pub fn publish_version(
    backend: &FakeBackend,
    version: &str,
    locator: &str,
    files: &[(&str, &[u8])],
) -> CatalogVersion {
    let archive = zip_bytes(files);
    let entry = CatalogVersion {
        version: version.to_string(),
        platform: Platform::Linux,
        storage_locator: locator.to_string(),
        file_size_bytes: archive.len() as u64,
        content_hash: sha256_hex(&archive),
        file_manifest: manifest(files, ""),
        entry_point: None,
    };
    backend.put(locator, archive);
    entry
}

pub fn publish_patch(
    backend: &FakeBackend,
    from: &str,
    to: &str,
    locator: &str,
    files: &[(&str, &[u8])],
) -> CatalogPatch {
    let archive = zip_bytes(files);
    let entry = CatalogPatch {
        from_version: from.to_string(),
        to_version: to.to_string(),
        platform: Platform::Linux,
        storage_locator: locator.to_string(),
        file_size_bytes: archive.len() as u64,
        content_hash: sha256_hex(&archive),
    };
    backend.put(locator, archive);
    entry
}
