// Sequential chunked downloader: byte-range requests appended to one exclusively opened file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::{TransferStats, TransferStatsSnapshot};
use crate::error::EngineError;
use crate::source::auth::AuthContext;

/// One in-flight download. Lives only for the duration of the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub remote_locator: String,
    pub destination_path: PathBuf,
    /// Size the catalog advertised; checked against the remote metadata when present.
    pub expected_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
}

impl TransferProgress {
    /// Completed share in `[0, 1]`. An empty object counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.downloaded_bytes as f64 / self.total_bytes as f64
        }
    }
}

pub type ProgressFn<'a> = dyn Fn(TransferProgress) + Send + Sync + 'a;

/// Number of `chunk_size` ranges needed to cover `total` bytes.
pub fn chunk_count(total: u64, chunk_size: u64) -> u64 {
    total.div_ceil(chunk_size)
}

/// Byte length of chunk `index`. The last chunk may be shorter than `chunk_size`.
pub fn chunk_len(total: u64, chunk_size: u64, index: u64) -> u64 {
    let start = index * chunk_size;
    chunk_size.min(total.saturating_sub(start))
}

pub struct ChunkedTransferClient {
    auth: Arc<AuthContext>,
}

impl ChunkedTransferClient {
    pub fn new(auth: Arc<AuthContext>) -> Self {
        Self { auth }
    }

    pub fn auth(&self) -> &Arc<AuthContext> {
        &self.auth
    }

    /// Download `target` chunk by chunk into its destination file.
    ///
    /// Chunks are requested strictly in order. Cancellation is checked before each
    /// request, never in the middle of one. On any failure the partially written
    /// destination file is removed.
    pub async fn download(
        &self,
        target: &TransferTarget,
        chunk_size: u64,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<TransferStatsSnapshot> {
        if chunk_size == 0 {
            return Err(anyhow!("chunk_size must be > 0"));
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled.into());
        }

        let stats = TransferStats::new();
        let locator = target.remote_locator.as_str();
        let refreshes_before = self.auth.refresh_count();
        let backend = self.auth.backend().clone();
        let info = self
            .auth
            .with_auth_retry("object metadata", |credential| {
                let backend = backend.clone();
                async move { backend.object_info(locator, &credential).await }
            })
            .await?;
        let total = info.size_bytes;

        if let Some(expected) = target.expected_size_bytes {
            if expected != total {
                return Err(EngineError::SizeMismatch {
                    path: target.destination_path.clone(),
                    expected,
                    actual: total,
                }
                .into());
            }
        }

        if let Some(parent) = target.destination_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target.destination_path)
            .await
            .with_context(|| format!("opening {} for download", target.destination_path.display()))?;

        info!(
            "download start locator={} size={} chunks={} dest={}",
            locator,
            total,
            chunk_count(total, chunk_size),
            target.destination_path.display()
        );
        let t0 = Instant::now();

        let result = self
            .write_chunks(file, target, total, chunk_size, &stats, progress, cancel)
            .await;

        for _ in refreshes_before..self.auth.refresh_count() {
            stats.record_auth_refresh();
        }

        match result {
            Ok(()) => {
                let snapshot = stats.snapshot();
                info!(
                    "download done locator={} bytes={} elapsed_ms={}",
                    locator,
                    snapshot.downloaded_bytes,
                    t0.elapsed().as_millis()
                );
                Ok(snapshot)
            }
            Err(e) => {
                if EngineError::is_cancelled(&e) {
                    info!("download cancelled locator={}", locator);
                } else {
                    warn!("download failed locator={}: {:#}", locator, e);
                }
                remove_partial(&target.destination_path).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_chunks(
        &self,
        file: fs::File,
        target: &TransferTarget,
        total: u64,
        chunk_size: u64,
        stats: &TransferStats,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let locator = target.remote_locator.as_str();
        let backend = self.auth.backend().clone();
        let mut writer = BufWriter::new(file);
        let mut downloaded = 0u64;

        for index in 0..chunk_count(total, chunk_size) {
            if cancel.is_cancelled() {
                debug!("download of {} cancelled before chunk {}", locator, index);
                return Err(EngineError::Cancelled.into());
            }

            let offset = index * chunk_size;
            let length = chunk_len(total, chunk_size, index);
            let mut body = self
                .auth
                .with_auth_retry("chunk fetch", |credential| {
                    let backend = backend.clone();
                    async move { backend.fetch_range(locator, offset, length, &credential).await }
                })
                .await
                .with_context(|| format!("fetching chunk {} of {}", index, locator))?;

            let mut received = 0u64;
            while let Some(piece) = body.next().await {
                let piece = piece.with_context(|| format!("reading chunk {} of {}", index, locator))?;
                received += piece.len() as u64;
                if received > length {
                    return Err(anyhow!(
                        "chunk {} of {} overflowed: expected {} bytes",
                        index,
                        locator,
                        length
                    ));
                }
                writer.write_all(&piece).await?;
            }
            if received != length {
                return Err(anyhow!(
                    "chunk {} of {} was short: expected {} bytes, received {}",
                    index,
                    locator,
                    length,
                    received
                ));
            }

            downloaded += length;
            stats.record_downloaded(length);
            stats.record_chunk();
            debug!("chunk {} of {} written ({} bytes)", index, locator, length);
            progress(TransferProgress {
                downloaded_bytes: downloaded,
                total_bytes: total,
                bytes_per_second: stats.bytes_per_second(),
            });
        }

        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        let written = file.metadata().await?.len();
        if written != total {
            return Err(EngineError::SizeMismatch {
                path: target.destination_path.clone(),
                expected: total,
                actual: written,
            }
            .into());
        }

        if total == 0 {
            progress(TransferProgress {
                downloaded_bytes: 0,
                total_bytes: 0,
                bytes_per_second: 0,
            });
        }
        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove partial download {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_math_handles_short_last_chunk() {
        let mb = 1024 * 1024;
        assert_eq!(chunk_count(5 * mb, 2 * mb), 3);
        assert_eq!(chunk_len(5 * mb, 2 * mb, 0), 2 * mb);
        assert_eq!(chunk_len(5 * mb, 2 * mb, 2), mb);
        assert_eq!(chunk_count(4 * mb, 2 * mb), 2);
        assert_eq!(chunk_len(4 * mb, 2 * mb, 1), 2 * mb);
        assert_eq!(chunk_count(0, 2 * mb), 0);
    }

    #[test]
    fn progress_fraction() {
        let p = TransferProgress {
            downloaded_bytes: 25,
            total_bytes: 100,
            bytes_per_second: 0,
        };
        assert!((p.fraction() - 0.25).abs() < f64::EPSILON);
        let empty = TransferProgress {
            downloaded_bytes: 0,
            total_bytes: 0,
            bytes_per_second: 0,
        };
        assert_eq!(empty.fraction(), 1.0);
    }
}
