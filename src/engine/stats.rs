// Transfer statistics: bytes moved, chunks completed, credential refreshes, throughput.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct ThroughputSample {
    at: Instant,
    downloaded_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferStatsSnapshot {
    pub downloaded_bytes: u64,
    pub chunks_completed: u32,
    pub auth_refreshes: u32,
    pub bytes_per_second: u64,
}

pub struct TransferStats {
    downloaded_bytes: AtomicU64,
    chunks_completed: AtomicU32,
    auth_refreshes: AtomicU32,
    last_sample: Mutex<ThroughputSample>,
    last_bps: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            downloaded_bytes: AtomicU64::new(0),
            chunks_completed: AtomicU32::new(0),
            auth_refreshes: AtomicU32::new(0),
            last_sample: Mutex::new(ThroughputSample {
                at: Instant::now(),
                downloaded_bytes: 0,
            }),
            last_bps: AtomicU64::new(0),
        }
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_chunk(&self) {
        self.chunks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_refresh(&self) {
        self.auth_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Throughput since the previous call. Samples closer than 100 ms reuse the last value.
    pub fn bytes_per_second(&self) -> u64 {
        let now = Instant::now();
        let current = self.downloaded_bytes.load(Ordering::Relaxed);
        let mut sample = self.last_sample.lock();
        let elapsed = now.duration_since(sample.at).as_secs_f64();
        if elapsed > 0.1 {
            let bps = ((current - sample.downloaded_bytes) as f64 / elapsed) as u64;
            sample.at = now;
            sample.downloaded_bytes = current;
            self.last_bps.store(bps, Ordering::Relaxed);
        }
        self.last_bps.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            auth_refreshes: self.auth_refreshes.load(Ordering::Relaxed),
            bytes_per_second: self.bytes_per_second(),
        }
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = TransferStats::new();
        stats.record_downloaded(1000);
        stats.record_downloaded(500);
        stats.record_chunk();
        stats.record_chunk();
        stats.record_auth_refresh();

        let snap = stats.snapshot();
        assert_eq!(snap.downloaded_bytes, 1500);
        assert_eq!(snap.chunks_completed, 2);
        assert_eq!(snap.auth_refreshes, 1);
    }

    #[test]
    fn test_throughput_after_interval() {
        let stats = TransferStats::new();
        std::thread::sleep(std::time::Duration::from_millis(150));
        stats.record_downloaded(4096);
        assert!(stats.bytes_per_second() > 0);
    }
}
