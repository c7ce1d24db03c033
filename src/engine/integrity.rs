// Content hashing and manifest verification. Reports only, never repairs.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::catalog::FileManifestEntry;
use crate::config::HASH_BUFFER_BYTES;

/// SHA-256 of the file at `path` as lowercase hex. The file is streamed through a fixed buffer.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("reading {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_file(path: &Path, expected_digest: &str) -> Result<bool> {
    let actual = hash_file(path)?;
    Ok(actual.eq_ignore_ascii_case(expected_digest.trim()))
}

/// Entries of `manifest` that are missing, have the wrong size or hash, or could not be read.
pub fn verify_manifest(install_path: &Path, manifest: &[FileManifestEntry]) -> Vec<FileManifestEntry> {
    verify_manifest_with_progress(install_path, manifest, |_, _| {})
}

/// Like [`verify_manifest`], calling `progress(checked, total)` after each entry.
pub fn verify_manifest_with_progress<F>(
    install_path: &Path,
    manifest: &[FileManifestEntry],
    progress: F,
) -> Vec<FileManifestEntry>
where
    F: Fn(usize, usize),
{
    let total = manifest.len();
    let mut corrupted = Vec::new();

    for (index, entry) in manifest.iter().enumerate() {
        if let Some(reason) = check_entry(install_path, entry) {
            debug!("verification failed for {}: {}", entry.relative_path, reason);
            corrupted.push(entry.clone());
        }
        progress(index + 1, total);
    }

    if !corrupted.is_empty() {
        warn!(
            "{} of {} files failed verification under {}",
            corrupted.len(),
            total,
            install_path.display()
        );
    }
    corrupted
}

/// `None` when the entry verifies, otherwise a short reason.
fn check_entry(install_path: &Path, entry: &FileManifestEntry) -> Option<String> {
    let path = install_path.join(&entry.relative_path);
    let metadata = match std::fs::metadata(&path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Some("not a regular file".to_string()),
        Err(e) => return Some(format!("missing: {}", e)),
    };
    if metadata.len() != entry.size_bytes {
        return Some(format!(
            "size {} != expected {}",
            metadata.len(),
            entry.size_bytes
        ));
    }
    match verify_file(&path, &entry.content_hash) {
        Ok(true) => None,
        Ok(false) => Some("hash mismatch".to_string()),
        Err(e) => Some(format!("{:#}", e)),
    }
}

/// Manifest entry describing the file at `root/relative_path` as it exists now.
pub fn describe_file(root: &Path, relative_path: &str) -> Result<FileManifestEntry> {
    let path = root.join(relative_path);
    let size_bytes = std::fs::metadata(&path)
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    Ok(FileManifestEntry {
        relative_path: relative_path.to_string(),
        content_hash: hash_file(&path)?,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn hash_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, b"hello").unwrap();

        assert_eq!(hash_file(&path).unwrap(), HELLO_SHA256);
        assert!(verify_file(&path, &HELLO_SHA256.to_uppercase()).unwrap());
        assert!(!verify_file(&path, "00").unwrap());
    }

    #[test]
    fn hash_streams_files_larger_than_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..HASH_BUFFER_BYTES * 3 + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hex::encode(Sha256::digest(&data)));
    }

    #[test]
    fn manifest_reports_missing_resized_and_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("data")).unwrap();
        fs::write(root.join("ok.txt"), b"hello").unwrap();
        fs::write(root.join("data/changed.txt"), b"hellp").unwrap();
        fs::write(root.join("grown.txt"), b"hello!").unwrap();

        let entry = |path: &str| FileManifestEntry {
            relative_path: path.to_string(),
            content_hash: HELLO_SHA256.to_string(),
            size_bytes: 5,
        };
        let manifest = vec![
            entry("ok.txt"),
            entry("data/changed.txt"),
            entry("grown.txt"),
            entry("missing.txt"),
            entry("data"),
        ];

        let calls = Cell::new(0);
        let corrupted = verify_manifest_with_progress(root, &manifest, |done, total| {
            calls.set(calls.get() + 1);
            assert_eq!(total, 5);
            assert_eq!(done, calls.get());
        });
        let paths: Vec<_> = corrupted.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, ["data/changed.txt", "grown.txt", "missing.txt", "data"]);
        assert_eq!(calls.get(), 5);

        // Nothing changed on disk, so a second pass agrees.
        assert_eq!(verify_manifest(root, &manifest), corrupted);
    }

    #[test]
    fn describe_file_round_trips_through_verification() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"abc").unwrap();
        let entry = describe_file(dir.path(), "a.bin").unwrap();
        assert_eq!(entry.size_bytes, 3);
        assert!(verify_manifest(dir.path(), &[entry]).is_empty());
    }
}
