// Executable resolution: catalog-declared entry point first, heuristic tree scan as fallback.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::Platform;
use crate::config::STAGING_DIR_PREFIX;
use crate::error::EngineError;

/// Find the program to launch for an install rooted at `root`.
///
/// `entry_point` is a path relative to `root`; when it names an existing file it
/// wins outright. Otherwise the tree is scanned in file-name order and the first
/// platform-appropriate candidate is returned.
pub fn locate_executable(
    root: &Path,
    platform: Platform,
    entry_point: Option<&str>,
    name_token: Option<&str>,
) -> Result<PathBuf> {
    if let Some(entry) = entry_point.filter(|e| !e.trim().is_empty()) {
        let declared = root.join(entry);
        if declared.is_file() {
            return Ok(declared);
        }
        warn!(
            "declared entry point {} missing, falling back to scan",
            declared.display()
        );
    }

    let token = name_token.map(str::to_lowercase);
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_staging(e.file_name()));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable entry during executable scan: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let matched = match platform {
            Platform::Windows => has_extension(path, "exe"),
            Platform::Macos => is_app_bundle_binary(path),
            Platform::Linux => is_linux_candidate(path, token.as_deref()),
        };
        if matched {
            debug!("executable scan picked {}", path.display());
            return Ok(path.to_path_buf());
        }
    }

    Err(EngineError::ExecutableNotFound {
        root: root.to_path_buf(),
    }
    .into())
}

fn is_staging(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with(STAGING_DIR_PREFIX)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// `<Name>.app/Contents/MacOS/<binary>`
fn is_app_bundle_binary(path: &Path) -> bool {
    let Some(macos) = path.parent() else {
        return false;
    };
    let Some(contents) = macos.parent() else {
        return false;
    };
    let Some(bundle) = contents.parent() else {
        return false;
    };
    macos.file_name().is_some_and(|n| n == "MacOS")
        && contents.file_name().is_some_and(|n| n == "Contents")
        && has_extension(bundle, "app")
}

fn is_linux_candidate(path: &Path, token: Option<&str>) -> bool {
    if path.extension().is_some() || !is_executable(path) {
        return false;
    }
    match token {
        Some(token) => path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase().contains(token))
            .unwrap_or(false),
        None => true,
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}
