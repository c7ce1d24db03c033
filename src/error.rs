// Typed failures carried inside `anyhow::Error` so callers can branch on them with `downcast_ref`.

use std::path::PathBuf;

use crate::catalog::FileManifestEntry;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("auth_rejected: HTTP {status}")]
    AuthRejected { status: u16 },

    #[error("{what} failed: HTTP {status}")]
    RemoteStatus { what: String, status: u16 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("content hash mismatch for {path}: expected {expected}, found {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{} file(s) failed verification under {root}", corrupted.len())]
    IntegrityFailure {
        root: PathBuf,
        corrupted: Vec<FileManifestEntry>,
    },

    #[error("local state file {path} is corrupted: {reason}")]
    CorruptedState { path: PathBuf, reason: String },

    #[error("an install operation is already running for title {title_id}")]
    OperationInProgress { title_id: String },

    #[error("title {title_id} is not installed")]
    NotInstalled { title_id: String },

    #[error("no launchable executable found under {root}")]
    ExecutableNotFound { root: PathBuf },
}

impl EngineError {
    /// True when `err` (or anything in its context chain) is an authorization rejection.
    pub fn is_auth_rejected(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<EngineError>(),
                Some(EngineError::AuthRejected { .. })
            )
        })
    }

    /// True when `err` wraps a cooperative cancellation.
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<EngineError>(), Some(EngineError::Cancelled)))
    }
}
