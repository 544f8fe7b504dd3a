use std::path::{Path, PathBuf};

use crate::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures surfaced by the reconciliation core.
///
/// Every variant carries the artifact(s) it is about, so callers can report
/// exactly which file was missing or invalid.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("key unavailable at {}: {reason}", .path.display())]
    KeyUnavailable { path: PathBuf, reason: String },

    #[error("source store not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("ciphertext artifact not found: {}", .0.display())]
    CiphertextNotFound(PathBuf),

    #[error("cannot decrypt {} (wrong key or corrupted file)", .path.display())]
    DecryptionFailed {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },

    #[error("cannot encrypt {}", .path.display())]
    EncryptionFailed {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },

    #[error("cannot read rows from {}: {reason}", .path.display())]
    SchemaMismatch { path: PathBuf, reason: String },

    #[error("columns missing from {store}: {}", .columns.join(", "))]
    MissingColumns { store: String, columns: Vec<String> },

    #[error("no comparable fields between {left} and {right}")]
    NoComparableFields { left: String, right: String },

    #[error("missing required inputs for comparison: {}", join_paths(.0))]
    MissingInput(Vec<PathBuf>),

    #[error("decrypted artifact {} is missing or empty", .0.display())]
    EmptyDecryptedArtifact(PathBuf),

    #[error("cannot derive a plaintext name from {}: expected suffix {suffix}", .path.display())]
    InvalidArtifactName { path: PathBuf, suffix: String },

    #[error("refusing to decrypt {} onto itself", .0.display())]
    OutputIsCiphertext(PathBuf),

    #[error("invalid settings file {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },

    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn schema(path: &Path, reason: impl Into<String>) -> Self {
        SyncError::SchemaMismatch {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn key(path: &Path, reason: impl Into<String>) -> Self {
        SyncError::KeyUnavailable {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
