//! Whole-file encryption of a store into a sibling `.enc` artifact.
//!
//! Encryption and decryption never delete their input. Removing the
//! plaintext after encrypting, or the ciphertext after decrypting, is a
//! separate call ([`discard_artifact`]) that the caller makes once the
//! operator has confirmed it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, SyncError};
use crate::keystore::{ensure_key, load_key};
use crate::paths::{cipher_path_for, plain_path_for, CIPHER_SUFFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptMode {
    /// Operator-facing decryption; the caller may offer to discard the
    /// ciphertext afterwards.
    Standard,
    /// Output is a transient artifact owned by the caller. No discard step is
    /// offered and the caller must remove the output itself.
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct Decrypted {
    pub ciphertext: PathBuf,
    pub output: PathBuf,
    pub bytes: usize,
    pub mode: DecryptMode,
}

impl Decrypted {
    pub fn may_discard_ciphertext(&self) -> bool {
        self.mode == DecryptMode::Standard
    }
}

#[derive(Debug, Clone)]
pub struct CipherStore {
    key_path: PathBuf,
    suffix: String,
}

impl CipherStore {
    pub fn new(key_path: impl AsRef<Path>) -> Self {
        Self {
            key_path: key_path.as_ref().to_path_buf(),
            suffix: CIPHER_SUFFIX.to_string(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn cipher_path_for(&self, plain: &Path) -> PathBuf {
        cipher_path_for(plain, &self.suffix)
    }

    pub fn plain_path_for(&self, cipher: &Path) -> Option<PathBuf> {
        plain_path_for(cipher, &self.suffix)
    }

    /// Encrypt the store at `plain` into `plain + suffix`, creating the key
    /// on first use. Returns the ciphertext path.
    pub fn encrypt(&self, plain: &Path) -> Result<PathBuf> {
        if !plain.is_file() {
            return Err(SyncError::SourceNotFound(plain.to_path_buf()));
        }
        let key = ensure_key(&self.key_path)?.key;

        let plaintext = Zeroizing::new(fs::read(plain).map_err(|e| SyncError::io(plain, e))?);
        let blob = crypto::seal(key.as_bytes(), &plaintext).map_err(|source| {
            SyncError::EncryptionFailed {
                path: plain.to_path_buf(),
                source,
            }
        })?;

        let cipher = self.cipher_path_for(plain);
        write_atomic(&cipher, &blob)?;
        info!(
            source = %plain.display(),
            artifact = %cipher.display(),
            key = %key.fingerprint(),
            bytes = plaintext.len(),
            "store encrypted"
        );
        Ok(cipher)
    }

    /// Decrypt `cipher` into `output`, or into the conventional plaintext
    /// name when `output` is `None`. An existing file at the output path is
    /// replaced.
    pub fn decrypt(
        &self,
        cipher: &Path,
        output: Option<&Path>,
        mode: DecryptMode,
    ) -> Result<Decrypted> {
        if !cipher.is_file() {
            return Err(SyncError::CiphertextNotFound(cipher.to_path_buf()));
        }
        let key = load_key(&self.key_path)?;

        let output = match output {
            Some(p) => p.to_path_buf(),
            None => self
                .plain_path_for(cipher)
                .ok_or_else(|| SyncError::InvalidArtifactName {
                    path: cipher.to_path_buf(),
                    suffix: self.suffix.clone(),
                })?,
        };

        if same_file(&output, cipher) {
            return Err(SyncError::OutputIsCiphertext(cipher.to_path_buf()));
        }

        let blob = fs::read(cipher).map_err(|e| SyncError::io(cipher, e))?;
        let plaintext = Zeroizing::new(crypto::open(key.as_bytes(), &blob).map_err(|source| {
            SyncError::DecryptionFailed {
                path: cipher.to_path_buf(),
                source,
            }
        })?);
        write_atomic(&output, &plaintext)?;

        match mode {
            DecryptMode::Standard => info!(
                artifact = %cipher.display(),
                output = %output.display(),
                key = %key.fingerprint(),
                "store decrypted"
            ),
            DecryptMode::Suppressed => debug!(
                artifact = %cipher.display(),
                output = %output.display(),
                "transient copy decrypted"
            ),
        }

        Ok(Decrypted {
            ciphertext: cipher.to_path_buf(),
            output,
            bytes: plaintext.len(),
            mode,
        })
    }
}

/// Delete a plaintext or ciphertext artifact. Callers invoke this only
/// after the operator confirmed the deletion.
pub fn discard_artifact(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(SyncError::SourceNotFound(path.to_path_buf()));
    }
    fs::remove_file(path).map_err(|e| SyncError::io(path, e))?;
    info!(path = %path.display(), "artifact discarded");
    Ok(())
}

/// What happened to one store in [`discard_stores`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiscardOutcome {
    Removed,
    NotFound,
    /// Another program holds the file open, or it is not writable.
    InUse { reason: String },
    Failed { reason: String },
}

impl DiscardOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DiscardOutcome::InUse { .. } | DiscardOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreDiscard {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: DiscardOutcome,
}

/// Remove every store in `paths`, one at a time. A failure on one store
/// does not stop the others; each gets its own outcome.
pub fn discard_stores(paths: &[PathBuf]) -> Vec<StoreDiscard> {
    paths
        .iter()
        .map(|path| {
            let outcome = match discard_artifact(path) {
                Ok(()) => DiscardOutcome::Removed,
                Err(err) => classify_discard_error(err),
            };
            if outcome.is_failure() {
                warn!(path = %path.display(), ?outcome, "store not removed");
            }
            StoreDiscard {
                path: path.clone(),
                outcome,
            }
        })
        .collect()
}

fn classify_discard_error(err: SyncError) -> DiscardOutcome {
    match err {
        SyncError::SourceNotFound(_) => DiscardOutcome::NotFound,
        SyncError::Io { source, .. } if is_locked(&source) => DiscardOutcome::InUse {
            reason: format!("{source}; close any program using the file and retry"),
        },
        SyncError::Io { source, .. } => DiscardOutcome::Failed {
            reason: source.to_string(),
        },
        other => DiscardOutcome::Failed {
            reason: other.to_string(),
        },
    }
}

fn is_locked(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION and ERROR_LOCK_VIOLATION.
    #[cfg(windows)]
    {
        if matches!(err.raw_os_error(), Some(32) | Some(33)) {
            return true;
        }
    }
    err.kind() == io::ErrorKind::PermissionDenied
}

/// Write `bytes` to a staging file beside `dest`, then rename over `dest`.
fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{file_name}.{}.staging", Uuid::new_v4()));

    let written = File::create(&staging).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&staging, dest)) {
        let _ = fs::remove_file(&staging);
        return Err(SyncError::io(dest, e));
    }
    fsync_dir(parent).map_err(|e| SyncError::io(parent, e))
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(path)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// True when `a` and `b` name the same file, including through `.` segments
/// or symlinks when both exist.
fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
