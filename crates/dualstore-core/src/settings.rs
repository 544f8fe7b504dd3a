use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::paths::{
    cipher_path_for, default_config_path, plain_path_for, CIPHER_SUFFIX, DEFAULT_RELATIONAL_KEY,
    DEFAULT_RELATIONAL_STORE, DEFAULT_TABLE, DEFAULT_TABULAR_KEY, DEFAULT_TABULAR_STORE,
};
use crate::sources::StoreKind;

/// Operator settings. Relative paths resolve against the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub tabular_store: PathBuf,
    pub relational_store: PathBuf,
    pub table: String,
    pub tabular_key: PathBuf,
    pub relational_key: PathBuf,
    pub cipher_suffix: String,
    /// Where encrypted comparisons stage their decrypted copies.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tabular_store: DEFAULT_TABULAR_STORE.into(),
            relational_store: DEFAULT_RELATIONAL_STORE.into(),
            table: DEFAULT_TABLE.into(),
            tabular_key: DEFAULT_TABULAR_KEY.into(),
            relational_key: DEFAULT_RELATIONAL_KEY.into(),
            cipher_suffix: CIPHER_SUFFIX.into(),
            scratch_dir: None,
        }
    }
}

impl SyncSettings {
    pub fn tabular_cipher(&self) -> PathBuf {
        cipher_path_for(&self.tabular_store, &self.cipher_suffix)
    }

    pub fn relational_cipher(&self) -> PathBuf {
        cipher_path_for(&self.relational_store, &self.cipher_suffix)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Key that belongs to the store at `path`, plaintext or ciphertext: the
    /// relational key for database files, the tabular key otherwise.
    pub fn key_for(&self, path: &Path) -> &Path {
        let plain =
            plain_path_for(path, &self.cipher_suffix).unwrap_or_else(|| path.to_path_buf());
        match StoreKind::infer(&plain, &self.table) {
            Ok(StoreKind::Relational { .. }) => &self.relational_key,
            _ => &self.tabular_key,
        }
    }
}

/// Load settings from `explicit`, or from the default lookup chain when
/// `None`. Falls back to defaults when no file is found.
pub fn load_settings(explicit: Option<&Path>) -> Result<SyncSettings> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(SyncSettings::default()),
        },
    };
    let data = fs::read(&path).map_err(|e| SyncError::io(&path, e))?;
    serde_json::from_slice(&data).map_err(|e| SyncError::Config {
        path,
        reason: e.to_string(),
    })
}
