use directories::ProjectDirs;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "dualstore";
pub const APP_NAME: &str = "dualstore";

pub const CIPHER_SUFFIX: &str = ".enc";
pub const DEFAULT_TABULAR_STORE: &str = "persone.xlsx";
pub const DEFAULT_RELATIONAL_STORE: &str = "persone.db";
pub const DEFAULT_TABLE: &str = "persone";
pub const DEFAULT_TABULAR_KEY: &str = "key.key";
pub const DEFAULT_RELATIONAL_KEY: &str = "psw.key";

pub const CONFIG_ENV: &str = "DUALSTORE_CONFIG";
pub const LOCAL_CONFIG_FILE: &str = "dualstore.json";

/// Ciphertext path for a plaintext store: the plaintext path with `suffix`
/// appended (`persone.db` -> `persone.db.enc`).
pub fn cipher_path_for(plain: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(plain.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Inverse of [`cipher_path_for`]. `None` when `cipher` does not end with
/// `suffix` or would leave an empty name.
pub fn plain_path_for(cipher: &Path, suffix: &str) -> Option<PathBuf> {
    let name = cipher.to_str()?;
    let stripped = name.strip_suffix(suffix)?;
    if stripped.is_empty() || stripped.ends_with(std::path::is_separator) {
        return None;
    }
    Some(PathBuf::from(stripped))
}

pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).map(|d| d.config_dir().to_path_buf())
}

/// Locate the settings file: `$DUALSTORE_CONFIG`, then `./dualstore.json`,
/// then `settings.json` in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(override_path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(override_path));
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    config_dir()
        .map(|dir| dir.join("settings.json"))
        .filter(|p| p.exists())
}
