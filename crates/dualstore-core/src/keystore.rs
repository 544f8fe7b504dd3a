//! Key artifact lifecycle: create once, persist, load on demand.
//!
//! The file holds a format tag followed by the raw key bytes. There is no
//! rotation and no recovery path: losing the file loses every artifact sealed
//! with it.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::Path;

use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto::{generate_key, KEY_LEN};
use crate::error::{Result, SyncError};

pub const KEY_MAGIC: &[u8; 8] = b"DSKEY01\0";
pub const KEY_FILE_LEN: usize = KEY_MAGIC.len() + KEY_LEN;

/// Symmetric key material. Wiped from memory on drop.
#[derive(Clone)]
pub struct Key(Zeroizing<[u8; KEY_LEN]>);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short identifier safe to show in logs.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.0[..]);
        hex::encode(&digest.as_bytes()[..8])
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Key {}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.fingerprint()).finish()
    }
}

/// Result of [`ensure_key`]: the key plus whether this call created it.
#[derive(Debug)]
pub struct EnsuredKey {
    pub key: Key,
    pub created: bool,
}

/// Return the key stored at `path`, generating and persisting one first if
/// the file does not exist. An existing file is never overwritten.
pub fn ensure_key(path: &Path) -> Result<EnsuredKey> {
    match load_key(path) {
        Ok(key) => return Ok(EnsuredKey { key, created: false }),
        Err(_) if !path.exists() => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| SyncError::key(path, e.to_string()))?;
    }

    let key = Key::from_bytes(generate_key());
    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        // Lost a creation race: the other writer's key wins.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return load_key(path).map(|key| EnsuredKey { key, created: false })
        }
        Err(e) => return Err(SyncError::key(path, format!("cannot create key file: {e}"))),
    };

    let mut contents = Zeroizing::new(Vec::with_capacity(KEY_FILE_LEN));
    contents.extend_from_slice(KEY_MAGIC);
    contents.extend_from_slice(key.as_bytes());
    fill_new_key_file(path, file, |file| {
        file.write_all(&contents)?;
        file.sync_all()?;
        restrict_permissions(path)
    })?;

    info!(path = %path.display(), fingerprint = %key.fingerprint(), "generated new key");
    Ok(EnsuredKey { key, created: true })
}

/// Load an existing key without ever creating one.
pub fn load_key(path: &Path) -> Result<Key> {
    let data = Zeroizing::new(match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SyncError::key(path, "key file does not exist"))
        }
        Err(e) => return Err(SyncError::key(path, format!("cannot read key file: {e}"))),
    });

    if data.len() != KEY_FILE_LEN || &data[..KEY_MAGIC.len()] != KEY_MAGIC {
        return Err(SyncError::key(path, "not a dualstore key file"));
    }
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&data[KEY_MAGIC.len()..]);
    let key = Key::from_bytes(bytes);
    bytes.fill(0);
    Ok(key)
}

/// Run `write` on a file this call just created. On failure the file is
/// removed so a half-written key never blocks the next `ensure_key`.
fn fill_new_key_file(
    path: &Path,
    mut file: File,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> Result<()> {
    let written = write(&mut file);
    drop(file);
    written.map_err(|e| {
        if let Err(rm) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %rm, "could not remove incomplete key file");
        }
        SyncError::key(path, format!("cannot write key file: {e}"))
    })
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ensure_key_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.key");

        let first = ensure_key(&path).unwrap();
        assert!(first.created);
        let on_disk = fs::read(&path).unwrap();

        let second = ensure_key(&path).unwrap();
        assert!(!second.created);
        assert_eq!(first.key, second.key);
        assert_eq!(fs::read(&path).unwrap(), on_disk);
    }

    #[test]
    fn ensure_key_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("psw.key");
        ensure_key(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), KEY_FILE_LEN as u64);
    }

    #[test]
    fn load_key_never_creates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.key");
        assert!(matches!(
            load_key(&path),
            Err(SyncError::KeyUnavailable { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn malformed_key_file_is_rejected_and_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.key");
        fs::write(&path, b"not a key").unwrap();

        assert!(matches!(
            ensure_key(&path),
            Err(SyncError::KeyUnavailable { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), b"not a key");
    }

    #[test]
    fn failed_key_write_leaves_no_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.key");
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();

        let err = fill_new_key_file(&path, file, |file| {
            file.write_all(&KEY_MAGIC[..3])?;
            Err(io::Error::new(ErrorKind::Other, "no space left on device"))
        })
        .unwrap_err();
        assert!(err.to_string().contains("no space left"));
        assert!(!path.exists());

        // The next attempt starts from scratch instead of tripping over a
        // truncated file.
        assert!(ensure_key(&path).unwrap().created);
    }

    #[test]
    fn fingerprint_does_not_leak_key() {
        let key = Key::from_bytes([7u8; KEY_LEN]);
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(!format!("{key:?}").contains("070707"));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.key");
        ensure_key(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
