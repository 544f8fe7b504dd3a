use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

/// A decrypted copy that exists only for the duration of one comparison.
///
/// The file is removed by [`TemporaryArtifact::release`], or on drop when
/// the comparison bails out early.
#[derive(Debug)]
pub struct TemporaryArtifact {
    path: PathBuf,
    released: bool,
}

impl TemporaryArtifact {
    /// Reserve a unique path in `dir`. Nothing is created on disk.
    pub fn allocate(dir: &Path, side: &str, extension: &str) -> Self {
        let mut name = format!("dualstore-compare-{}-{side}", Uuid::new_v4().simple());
        if !extension.is_empty() {
            name.push('.');
            name.push_str(extension);
        }
        Self {
            path: dir.join(name),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file now. Returns a warning when removal failed; a file
    /// that was never written is not an error.
    pub fn release(mut self) -> Option<String> {
        self.released = true;
        remove(&self.path)
    }
}

impl Drop for TemporaryArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(msg) = remove(&self.path) {
            warn!("{msg}");
        }
    }
}

fn remove(path: &Path) -> Option<String> {
    match fs::remove_file(path) {
        Ok(()) => None,
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => Some(format!(
            "could not remove temporary file {}: {e}",
            path.display()
        )),
    }
}
