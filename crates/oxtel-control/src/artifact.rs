//! On-disk storage for uploaded plugin binaries. Every load gets its own
//! private directory (mode 0700 on POSIX) under an ephemeral root; the
//! directory is removed on unload and on failed loads.

use crate::error::{ControlError, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub dir: PathBuf,
    pub checksum: [u8; 32],
}

impl Artifact {
    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        let root = root.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("oxtel-plugins-{}", std::process::id()))
        });
        std::fs::create_dir_all(&root)?;
        restrict_permissions(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist uploaded bytes to a fresh private directory, make the file
    /// executable, and record its SHA-256. The file is read back and
    /// re-hashed: a digest that disagrees with the upload buffer fails
    /// the store and removes the directory.
    pub fn store(&self, filename: &str, bytes: &[u8]) -> Result<Artifact> {
        let filename = sanitize_filename(filename);
        let dir = self.root.join(oxtel_common::id::next_id());
        std::fs::create_dir_all(&dir)?;
        restrict_permissions(&dir)?;

        let path = dir.join(filename);
        std::fs::write(&path, bytes)?;
        make_executable(&path)?;

        let expected = checksum(bytes);
        let written = match std::fs::read(&path) {
            Ok(written) => written,
            Err(e) => {
                self.remove(&dir);
                return Err(ControlError::Io(e));
            }
        };
        if checksum(&written) != expected {
            self.remove(&dir);
            return Err(ControlError::ChecksumMismatch);
        }

        Ok(Artifact {
            path,
            dir,
            checksum: expected,
        })
    }

    /// Remove an artifact's private directory. Best effort; a missing
    /// directory is not an error.
    pub fn remove(&self, artifact_dir: &Path) {
        if let Err(e) = std::fs::remove_dir_all(artifact_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %artifact_dir.display(), error = %e, "failed to remove plugin artifact");
            }
        }
    }

    /// Remove the whole store. Called on daemon shutdown.
    pub fn purge(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(root = %self.root.display(), error = %e, "failed to purge artifact store");
            }
        }
    }
}

/// SHA-256 digest, shared by the store's write/read-back cross-check.
pub fn checksum(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Inflate a gzip-compressed upload (`Plugin-Compression: gzip`).
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(ControlError::Io)?;
    Ok(out)
}

fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() {
        "plugin".to_string()
    } else {
        base
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn store_and_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Some(tmp.path().join("store"))).unwrap();

        let artifact = store.store("collector-mock", b"#!/bin/sh\nexit 0\n").unwrap();
        assert!(artifact.path.exists());
        assert_eq!(artifact.checksum, checksum(b"#!/bin/sh\nexit 0\n"));

        store.remove(&artifact.dir);
        assert!(!artifact.path.exists());
    }

    #[test]
    fn filenames_cannot_escape_the_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Some(tmp.path().join("store"))).unwrap();
        let artifact = store.store("../../evil", b"data").unwrap();
        assert!(artifact.path.starts_with(store.root()));
        assert_eq!(artifact.path.file_name().unwrap(), "evil");
    }

    #[test]
    fn gunzip_inflates_compressed_uploads() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plugin bytes").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(gunzip(&compressed).unwrap(), b"plugin bytes");
        assert!(gunzip(b"not gzip").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn stored_artifacts_are_private_and_executable() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Some(tmp.path().join("store"))).unwrap();
        let artifact = store.store("plugin", b"data").unwrap();

        let dir_mode = std::fs::metadata(&artifact.dir).unwrap().permissions().mode();
        let file_mode = std::fs::metadata(&artifact.path).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o700);
    }
}
