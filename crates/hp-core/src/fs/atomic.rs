use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("Failed to persist temp file: {0}")]
    TempFile(#[from] tempfile::PersistError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parent directory does not exist: {0}")]
    NoParentDir(PathBuf),
}

/// Atomically replace `path` with `content`.
///
/// Process: write to temp file in same directory -> fsync -> chmod -> rename
/// over target -> fsync the directory. Readers see either the old file or the
/// new one, never a truncated mix.
pub fn atomic_write(path: &Path, content: &[u8], mode: Option<u32>) -> Result<(), AtomicWriteError> {
    let parent = path
        .parent()
        .ok_or_else(|| AtomicWriteError::NoParentDir(path.to_path_buf()))?;

    if !parent.exists() {
        return Err(AtomicWriteError::NoParentDir(parent.to_path_buf()));
    }

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;

    if let Some(m) = mode {
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(m))?;
    }

    debug!(path = %path.display(), bytes = content.len(), "Atomic write");
    temp.persist(path)?;

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Like [`atomic_write`], creating missing parent directories first.
pub fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<(), AtomicWriteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_write(path, content, Some(mode))
}

/// Config file readable by daemons (0644).
pub fn atomic_write_config(path: &Path, content: &str) -> Result<(), AtomicWriteError> {
    write_file(path, content.as_bytes(), 0o644)
}

/// File holding secrets or hashes (0600).
pub fn atomic_write_secret(path: &Path, content: &str) -> Result<(), AtomicWriteError> {
    write_file(path, content.as_bytes(), 0o600)
}

/// Remove a file if present. Returns whether something was removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => {
            fs::remove_file(path)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
