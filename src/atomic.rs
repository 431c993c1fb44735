//! All-or-nothing file replacement shared by the status and ledger files.
//!
//! The new contents go to a temp file in the destination directory, are
//! fsynced, then renamed over the target. Readers see the old file or the new
//! one, never a prefix.
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), AtomicWriteError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| AtomicWriteError::Write {
        path: dir.to_path_buf(),
        source: e,
    })?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| AtomicWriteError::Write {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;

    tmp.persist(path).map_err(|e| AtomicWriteError::Persist {
        to: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Errors from an atomic replace. The temp file is removed on every failure
/// path (`NamedTempFile` cleans up on drop).
#[derive(Debug)]
pub enum AtomicWriteError {
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Persist {
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for AtomicWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtomicWriteError::Write { path, source } => {
                write!(f, "failed to write temp file in {}: {source}", path.display())
            }
            AtomicWriteError::Persist { to, source } => {
                write!(f, "failed to rename temp file onto {}: {source}", to.display())
            }
        }
    }
}

impl std::error::Error for AtomicWriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AtomicWriteError::Write { source, .. } => Some(source),
            AtomicWriteError::Persist { source, .. } => Some(source),
        }
    }
}
