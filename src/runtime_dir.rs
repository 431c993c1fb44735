use std::path::{Path, PathBuf};

/// Manages the runtime directory layout shared by worker and watchdog.
///
/// Every artifact the two processes exchange lives under one directory
/// (default `/tmp/shepherd`, kept off network filesystems where advisory
/// locks are unreliable). File names are derived from the worker identity so
/// several supervised workers can share a directory.
#[derive(Debug, Clone)]
pub struct RuntimeDir {
    root: PathBuf,
    identity: String,
}

impl RuntimeDir {
    /// Create a new RuntimeDir for the given root and worker identity.
    pub fn new(root: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            identity: identity.into(),
        }
    }

    /// The root directory (e.g. `/tmp/shepherd`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Identity of the lock that serializes watchdog invocations.
    pub fn watchdog_identity(&self) -> String {
        format!("{}.watchdog", self.identity)
    }

    /// Path of the lock file for an arbitrary lock identity.
    pub fn lock_for(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{identity}.lock"))
    }

    /// Path to the worker's singleton lock file.
    #[cfg(test)]
    pub fn lock(&self) -> PathBuf {
        self.lock_for(&self.identity)
    }

    /// Path to the worker's status (heartbeat) file.
    pub fn status(&self) -> PathBuf {
        self.root.join(format!("{}.status", self.identity))
    }

    /// Path to the watchdog's restart ledger.
    pub fn ledger(&self) -> PathBuf {
        self.root.join(format!("{}.restarts", self.identity))
    }

    /// Append-only watchdog decision log.
    pub fn watchdog_log(&self) -> PathBuf {
        self.root.join("watchdog.log")
    }

    /// Captured stdout of the most recently launched worker.
    pub fn stdout_log(&self) -> PathBuf {
        self.root.join(format!("{}.stdout.log", self.identity))
    }

    /// Captured stderr of the most recently launched worker.
    pub fn stderr_log(&self) -> PathBuf {
        self.root.join(format!("{}.stderr.log", self.identity))
    }

    /// Create the root directory if it does not exist.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_are_derived_from_identity() {
        let dir = RuntimeDir::new("/tmp/shepherd", "ingest");
        assert_eq!(dir.lock(), PathBuf::from("/tmp/shepherd/ingest.lock"));
        assert_eq!(dir.status(), PathBuf::from("/tmp/shepherd/ingest.status"));
        assert_eq!(dir.ledger(), PathBuf::from("/tmp/shepherd/ingest.restarts"));
        assert_eq!(dir.watchdog_log(), PathBuf::from("/tmp/shepherd/watchdog.log"));
        assert_eq!(
            dir.stderr_log(),
            PathBuf::from("/tmp/shepherd/ingest.stderr.log")
        );
    }

    #[test]
    fn test_watchdog_lock_is_distinct_from_worker_lock() {
        let dir = RuntimeDir::new("/run/x", "ingest");
        let watchdog = dir.lock_for(&dir.watchdog_identity());
        assert_eq!(watchdog, PathBuf::from("/run/x/ingest.watchdog.lock"));
        assert_ne!(watchdog, dir.lock());
    }

    #[test]
    fn test_init_creates_nested_root() {
        let tmp = tempdir().unwrap();
        let dir = RuntimeDir::new(tmp.path().join("a").join("b"), "w");
        assert!(dir.init().unwrap());
        assert!(dir.root().is_dir());
        assert!(!dir.init().unwrap());
    }
}
