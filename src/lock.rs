/// Singleton ownership: one advisory-locked file per identity, holding the
/// owner's pid as text.
///
/// The lock file exists exactly while a live process holds the advisory lock
/// on it. A file whose recorded pid is dead is a stale lock and is reclaimed
/// on the next acquisition.
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How many times acquisition may restart because the file was unlinked or
/// replaced between open and lock.
const MAX_REOPEN_ATTEMPTS: u32 = 4;

/// Platform exclusive-lock primitive.
///
/// Locks are tied to the open file handle and released when it closes, so
/// there is no explicit unlock.
pub trait ExclusiveLock {
    /// Ok(true) if the lock was taken, Ok(false) if another handle holds it.
    fn try_lock_exclusive(&self, file: &File) -> std::io::Result<bool>;

    /// Whether some handle currently holds the exclusive lock. Must not keep
    /// any lock of its own past the call.
    fn is_held(&self, file: &File) -> std::io::Result<bool>;
}

/// `flock(2)` on Unix, `LockFileEx` on Windows, via fs2.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvisoryLock;

impl ExclusiveLock for AdvisoryLock {
    fn try_lock_exclusive(&self, file: &File) -> std::io::Result<bool> {
        match fs2::FileExt::try_lock_exclusive(file) {
            Ok(()) => Ok(true),
            Err(e) if is_contended(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_held(&self, file: &File) -> std::io::Result<bool> {
        match fs2::FileExt::try_lock_shared(file) {
            Ok(()) => {
                fs2::FileExt::unlock(file)?;
                Ok(false)
            }
            Err(e) if is_contended(&e) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Acquires and inspects per-identity lock files in one directory.
pub struct LockManager<L = AdvisoryLock> {
    dir: PathBuf,
    lock: L,
    pid: u32,
    liveness: fn(u32) -> bool,
}

impl LockManager<AdvisoryLock> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_lock(dir, AdvisoryLock)
    }
}

impl<L: ExclusiveLock> LockManager<L> {
    pub fn with_lock(dir: impl Into<PathBuf>, lock: L) -> Self {
        Self {
            dir: dir.into(),
            lock,
            pid: std::process::id(),
            liveness: crate::process::pid_alive,
        }
    }

    /// Replace the pid liveness probe (simulated process tables in tests).
    pub fn with_liveness(mut self, liveness: fn(u32) -> bool) -> Self {
        self.liveness = liveness;
        self
    }

    /// Path of the lock file for `identity`.
    pub fn path_for(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{identity}.lock"))
    }

    /// Take exclusive ownership of `identity`.
    ///
    /// Fails with `AlreadyRunning` if a live process holds the lock. A lock
    /// left behind by a dead process is reclaimed (logged as "stale lock
    /// recovered") and the handle records the dead owner's pid.
    pub fn acquire(&self, identity: &str) -> Result<LockHandle, LockError> {
        let path = self.path_for(identity);
        let mut reclaimed: Option<u32> = None;

        for _ in 0..MAX_REOPEN_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| LockError::Io {
                    path: path.clone(),
                    source: e,
                })?;

            let locked = self
                .lock
                .try_lock_exclusive(&file)
                .map_err(|e| LockError::Io {
                    path: path.clone(),
                    source: e,
                })?;

            if !locked {
                let recorded = read_pid(&mut file);
                match recorded {
                    Some(pid) if !(self.liveness)(pid) && reclaimed.is_none() => {
                        // Held, but by a descriptor whose recorded owner is
                        // gone. Unlink and start over on a fresh inode, unless
                        // a new owner recorded itself or replaced the file in
                        // the meantime.
                        if !names_same_file(&file, &path) || read_pid(&mut file) != Some(pid) {
                            tracing::debug!(identity, "lock file changed while inspecting, retrying");
                            continue;
                        }
                        tracing::warn!(
                            identity,
                            stale_pid = pid,
                            path = %path.display(),
                            "stale lock recovered: recorded owner is not running, removing lock file"
                        );
                        drop(file);
                        remove_if_present(&path).map_err(|e| LockError::Io {
                            path: path.clone(),
                            source: e,
                        })?;
                        reclaimed = Some(pid);
                        continue;
                    }
                    _ => {
                        return Err(LockError::AlreadyRunning {
                            identity: identity.to_string(),
                            pid: recorded,
                        })
                    }
                }
            }

            // Claim the file before anything else: a contender that sees our
            // pid treats the lock as live.
            let previous = read_pid(&mut file);
            record_pid(&mut file, self.pid).map_err(|e| LockError::Io {
                path: path.clone(),
                source: e,
            })?;

            let stale = previous.filter(|p| *p != self.pid && reclaimed.is_none());
            if let Some(prev) = stale {
                // The advisory lock was free, so whoever wrote this pid no
                // longer holds it.
                if (self.liveness)(prev) {
                    tracing::warn!(
                        identity,
                        previous_pid = prev,
                        "lock file named a running process that did not hold the lock; taking over"
                    );
                } else {
                    tracing::warn!(
                        identity,
                        stale_pid = prev,
                        path = %path.display(),
                        "stale lock recovered: previous owner exited without releasing"
                    );
                }
            }

            reclaimed = reclaimed.or(stale);
            if !names_same_file(&file, &path) {
                // Unlinked by a contender that saw the old pid before ours
                // landed. The file we wrote to is orphaned; go again.
                tracing::debug!(identity, "lock file replaced while locking, retrying");
                continue;
            }

            tracing::info!(identity, pid = self.pid, "process lock acquired");
            return Ok(LockHandle {
                identity: identity.to_string(),
                pid: self.pid,
                path,
                file: Some(file),
                recovered_from: reclaimed,
            });
        }

        Err(LockError::Unstable { path })
    }

    /// Read-only view of who holds `identity`. The advisory lock is probed,
    /// never taken: a pid in a file nobody holds is reported but not alive.
    pub fn inspect(&self, identity: &str) -> Result<Option<LockOwner>, LockError> {
        let path = self.path_for(identity);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::Io { path, source: e }),
        };
        let Some(pid) = read_pid(&mut file) else {
            return Ok(None);
        };
        let acquired_at = file
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .map_err(|e| LockError::Io {
                path: path.clone(),
                source: e,
            })?;
        let held = self.lock.is_held(&file).map_err(|e| LockError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(Some(LockOwner {
            pid,
            acquired_at,
            held,
            alive: held && (self.liveness)(pid),
        }))
    }
}

/// Exclusive ownership of one identity. Released explicitly with
/// [`LockHandle::release`] or, as a last resort, on drop.
#[derive(Debug)]
pub struct LockHandle {
    identity: String,
    pid: u32,
    path: PathBuf,
    file: Option<File>,
    recovered_from: Option<u32>,
}

impl LockHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True until the handle is released.
    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        self.file.is_some()
    }

    /// Pid of the dead owner whose lock was reclaimed, if any.
    pub fn recovered_from(&self) -> Option<u32> {
        self.recovered_from
    }

    /// Remove the lock file, then drop the advisory lock.
    ///
    /// The file goes first so it never exists unlocked with our pid in it.
    /// Only our own inode is removed; a file some later owner created at the
    /// same path is left alone. Idempotent.
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if names_same_file(&file, &self.path) {
            if let Err(e) = remove_if_present(&self.path) {
                // Still close the handle: holding the lock past this point
                // would block every future owner.
                drop(file);
                return Err(LockError::Io {
                    path: self.path.clone(),
                    source: e,
                });
            }
        }
        drop(file);
        tracing::info!(identity = %self.identity, "process lock released");
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "failed to release lock on drop");
        }
    }
}

/// Observed lock holder, as seen by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    /// When the pid was written (lock file mtime).
    pub acquired_at: DateTime<Utc>,
    /// Some handle holds the advisory lock on the file.
    pub held: bool,
    /// Held, and the recorded pid is running.
    pub alive: bool,
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn record_pid(file: &mut File, pid: u32) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether `path` still names the inode behind `file`.
#[cfg(unix)]
fn names_same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn names_same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Errors from lock operations.
#[derive(Debug)]
pub enum LockError {
    /// A live process owns the lock. `pid` is None when the holder has not
    /// recorded itself yet.
    AlreadyRunning {
        identity: String,
        pid: Option<u32>,
    },
    /// The lock file kept changing underneath us.
    Unstable { path: PathBuf },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::AlreadyRunning {
                identity,
                pid: Some(pid),
            } => write!(f, "{identity} is already running (pid {pid})"),
            LockError::AlreadyRunning { identity, pid: None } => {
                write!(f, "{identity} is already running (pid not yet recorded)")
            }
            LockError::Unstable { path } => {
                write!(f, "lock file {} changed repeatedly while locking", path.display())
            }
            LockError::Io { path, source } => {
                write!(f, "lock file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
