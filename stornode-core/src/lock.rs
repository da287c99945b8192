//! Resource ownership locks.
//!
//! Every physical resource (a volume, or its export) has a small JSON record on
//! disk naming the operation that currently owns it:
//!
//! ```json
//! {"pid": 4242, "uri": "DELETE /volumes/v1", "interruptible": false}
//! ```
//!
//! The record is read and rewritten under an advisory `flock` that is held only
//! for the read-decide-write step of [`LockManager::claim`], [`LockGuard`]
//! release and [`LockManager::probe`], never for the guarded operation itself.
//! The in-process registry mutex is only ever taken while that `flock` is held.
//!
//! Inside this process, owners are tracked in a registry keyed by resource path.
//! An owner is alive while its [`LockGuard`] is; records left by other processes
//! are alive while their pid answers a null signal. A dead owner's record is
//! orphaned and is silently taken over by the next claimant.

use crate::error::{Result, StorageError};
use crate::observability::metrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owner record persisted in a resource lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// `<METHOD> <path>` of the request that owns the resource.
    pub uri: String,
    #[serde(default)]
    pub interruptible: bool,
}

/// What a claimant wants recorded as the new owner.
///
/// `interruptible` left as `None` keeps whatever flag the previous record
/// carried, so callers that must not be interruptible should say so explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimInfo {
    pub uri: String,
    pub interruptible: Option<bool>,
}

impl ClaimInfo {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), interruptible: None }
    }

    pub fn interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = Some(interruptible);
        self
    }
}

/// Outcome of a successful claim attempt.
#[derive(Debug)]
pub enum Claim {
    /// The caller now owns the resource.
    Acquired(LockGuard),
    /// The identical request already owns the resource; nothing was changed.
    Duplicate(LockRecord),
}

impl Claim {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

struct Owner {
    id: u64,
    uri: String,
    cancel: CancellationToken,
    alive: Weak<()>,
}

impl Owner {
    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

struct Inner {
    pid: u32,
    next_id: AtomicU64,
    owners: Mutex<HashMap<PathBuf, Owner>>,
}

impl Inner {
    fn owners(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, Owner>>> {
        self.owners.lock().map_err(|_| StorageError::Internal("lock registry poisoned".into()))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the owner named by `record` is still running.
    fn owner_alive(
        &self,
        owners: &HashMap<PathBuf, Owner>,
        path: &Path,
        record: &LockRecord,
    ) -> bool {
        if record.pid == self.pid {
            return owners
                .get(path)
                .map(|owner| owner.is_alive() && owner.uri == record.uri)
                .unwrap_or(false);
        }
        is_process_alive(record.pid)
    }
}

/// Claims and probes resource locks rooted under a run directory.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").field("pid", &self.inner.pid).finish()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pid: std::process::id(),
                next_id: AtomicU64::new(1),
                owners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Try to become the owner of `path`.
    ///
    /// - no live owner: `info` is recorded, the claim is acquired
    /// - live owner with the same `uri`: [`Claim::Duplicate`], record untouched
    /// - live interruptible owner: it is cancelled (or sent `SIGTERM` when it
    ///   lives in another process) and the record is taken over
    /// - any other live owner: [`StorageError::ResourceBusy`]
    ///
    /// Records are merged: an `interruptible` flag not given in `info` is
    /// inherited from the record being replaced.
    pub fn claim(&self, path: impl AsRef<Path>, info: ClaimInfo) -> Result<Claim> {
        let path = path.as_ref();
        let file = LockFile::open(path)?;
        let _flock = file.lock()?;
        let mut owners = self.inner.owners()?;

        let previous = file.read()?;
        if let Some(record) = &previous {
            if self.inner.owner_alive(&owners, path, record) {
                if record.uri == info.uri {
                    debug!(
                        resource = %path.display(),
                        uri = %info.uri,
                        "Duplicate request in flight"
                    );
                    metrics::record_lock_claim("duplicate");
                    return Ok(Claim::Duplicate(record.clone()));
                }

                if !record.interruptible {
                    metrics::record_lock_claim("busy");
                    return Err(StorageError::ResourceBusy {
                        resource: path.display().to_string(),
                        owner_uri: record.uri.clone(),
                    });
                }

                info!(
                    resource = %path.display(),
                    owner_pid = record.pid,
                    owner_uri = %record.uri,
                    uri = %info.uri,
                    "Interrupting current owner"
                );
                self.interrupt(&owners, path, record);
                metrics::record_lock_claim("stolen");
            } else {
                debug!(
                    resource = %path.display(),
                    owner_pid = record.pid,
                    owner_uri = %record.uri,
                    "Taking over orphaned lock"
                );
            }
        }

        let record = LockRecord {
            pid: self.inner.pid,
            uri: info.uri.clone(),
            interruptible: info
                .interruptible
                .or(previous.as_ref().map(|p| p.interruptible))
                .unwrap_or(false),
        };
        file.write(&record)?;

        let alive = Arc::new(());
        let cancel = CancellationToken::new();
        let id = self.inner.next_id();
        owners.insert(
            path.to_path_buf(),
            Owner {
                id,
                uri: record.uri.clone(),
                cancel: cancel.clone(),
                alive: Arc::downgrade(&alive),
            },
        );
        metrics::record_lock_claim("acquired");

        Ok(Claim::Acquired(LockGuard {
            manager: self.inner.clone(),
            path: path.to_path_buf(),
            id,
            uri: record.uri,
            cancel,
            _alive: alive,
            released: false,
        }))
    }

    /// Current live owner of `path`, or `None` when unused or orphaned.
    pub fn probe(&self, path: impl AsRef<Path>) -> Result<Option<LockRecord>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let file = LockFile::open(path)?;
        let _flock = file.lock()?;
        let owners = self.inner.owners()?;
        Ok(file.read()?.filter(|record| self.inner.owner_alive(&owners, path, record)))
    }

    /// Clear the record of `path` if its owner is dead. Returns whether a
    /// record was cleared.
    pub fn clear_orphaned(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }
        let file = LockFile::open(path)?;
        let _flock = file.lock()?;
        let owners = self.inner.owners()?;
        match file.read()? {
            Some(record) if !self.inner.owner_alive(&owners, path, &record) => {
                file.clear()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn interrupt(&self, owners: &HashMap<PathBuf, Owner>, path: &Path, record: &LockRecord) {
        if record.pid == self.inner.pid {
            if let Some(owner) = owners.get(path) {
                owner.cancel.cancel();
            }
            return;
        }
        let pid = match libc::pid_t::try_from(record.pid) {
            Ok(pid) if pid > 0 => pid,
            _ => {
                warn!(pid = record.pid, "Refusing to signal invalid lock owner pid");
                return;
            }
        };
        let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
        if ret != 0 {
            warn!(
                pid = record.pid,
                error = %std::io::Error::last_os_error(),
                "Failed to signal lock owner"
            );
        }
    }
}

/// Ownership of a claimed resource. Dropping the guard releases the claim.
pub struct LockGuard {
    manager: Arc<Inner>,
    path: PathBuf,
    id: u64,
    uri: String,
    cancel: CancellationToken,
    _alive: Arc<()>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("uri", &self.uri)
            .finish()
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Token cancelled when another claimant interrupts this owner.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Re-register the claim under a fresh owner identity, e.g. when a
    /// background worker takes over from the request that claimed it.
    ///
    /// Fails with `ResourceBusy` if this guard no longer owns the resource.
    pub fn transfer(mut self) -> Result<LockGuard> {
        let alive = Arc::new(());
        let id = self.manager.next_id();
        {
            let mut owners = self.manager.owners()?;
            match owners.get_mut(&self.path) {
                Some(owner) if owner.id == self.id => {
                    owner.id = id;
                    owner.alive = Arc::downgrade(&alive);
                }
                other => {
                    return Err(StorageError::ResourceBusy {
                        resource: self.path.display().to_string(),
                        owner_uri: other.map(|o| o.uri.clone()).unwrap_or_default(),
                    });
                }
            }
        }
        self.released = true;
        Ok(LockGuard {
            manager: self.manager.clone(),
            path: self.path.clone(),
            id,
            uri: self.uri.clone(),
            cancel: self.cancel.clone(),
            _alive: alive,
            released: false,
        })
    }

    /// Release the claim explicitly, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> Result<()> {
        let file = LockFile::open(&self.path)?;
        let _flock = file.lock()?;
        {
            let mut owners = self.manager.owners()?;
            match owners.get(&self.path) {
                Some(owner) if owner.id == self.id => {
                    owners.remove(&self.path);
                }
                // Superseded by another claimant; the record is no longer ours.
                _ => return Ok(()),
            }
        }

        if let Some(record) = file.read()? {
            if record.pid == self.manager.pid && record.uri == self.uri {
                file.clear()?;
            }
        }
        debug!(resource = %self.path.display(), uri = %self.uri, "Released resource lock");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.release_inner() {
            warn!(resource = %self.path.display(), error = %e, "Failed to release resource lock");
        }
    }
}

/// A lock file opened for reading and rewriting its record.
struct LockFile {
    path: PathBuf,
    file: File,
}

/// Held `flock`; unlocked when dropped.
struct Flock<'a> {
    file: &'a File,
}

impl Drop for Flock<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl LockFile {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    fn lock(&self) -> Result<Flock<'_>> {
        loop {
            let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX) };
            if ret == 0 {
                return Ok(Flock { file: &self.file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(StorageError::io(&self.path, err));
            }
        }
    }

    fn read(&self) -> Result<Option<LockRecord>> {
        let mut content = String::new();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io(&self.path, e))?;
        file.read_to_string(&mut content).map_err(|e| StorageError::io(&self.path, e))?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(resource = %self.path.display(), error = %e, "Ignoring corrupt lock record");
                Ok(None)
            }
        }
    }

    fn write(&self, record: &LockRecord) -> Result<()> {
        let json = serde_json::to_vec(record).map_err(StorageError::internal)?;
        let mut file = &self.file;
        file.set_len(0).map_err(|e| StorageError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io(&self.path, e))?;
        file.write_all(&json).map_err(|e| StorageError::io(&self.path, e))?;
        file.sync_data().map_err(|e| StorageError::io(&self.path, e))
    }

    /// Delete the record. The file itself stays so that concurrent claimants
    /// waiting on its `flock` keep contending on the same inode.
    fn clear(&self) -> Result<()> {
        self.file.set_len(0).map_err(|e| StorageError::io(&self.path, e))?;
        self.file.sync_data().map_err(|e| StorageError::io(&self.path, e))
    }
}

/// Check if a process with the given PID is still alive.
pub fn is_process_alive(pid: u32) -> bool {
    // Zero and negative pids address process groups, not a process.
    let pid = match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => pid,
        _ => return false,
    };
    // kill(pid, 0) only checks that the process exists; EPERM means it does
    // but belongs to someone else.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
