use crate::constants::trust_store as store_constants;
use crate::errors::LaunchError;
use crate::managers::host_keys::HostIdentity;
use crate::utils::fs_atomic::atomic_write_text_file;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TRUSTED_EXTENSION: &str = "key";
const PENDING_EXTENSION: &str = "pending";
const LOCK_EXTENSION: &str = "lock";

/// In-process locks keyed by canonical lock file path, shared by every
/// `TrustStore` pointing at the same directory.
static PROCESS_LOCKS: Lazy<DashMap<PathBuf, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

/// Exclusive `<stem>.lock` file; removed on drop.
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let stale_after = Duration::from_millis(store_constants::STALE_LOCK_MS);
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

fn acquire_lock_file(path: &Path) -> Result<LockFile, LaunchError> {
    let deadline = Instant::now() + Duration::from_millis(store_constants::LOCK_WAIT_MS);
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                return Ok(LockFile {
                    path: path.to_path_buf(),
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(path) {
                    let _ = std::fs::remove_file(path);
                    continue;
                }
                if Instant::now() >= deadline {
                    return Err(LaunchError::internal(format!(
                        "Trust store entry is locked by another process: {}",
                        path.display()
                    ))
                    .with_hint("Remove the lock file if no other agentboot process is running."));
                }
                std::thread::sleep(Duration::from_millis(store_constants::LOCK_POLL_MS));
            }
            Err(err) => {
                return Err(LaunchError::internal(format!(
                    "Failed to create trust store lock {}: {}",
                    path.display(),
                    err
                )))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// First contact: the key is now pinned.
    Pinned,
    Matched,
    Mismatch { stored: HostIdentity },
    /// First contact in manual-only mode: queued for operator approval.
    Queued,
}

impl TrustDecision {
    pub fn is_trusted(&self) -> bool {
        matches!(self, TrustDecision::Pinned | TrustDecision::Matched)
    }
}

/// Per-target host key pins, one `algorithm base64` file per target id.
///
/// Every operation runs under a per-target lock scoped to the directory:
/// an in-process mutex shared by all stores on that directory, plus a lock
/// file that excludes other processes. Files are replaced atomically.
#[derive(Clone)]
pub struct TrustStore {
    dir: PathBuf,
}

impl TrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, target_id: &str) -> Result<PathBuf, LaunchError> {
        std::fs::create_dir_all(&self.dir).map_err(|err| {
            LaunchError::internal(format!(
                "Failed to create trust store directory {}: {}",
                self.dir.display(),
                err
            ))
        })?;
        let dir = self
            .dir
            .canonicalize()
            .unwrap_or_else(|_| self.dir.clone());
        Ok(dir.join(format!("{}.{}", file_stem(target_id), LOCK_EXTENSION)))
    }

    fn with_lock<T>(
        &self,
        target_id: &str,
        body: impl FnOnce() -> Result<T, LaunchError>,
    ) -> Result<T, LaunchError> {
        let lock_path = self.lock_path(target_id)?;
        let lock = PROCESS_LOCKS
            .entry(lock_path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        let _file = acquire_lock_file(&lock_path)?;
        body()
    }

    fn path_for(&self, target_id: &str, extension: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(target_id), extension))
    }

    fn read(&self, path: &Path) -> Result<Option<HostIdentity>, LaunchError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(|err| {
            LaunchError::internal(format!("Failed to read trust store entry: {}", err))
        })?;
        let line = raw
            .lines()
            .map(|line| line.trim())
            .find(|line| !line.is_empty() && !line.starts_with('#'));
        match line {
            Some(line) => HostIdentity::parse(line).map(Some).map_err(|err| {
                LaunchError::internal(format!(
                    "Corrupt trust store entry {}: {}",
                    path.display(),
                    err.message
                ))
            }),
            None => Ok(None),
        }
    }

    fn write(&self, path: &Path, identity: &HostIdentity) -> Result<(), LaunchError> {
        atomic_write_text_file(path, &format!("{}\n", identity.to_line()), 0o600).map_err(
            |err| LaunchError::internal(format!("Failed to write trust store entry: {}", err)),
        )
    }

    fn remove(&self, path: &Path) -> Result<(), LaunchError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LaunchError::internal(format!(
                "Failed to remove trust store entry: {}",
                err
            ))),
        }
    }

    pub fn load(&self, target_id: &str) -> Result<Option<HostIdentity>, LaunchError> {
        self.with_lock(target_id, || {
            self.read(&self.path_for(target_id, TRUSTED_EXTENSION))
        })
    }

    pub fn store(&self, target_id: &str, identity: &HostIdentity) -> Result<(), LaunchError> {
        self.with_lock(target_id, || {
            self.write(&self.path_for(target_id, TRUSTED_EXTENSION), identity)
        })
    }

    pub fn queue_pending(&self, target_id: &str, identity: &HostIdentity) -> Result<(), LaunchError> {
        self.with_lock(target_id, || {
            self.write(&self.path_for(target_id, PENDING_EXTENSION), identity)
        })
    }

    pub fn pending(&self, target_id: &str) -> Result<Option<HostIdentity>, LaunchError> {
        self.with_lock(target_id, || {
            self.read(&self.path_for(target_id, PENDING_EXTENSION))
        })
    }

    /// Compares `presented` with the pinned key, pinning it (or queueing it
    /// when `manual_only`) when the target has never been seen. A mismatch
    /// never touches the stored key.
    pub fn check_or_pin(
        &self,
        target_id: &str,
        presented: &HostIdentity,
        manual_only: bool,
    ) -> Result<TrustDecision, LaunchError> {
        self.with_lock(target_id, || {
            let trusted_path = self.path_for(target_id, TRUSTED_EXTENSION);
            if let Some(stored) = self.read(&trusted_path)? {
                if stored == *presented {
                    return Ok(TrustDecision::Matched);
                }
                return Ok(TrustDecision::Mismatch { stored });
            }
            if manual_only {
                self.write(&self.path_for(target_id, PENDING_EXTENSION), presented)?;
                return Ok(TrustDecision::Queued);
            }
            self.write(&trusted_path, presented)?;
            Ok(TrustDecision::Pinned)
        })
    }

    /// Promotes the queued key to trusted. Returns the approved key, or None
    /// when nothing was pending.
    pub fn approve(&self, target_id: &str) -> Result<Option<HostIdentity>, LaunchError> {
        self.with_lock(target_id, || {
            let pending_path = self.path_for(target_id, PENDING_EXTENSION);
            let Some(pending) = self.read(&pending_path)? else {
                return Ok(None);
            };
            self.write(&self.path_for(target_id, TRUSTED_EXTENSION), &pending)?;
            self.remove(&pending_path)?;
            Ok(Some(pending))
        })
    }

    pub fn forget(&self, target_id: &str) -> Result<(), LaunchError> {
        self.with_lock(target_id, || {
            self.remove(&self.path_for(target_id, TRUSTED_EXTENSION))?;
            self.remove(&self.path_for(target_id, PENDING_EXTENSION))
        })
    }
}

/// Maps an arbitrary target id to a file name that is safe on every
/// platform and still unique.
fn file_stem(target_id: &str) -> String {
    let readable: String = target_id
        .chars()
        .take(48)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = hex::encode(Sha256::digest(target_id.as_bytes()));
    format!("{}-{}", readable, &digest[..12])
}
