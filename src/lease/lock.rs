//! Slot lock files
//!
//! A slot is held by whoever created `<lock_dir>/slot-<n>.lock`. Creation is an
//! exclusive link of a fully written body, so exactly one process wins even
//! across independent engine instances. The body records the holder so stale locks can be detected.
//!
//! Removing somebody else's lock (stale takeover, reclaim) happens under an
//! exclusive `flock` on `slot-<n>.guard` and only if the body is still the one
//! that was judged stale, so two contenders can never both take over a slot.

use super::error::LeaseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata stored in a slot lock file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotLockData {
    pub slot: u32,
    pub process_id: u32,
    pub hostname: String,
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
}

impl SlotLockData {
    fn new(slot: u32, holder: Uuid) -> Self {
        Self {
            slot,
            process_id: std::process::id(),
            hostname: get_hostname(),
            holder,
            acquired_at: Utc::now(),
        }
    }

    /// Whether the recorded holder is known to be gone
    ///
    /// Locks taken on another host can't be checked and are never stale here.
    /// Pid 0 marks a lock file whose body was never written.
    pub fn is_stale(&self) -> bool {
        self.hostname == get_hostname()
            && (self.process_id == ABANDONED_PID || !is_process_running(self.process_id))
    }
}

/// Age after which a lock file with an empty body counts as abandoned
pub const UNWRITTEN_LOCK_GRACE: Duration = Duration::from_secs(10);

const ABANDONED_PID: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Another live holder owns the slot
    Contended(SlotLockData),
}

pub(crate) fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Check if a process with given PID is running
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // exists but owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    warn!("Process detection not supported on this platform");
    true
}

/// Exclusive `flock` serializing takeovers of one slot
///
/// The kernel drops it when the holder exits, so it can't go stale itself.
struct TakeoverGuard {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

/// Directory of slot lock files
#[derive(Debug, Clone)]
pub struct LockDir {
    dir: PathBuf,
}

impl LockDir {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LeaseError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| LeaseError::LockIo {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self, slot: u32) -> PathBuf {
        self.dir.join(format!("slot-{}.lock", slot))
    }

    fn guard_path(&self, slot: u32) -> PathBuf {
        self.dir.join(format!("slot-{}.guard", slot))
    }

    /// Try to take the lock for `slot` on behalf of `holder`
    ///
    /// A stale lock is removed and creation retried once; a live holder is
    /// reported as contention rather than an error.
    pub fn try_lock(&self, slot: u32, holder: Uuid) -> Result<LockAttempt, LeaseError> {
        match self.create(slot, holder)? {
            None => Ok(LockAttempt::Acquired),
            Some(existing) if existing.is_stale() => {
                if self.remove_if_unchanged(slot, &existing)? {
                    warn!(
                        "Removed stale lock for slot {} (PID {} no longer running)",
                        slot, existing.process_id
                    );
                }
                match self.create(slot, holder)? {
                    None => Ok(LockAttempt::Acquired),
                    Some(winner) => Ok(LockAttempt::Contended(winner)),
                }
            }
            Some(existing) => {
                debug!(
                    "Slot {} held by PID {} on {}",
                    slot, existing.process_id, existing.hostname
                );
                Ok(LockAttempt::Contended(existing))
            }
        }
    }

    /// Create the lock file; returns the current holder if it already exists
    ///
    /// The body is written to a private temp file first and hard-linked into
    /// place, so a lock file is never observed half-written.
    fn create(&self, slot: u32, holder: Uuid) -> Result<Option<SlotLockData>, LeaseError> {
        let path = self.lock_path(slot);
        let data = SlotLockData::new(slot, holder);
        let json = serde_json::to_string_pretty(&data).map_err(|e| LeaseError::CorruptLock {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let staged = self
            .dir
            .join(format!("slot-{}.{}.tmp", slot, Uuid::new_v4().simple()));
        let written = std::fs::File::create(&staged)
            .and_then(|mut file| file.write_all(json.as_bytes()).and_then(|_| file.sync_all()));
        if let Err(source) = written {
            let _ = std::fs::remove_file(&staged);
            return Err(LeaseError::LockIo { path: staged, source });
        }

        let linked = std::fs::hard_link(&staged, &path);
        let _ = std::fs::remove_file(&staged);
        match linked {
            Ok(()) => {
                debug!("Acquired lock for slot {}", slot);
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match self.read(slot)? {
                Some(existing) => Ok(Some(existing)),
                // released between our create and read; treat as contention this round
                None => Ok(Some(SlotLockData::new(slot, Uuid::nil()))),
            },
            Err(source) => Err(LeaseError::LockIo { path, source }),
        }
    }

    /// Read the holder of `slot`, if locked
    ///
    /// An empty body is reported as held by an unknown live process while its
    /// creator may still be writing it, and as abandoned once the file is
    /// older than [`UNWRITTEN_LOCK_GRACE`].
    pub fn read(&self, slot: u32) -> Result<Option<SlotLockData>, LeaseError> {
        let path = self.lock_path(slot);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LeaseError::LockIo { path, source }),
        };

        match serde_json::from_str(&contents) {
            Ok(data) => Ok(Some(data)),
            Err(_) if contents.trim().is_empty() => unwritten_holder(slot, path),
            Err(e) => Err(LeaseError::CorruptLock {
                path,
                message: e.to_string(),
            }),
        }
    }

    fn guard(&self, slot: u32) -> Result<TakeoverGuard, LeaseError> {
        let path = self.guard_path(slot);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LeaseError::LockIo {
                path: path.clone(),
                source,
            })?;

        #[cfg(unix)]
        {
            use nix::fcntl::{Flock, FlockArg};
            let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                LeaseError::LockIo {
                    path,
                    source: errno.into(),
                }
            })?;
            Ok(TakeoverGuard { _lock: lock })
        }
        #[cfg(not(unix))]
        {
            Ok(TakeoverGuard { _file: file })
        }
    }

    /// Remove the lock for `slot` only if its body still equals `expected`
    fn remove_if_unchanged(&self, slot: u32, expected: &SlotLockData) -> Result<bool, LeaseError> {
        let _guard = self.guard(slot)?;
        match self.read(slot)? {
            Some(current) if current == *expected => self.remove(slot),
            _ => Ok(false),
        }
    }

    /// Remove the lock for `slot` if `holder` owns it
    pub fn remove_if_owned(&self, slot: u32, holder: Uuid) -> Result<bool, LeaseError> {
        let _guard = self.guard(slot)?;
        match self.read(slot)? {
            Some(data) if data.holder == holder => self.remove(slot),
            Some(data) => {
                warn!(
                    "Not releasing slot {}: held by {} (PID {})",
                    slot, data.holder, data.process_id
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Remove the lock for `slot` regardless of holder
    pub fn remove(&self, slot: u32) -> Result<bool, LeaseError> {
        let path = self.lock_path(slot);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LeaseError::LockIo { path, source }),
        }
    }

    /// Slot numbers that currently have a lock file
    pub fn locked_slots(&self) -> Result<Vec<u32>, LeaseError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| LeaseError::LockIo {
            path: self.dir.clone(),
            source,
        })?;

        let mut slots: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("slot-"))
                    .and_then(|name| name.strip_suffix(".lock"))
                    .and_then(|n| n.parse().ok())
            })
            .collect();
        slots.sort_unstable();
        Ok(slots)
    }

    /// Remove every lock whose holder process is gone
    pub fn reclaim_stale(&self) -> Result<Vec<u32>, LeaseError> {
        let mut reclaimed = Vec::new();
        for slot in self.locked_slots()? {
            let data = match self.read(slot) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable lock for slot {}: {}", slot, e);
                    continue;
                }
            };
            if data.is_stale() && self.remove_if_unchanged(slot, &data)? {
                info!(
                    "Reclaimed stale lock for slot {} (PID {})",
                    slot, data.process_id
                );
                reclaimed.push(slot);
            }
        }
        Ok(reclaimed)
    }
}

fn unwritten_holder(slot: u32, path: PathBuf) -> Result<Option<SlotLockData>, LeaseError> {
    let modified = match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(LeaseError::LockIo { path, source }),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    let process_id = if age >= UNWRITTEN_LOCK_GRACE {
        ABANDONED_PID
    } else {
        std::process::id()
    };
    Ok(Some(SlotLockData {
        slot,
        process_id,
        hostname: get_hostname(),
        holder: Uuid::nil(),
        acquired_at: DateTime::<Utc>::from(modified),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_lock(dir: &LockDir, data: &SlotLockData) {
        std::fs::write(
            dir.lock_path(data.slot),
            serde_json::to_string(data).unwrap(),
        )
        .unwrap();
    }

    fn dead_holder(slot: u32) -> SlotLockData {
        SlotLockData {
            slot,
            process_id: 999_999_999,
            hostname: get_hostname(),
            holder: Uuid::new_v4(),
            acquired_at: Utc::now(),
        }
    }

    #[test]
    fn test_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(dir.try_lock(1, a).unwrap(), LockAttempt::Acquired);
        match dir.try_lock(1, b).unwrap() {
            LockAttempt::Contended(data) => assert_eq!(data.holder, a),
            other => panic!("expected contention, got {:?}", other),
        }
        assert_eq!(dir.try_lock(2, b).unwrap(), LockAttempt::Acquired);
    }

    #[test]
    fn test_lock_file_contents() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        let holder = Uuid::new_v4();
        dir.try_lock(4, holder).unwrap();

        let data = dir.read(4).unwrap().unwrap();
        assert_eq!(data.slot, 4);
        assert_eq!(data.process_id, std::process::id());
        assert_eq!(data.holder, holder);
        assert!(temp.path().join("slot-4.lock").exists());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        write_lock(&dir, &dead_holder(3));

        let holder = Uuid::new_v4();
        assert_eq!(dir.try_lock(3, holder).unwrap(), LockAttempt::Acquired);
        assert_eq!(dir.read(3).unwrap().unwrap().holder, holder);
    }

    #[test]
    fn test_remove_if_owned() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        let (owner, other) = (Uuid::new_v4(), Uuid::new_v4());
        dir.try_lock(1, owner).unwrap();

        assert!(!dir.remove_if_owned(1, other).unwrap());
        assert!(dir.read(1).unwrap().is_some());
        assert!(dir.remove_if_owned(1, owner).unwrap());
        // second release is a no-op
        assert!(!dir.remove_if_owned(1, owner).unwrap());
    }

    #[test]
    fn test_reclaim_stale_only_removes_dead_holders() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        write_lock(&dir, &dead_holder(2));
        write_lock(&dir, &dead_holder(5));
        dir.try_lock(3, Uuid::new_v4()).unwrap();

        assert_eq!(dir.reclaim_stale().unwrap(), vec![2, 5]);
        assert_eq!(dir.locked_slots().unwrap(), vec![3]);
    }

    #[test]
    fn test_concurrent_stale_takeover_has_one_winner() {
        use std::sync::{Arc, Barrier};

        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        for _ in 0..100 {
            let _ = dir.remove(1);
            write_lock(&dir, &dead_holder(1));

            let barrier = Arc::new(Barrier::new(8));
            let contenders: Vec<_> = (0..8)
                .map(|_| {
                    let dir = dir.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        dir.try_lock(1, Uuid::new_v4()).unwrap()
                    })
                })
                .collect();
            let acquired = contenders
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|attempt| *attempt == LockAttempt::Acquired)
                .count();
            assert_eq!(acquired, 1);
        }
    }

    #[test]
    fn test_reclaim_leaves_a_replaced_lock_alone() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        let stale = dead_holder(2);
        write_lock(&dir, &stale);
        let fresh = Uuid::new_v4();
        dir.remove(2).unwrap();
        dir.try_lock(2, fresh).unwrap();

        assert!(!dir.remove_if_unchanged(2, &stale).unwrap());
        assert_eq!(dir.read(2).unwrap().unwrap().holder, fresh);
    }

    fn write_empty_lock(dir: &LockDir, slot: u32, age: Duration) {
        let file = std::fs::File::create(dir.lock_path(slot)).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_fresh_empty_lock_is_held() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        write_empty_lock(&dir, 1, Duration::ZERO);

        assert!(matches!(
            dir.try_lock(1, Uuid::new_v4()).unwrap(),
            LockAttempt::Contended(_)
        ));
        assert!(dir.reclaim_stale().unwrap().is_empty());
    }

    #[test]
    fn test_abandoned_empty_lock_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        write_empty_lock(&dir, 1, UNWRITTEN_LOCK_GRACE * 2);
        write_empty_lock(&dir, 2, UNWRITTEN_LOCK_GRACE * 2);

        assert!(dir.read(1).unwrap().unwrap().is_stale());
        let holder = Uuid::new_v4();
        assert_eq!(dir.try_lock(1, holder).unwrap(), LockAttempt::Acquired);
        assert_eq!(dir.read(1).unwrap().unwrap().holder, holder);
        assert_eq!(dir.reclaim_stale().unwrap(), vec![2]);
    }

    #[test]
    fn test_corrupt_lock_is_reported() {
        let temp = TempDir::new().unwrap();
        let dir = LockDir::new(temp.path()).unwrap();
        std::fs::write(dir.lock_path(1), "{not json").unwrap();

        assert!(matches!(
            dir.try_lock(1, Uuid::new_v4()),
            Err(LeaseError::CorruptLock { .. })
        ));
    }

    #[test]
    fn test_foreign_host_lock_is_never_stale() {
        let mut data = dead_holder(1);
        data.hostname = "some-other-host.invalid".to_string();
        assert!(!data.is_stale());
    }

    #[test]
    fn test_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(999_999_999));
    }
}
