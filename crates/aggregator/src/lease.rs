//! Single-flight leases: at most one pipeline run per pool at a time.
//!
//! Leases are owned by the store, so every pipeline sharing a store (in
//! this process through a shared handle, or in another process through the
//! same data directory) contends for the same lease.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sharecraft_core::PoolIndex;

use crate::history::unix_now;
use crate::store::{StoreError, StoreResult};

/// In-process lease set
#[derive(Debug, Clone, Default)]
pub struct EpochLeases {
    in_flight: Arc<Mutex<HashSet<PoolIndex>>>,
}

impl EpochLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the pool's lease, or fail with `LeaseHeld` if it is held.
    pub fn try_acquire(&self, pool_index: PoolIndex) -> StoreResult<EpochLease> {
        if !self.in_flight.lock().insert(pool_index) {
            return Err(StoreError::LeaseHeld { pool_index });
        }
        debug!("Acquired epoch lease for pool {}", pool_index);
        Ok(EpochLease {
            pool_index,
            release: Release::InProcess(Arc::clone(&self.in_flight)),
        })
    }

    pub fn is_held(&self, pool_index: PoolIndex) -> bool {
        self.in_flight.lock().contains(&pool_index)
    }
}

/// Contents of a lease file
#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    pid: u32,
    acquired_at: u64,
}

/// Exclusive lock file created with `create_new`, removed on drop.
///
/// A file older than `stale_after` (or unreadable) is treated as left behind
/// by a crashed holder and taken over.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// `Ok(None)` while another live holder has the file
    pub fn try_acquire(path: &Path, stale_after: Duration) -> std::io::Result<Option<LockFile>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // One takeover attempt at most
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let record = LeaseRecord {
                        pid: std::process::id(),
                        acquired_at: unix_now(),
                    };
                    let json = serde_json::to_string(&record).map_err(std::io::Error::other)?;
                    file.write_all(json.as_bytes())?;
                    file.sync_all()?;
                    return Ok(Some(LockFile {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !Self::is_stale(path, stale_after) {
                        return Ok(None);
                    }
                    warn!("Taking over stale lease {}", path.display());
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        let record = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<LeaseRecord>(&text).ok());
        match record {
            Some(record) => unix_now().saturating_sub(record.acquired_at) > stale_after.as_secs(),
            // Still being written by its creator, or garbage; judge by mtime
            None => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > stale_after),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lease {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug)]
enum Release {
    InProcess(Arc<Mutex<HashSet<PoolIndex>>>),
    File(LockFile),
}

/// Released on drop, including when the run future is dropped mid-flight
#[derive(Debug)]
pub struct EpochLease {
    pool_index: PoolIndex,
    release: Release,
}

impl EpochLease {
    /// Lease backed by a lock file; `LeaseHeld` while someone else has it
    pub fn lock_file(pool_index: PoolIndex, path: &Path, stale_after: Duration) -> StoreResult<Self> {
        match LockFile::try_acquire(path, stale_after)? {
            Some(lock) => {
                debug!("Acquired epoch lease for pool {} at {}", pool_index, path.display());
                Ok(EpochLease {
                    pool_index,
                    release: Release::File(lock),
                })
            }
            None => Err(StoreError::LeaseHeld { pool_index }),
        }
    }

    pub fn pool_index(&self) -> PoolIndex {
        self.pool_index
    }
}

impl Drop for EpochLease {
    fn drop(&mut self) {
        if let Release::InProcess(in_flight) = &self.release {
            in_flight.lock().remove(&self.pool_index);
        }
        debug!("Released epoch lease for pool {}", self.pool_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lease_rejected_until_release() {
        let leases = EpochLeases::new();
        let lease = leases.try_acquire(4).unwrap();
        assert_eq!(lease.pool_index(), 4);
        assert!(matches!(
            leases.try_acquire(4),
            Err(StoreError::LeaseHeld { pool_index: 4 })
        ));

        // Other pools are independent
        let other = leases.try_acquire(5).unwrap();

        drop(lease);
        assert!(!leases.is_held(4));
        assert!(leases.try_acquire(4).is_ok());
        assert!(leases.is_held(5));
        drop(other);
    }

    #[test]
    fn test_lock_file_excludes_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leases").join("pool-0.lock");
        let hour = Duration::from_secs(3600);

        let first = EpochLease::lock_file(0, &path, hour).unwrap();
        assert!(path.exists());
        assert!(matches!(
            EpochLease::lock_file(0, &path, hour),
            Err(StoreError::LeaseHeld { pool_index: 0 })
        ));

        drop(first);
        assert!(!path.exists());
        assert!(EpochLease::lock_file(0, &path, hour).is_ok());
    }

    #[test]
    fn test_stale_lock_file_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool-3.lock");
        let abandoned = LeaseRecord {
            pid: 1,
            acquired_at: unix_now() - 7_200,
        };
        std::fs::write(&path, serde_json::to_string(&abandoned).unwrap()).unwrap();

        assert!(matches!(
            EpochLease::lock_file(3, &path, Duration::from_secs(10_000)),
            Err(StoreError::LeaseHeld { pool_index: 3 })
        ));
        let lease = EpochLease::lock_file(3, &path, Duration::from_secs(3_600)).unwrap();
        assert_eq!(lease.pool_index(), 3);
    }
}
