//! Proof, manifest, run-journal and lease storage.
//!
//! Proof bundles are staged per epoch and only become visible once the
//! epoch's root is confirmed on the ledger; promotion replaces the pool's
//! whole bundle set. Manifests are write-once per `(pool_index, epoch_id)`.
//! The run journal holds the in-progress state of at most one run per pool,
//! guarded by the pool's lease.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use sharecraft_census::HolderBalance;
use sharecraft_core::{Amount, Digest, EpochId, HolderAddress, LedgerHeight, PoolIndex};
use sharecraft_rewards::BalanceUpdate;

use crate::lease::{EpochLease, EpochLeases};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Manifest for pool {pool_index} epoch {epoch_id} already published")]
    ManifestExists { pool_index: PoolIndex, epoch_id: EpochId },

    #[error("Lease for pool {pool_index} is held by another run")]
    LeaseHeld { pool_index: PoolIndex },

    #[error("No bundles staged for pool {pool_index} epoch {epoch_id}")]
    NothingStaged { pool_index: PoolIndex, epoch_id: EpochId },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Everything a holder needs to call `stake` for one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBundle {
    pub pool_index: PoolIndex,
    pub holder_address: HolderAddress,
    pub balance: Amount,
    pub epoch_id: EpochId,
    pub proof: Vec<Digest>,
}

/// Published record of one committed epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochManifest {
    pub pool_index: PoolIndex,
    pub epoch_id: EpochId,
    pub root: Digest,
    pub snapshot_height: LedgerHeight,
    /// Leaf order of the tree
    pub holders: Vec<HolderBalance>,
    pub created_at: u64,
}

/// Progress of a run that has reached root submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJournal {
    pub pool_index: PoolIndex,
    pub epoch_id: EpochId,
    pub root: Digest,
    pub snapshot_height: LedgerHeight,
    pub holders: Vec<HolderBalance>,
    pub updates: Vec<BalanceUpdate>,
    /// `applied_batches` indexes chunks of `updates` of this size
    pub batch_size: usize,
    pub applied_batches: BTreeSet<usize>,
    pub created_at: u64,
}

impl RunJournal {
    pub fn batch_count(&self) -> usize {
        if self.batch_size == 0 {
            return 0;
        }
        self.updates.len().div_ceil(self.batch_size)
    }

    pub fn is_reconciled(&self) -> bool {
        self.applied_batches.len() >= self.batch_count()
    }
}

pub trait ProofStore: Send + Sync {
    /// Stage an epoch's bundles, replacing anything staged before.
    /// Holders cannot see them until `promote_bundles`.
    fn stage_bundles(&self, pool_index: PoolIndex, epoch_id: EpochId, bundles: &[ProofBundle]) -> StoreResult<()>;

    /// Make the staged set for `epoch_id` the pool's live bundles. Holders
    /// missing from it lose their bundle. Returns the number promoted.
    fn promote_bundles(&self, pool_index: PoolIndex, epoch_id: EpochId) -> StoreResult<usize>;

    fn discard_staged(&self, pool_index: PoolIndex) -> StoreResult<()>;

    /// Live bundle only
    fn bundle(&self, pool_index: PoolIndex, holder: &HolderAddress) -> StoreResult<Option<ProofBundle>>;
}

pub trait ManifestStore: Send + Sync {
    /// Fails with `ManifestExists` if the epoch was already published
    fn publish_manifest(&self, manifest: &EpochManifest) -> StoreResult<()>;

    fn manifest(&self, pool_index: PoolIndex, epoch_id: EpochId) -> StoreResult<Option<EpochManifest>>;

    fn latest_manifest(&self, pool_index: PoolIndex) -> StoreResult<Option<EpochManifest>>;
}

pub trait JournalStore: Send + Sync {
    fn save_journal(&self, journal: &RunJournal) -> StoreResult<()>;

    fn journal(&self, pool_index: PoolIndex) -> StoreResult<Option<RunJournal>>;

    fn clear_journal(&self, pool_index: PoolIndex) -> StoreResult<()>;
}

pub trait LeaseStore: Send + Sync {
    /// Exclusive per-pool lease, held for a whole run
    fn try_lease(&self, pool_index: PoolIndex) -> StoreResult<EpochLease>;
}

/// All four stores behind one handle
pub trait PipelineStore: ProofStore + ManifestStore + JournalStore + LeaseStore {}

impl<T: ProofStore + ManifestStore + JournalStore + LeaseStore> PipelineStore for T {}

// =========================================================================
// File store
// =========================================================================

/// JSON files under one directory:
///
/// ```text
/// proofs/pool-{i}/{strkey}.json
/// staging/pool-{i}/epoch-{e}/{strkey}.json
/// manifests/pool-{i}/epoch-{e}.json
/// journal/pool-{i}.json
/// leases/pool-{i}.lock
/// ```
pub struct FileStore {
    root: PathBuf,
    lease_timeout: Duration,
}

/// Lease files older than this are taken over
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(3600);

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn proof_dir(&self, pool_index: PoolIndex) -> PathBuf {
        self.root.join("proofs").join(format!("pool-{}", pool_index))
    }

    fn proof_path(&self, pool_index: PoolIndex, holder: &HolderAddress) -> PathBuf {
        self.proof_dir(pool_index)
            .join(format!("{}.json", holder.to_strkey()))
    }

    fn staging_dir(&self, pool_index: PoolIndex) -> PathBuf {
        self.root.join("staging").join(format!("pool-{}", pool_index))
    }

    fn staged_epoch_dir(&self, pool_index: PoolIndex, epoch_id: EpochId) -> PathBuf {
        self.staging_dir(pool_index).join(format!("epoch-{}", epoch_id))
    }

    fn lease_path(&self, pool_index: PoolIndex) -> PathBuf {
        self.root.join("leases").join(format!("pool-{}.lock", pool_index))
    }

    fn manifest_dir(&self, pool_index: PoolIndex) -> PathBuf {
        self.root.join("manifests").join(format!("pool-{}", pool_index))
    }

    fn manifest_path(&self, pool_index: PoolIndex, epoch_id: EpochId) -> PathBuf {
        self.manifest_dir(pool_index).join(format!("epoch-{}.json", epoch_id))
    }

    fn journal_path(&self, pool_index: PoolIndex) -> PathBuf {
        self.root.join("journal").join(format!("pool-{}.json", pool_index))
    }
}

/// Write through a `.tmp` sibling and rename so readers never see a partial file
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> StoreResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl ProofStore for FileStore {
    fn stage_bundles(&self, pool_index: PoolIndex, epoch_id: EpochId, bundles: &[ProofBundle]) -> StoreResult<()> {
        self.discard_staged(pool_index)?;
        let dir = self.staged_epoch_dir(pool_index, epoch_id);
        std::fs::create_dir_all(&dir)?;
        for bundle in bundles {
            let path = dir.join(format!("{}.json", bundle.holder_address.to_strkey()));
            write_json_atomic(&path, bundle)?;
        }
        debug!("Staged {} proof bundles under {}", bundles.len(), dir.display());
        Ok(())
    }

    fn promote_bundles(&self, pool_index: PoolIndex, epoch_id: EpochId) -> StoreResult<usize> {
        let staged = self.staged_epoch_dir(pool_index, epoch_id);
        if !staged.is_dir() {
            return Err(StoreError::NothingStaged { pool_index, epoch_id });
        }
        let count = std::fs::read_dir(&staged)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
            .count();

        // Swap directories so the live set is never a mix of two epochs
        let live = self.proof_dir(pool_index);
        let retired = live.with_extension("old");
        remove_dir_if_exists(&retired)?;
        if live.exists() {
            std::fs::rename(&live, &retired)?;
        }
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&staged, &live)?;
        remove_dir_if_exists(&retired)?;
        self.discard_staged(pool_index)?;

        debug!("Promoted {} proof bundles for pool {} epoch {}", count, pool_index, epoch_id);
        Ok(count)
    }

    fn discard_staged(&self, pool_index: PoolIndex) -> StoreResult<()> {
        remove_dir_if_exists(&self.staging_dir(pool_index))
    }

    fn bundle(&self, pool_index: PoolIndex, holder: &HolderAddress) -> StoreResult<Option<ProofBundle>> {
        read_json(&self.proof_path(pool_index, holder))
    }
}

impl ManifestStore for FileStore {
    fn publish_manifest(&self, manifest: &EpochManifest) -> StoreResult<()> {
        let path = self.manifest_path(manifest.pool_index, manifest.epoch_id);
        if path.exists() {
            return Err(StoreError::ManifestExists {
                pool_index: manifest.pool_index,
                epoch_id: manifest.epoch_id,
            });
        }
        write_json_atomic(&path, manifest)
    }

    fn manifest(&self, pool_index: PoolIndex, epoch_id: EpochId) -> StoreResult<Option<EpochManifest>> {
        read_json(&self.manifest_path(pool_index, epoch_id))
    }

    fn latest_manifest(&self, pool_index: PoolIndex) -> StoreResult<Option<EpochManifest>> {
        let dir = self.manifest_dir(pool_index);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<EpochId> = None;
        for entry in entries {
            let name = entry?.file_name();
            let epoch = name
                .to_str()
                .and_then(|n| n.strip_prefix("epoch-"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<EpochId>().ok());
            if let Some(epoch) = epoch {
                latest = latest.max(Some(epoch));
            }
        }
        match latest {
            Some(epoch_id) => self.manifest(pool_index, epoch_id),
            None => Ok(None),
        }
    }
}

impl JournalStore for FileStore {
    fn save_journal(&self, journal: &RunJournal) -> StoreResult<()> {
        write_json_atomic(&self.journal_path(journal.pool_index), journal)
    }

    fn journal(&self, pool_index: PoolIndex) -> StoreResult<Option<RunJournal>> {
        read_json(&self.journal_path(pool_index))
    }

    fn clear_journal(&self, pool_index: PoolIndex) -> StoreResult<()> {
        match std::fs::remove_file(self.journal_path(pool_index)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl LeaseStore for FileStore {
    fn try_lease(&self, pool_index: PoolIndex) -> StoreResult<EpochLease> {
        EpochLease::lock_file(pool_index, &self.lease_path(pool_index), self.lease_timeout)
    }
}

// =========================================================================
// Memory store
// =========================================================================

#[derive(Default)]
pub struct MemoryStore {
    bundles: RwLock<HashMap<PoolIndex, HashMap<HolderAddress, ProofBundle>>>,
    staged: RwLock<HashMap<PoolIndex, (EpochId, Vec<ProofBundle>)>>,
    leases: EpochLeases,
    manifests: RwLock<HashMap<(PoolIndex, EpochId), EpochManifest>>,
    journals: RwLock<HashMap<PoolIndex, RunJournal>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProofStore for MemoryStore {
    fn stage_bundles(&self, pool_index: PoolIndex, epoch_id: EpochId, bundles: &[ProofBundle]) -> StoreResult<()> {
        self.staged.write().insert(pool_index, (epoch_id, bundles.to_vec()));
        Ok(())
    }

    fn promote_bundles(&self, pool_index: PoolIndex, epoch_id: EpochId) -> StoreResult<usize> {
        let mut staged = self.staged.write();
        match staged.remove(&pool_index) {
            Some((staged_epoch, bundles)) if staged_epoch == epoch_id => {
                let count = bundles.len();
                let live = bundles.into_iter().map(|b| (b.holder_address, b)).collect();
                self.bundles.write().insert(pool_index, live);
                Ok(count)
            }
            other => {
                if let Some(entry) = other {
                    staged.insert(pool_index, entry);
                }
                Err(StoreError::NothingStaged { pool_index, epoch_id })
            }
        }
    }

    fn discard_staged(&self, pool_index: PoolIndex) -> StoreResult<()> {
        self.staged.write().remove(&pool_index);
        Ok(())
    }

    fn bundle(&self, pool_index: PoolIndex, holder: &HolderAddress) -> StoreResult<Option<ProofBundle>> {
        Ok(self
            .bundles
            .read()
            .get(&pool_index)
            .and_then(|live| live.get(holder))
            .cloned())
    }
}

impl LeaseStore for MemoryStore {
    fn try_lease(&self, pool_index: PoolIndex) -> StoreResult<EpochLease> {
        self.leases.try_acquire(pool_index)
    }
}

impl ManifestStore for MemoryStore {
    fn publish_manifest(&self, manifest: &EpochManifest) -> StoreResult<()> {
        let mut map = self.manifests.write();
        let key = (manifest.pool_index, manifest.epoch_id);
        if map.contains_key(&key) {
            return Err(StoreError::ManifestExists {
                pool_index: manifest.pool_index,
                epoch_id: manifest.epoch_id,
            });
        }
        map.insert(key, manifest.clone());
        Ok(())
    }

    fn manifest(&self, pool_index: PoolIndex, epoch_id: EpochId) -> StoreResult<Option<EpochManifest>> {
        Ok(self.manifests.read().get(&(pool_index, epoch_id)).cloned())
    }

    fn latest_manifest(&self, pool_index: PoolIndex) -> StoreResult<Option<EpochManifest>> {
        Ok(self
            .manifests
            .read()
            .values()
            .filter(|m| m.pool_index == pool_index)
            .max_by_key(|m| m.epoch_id)
            .cloned())
    }
}

impl JournalStore for MemoryStore {
    fn save_journal(&self, journal: &RunJournal) -> StoreResult<()> {
        self.journals.write().insert(journal.pool_index, journal.clone());
        Ok(())
    }

    fn journal(&self, pool_index: PoolIndex) -> StoreResult<Option<RunJournal>> {
        Ok(self.journals.read().get(&pool_index).cloned())
    }

    fn clear_journal(&self, pool_index: PoolIndex) -> StoreResult<()> {
        self.journals.write().remove(&pool_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest(pool_index: PoolIndex, epoch_id: EpochId) -> EpochManifest {
        EpochManifest {
            pool_index,
            epoch_id,
            root: Digest([epoch_id as u8; 32]),
            snapshot_height: 1000 + epoch_id as u32,
            holders: vec![HolderBalance {
                address: HolderAddress::Account([7; 32]),
                balance: 100,
            }],
            created_at: 1_700_000_000,
        }
    }

    fn bundle(pool_index: PoolIndex, epoch_id: EpochId, balance: Amount) -> ProofBundle {
        bundle_for(7, pool_index, epoch_id, balance)
    }

    fn bundle_for(holder: u8, pool_index: PoolIndex, epoch_id: EpochId, balance: Amount) -> ProofBundle {
        ProofBundle {
            pool_index,
            holder_address: HolderAddress::Account([holder; 32]),
            balance,
            epoch_id,
            proof: vec![Digest([1; 32]), Digest([2; 32])],
        }
    }

    fn journal(pool_index: PoolIndex) -> RunJournal {
        RunJournal {
            pool_index,
            epoch_id: 2,
            root: Digest([9; 32]),
            snapshot_height: 500,
            holders: Vec::new(),
            updates: (0..5u8)
                .map(|i| BalanceUpdate {
                    holder: HolderAddress::Account([i; 32]),
                    new_balance: 10,
                })
                .collect(),
            batch_size: 2,
            applied_batches: BTreeSet::from([0]),
            created_at: 0,
        }
    }

    fn exercise_store(store: &dyn PipelineStore) {
        let holder = HolderAddress::Account([7; 32]);

        // Staged bundles stay invisible until promoted
        store.stage_bundles(0, 1, &[bundle(0, 1, 100), bundle_for(8, 0, 1, 40)]).unwrap();
        assert!(store.bundle(0, &holder).unwrap().is_none());
        assert_eq!(store.promote_bundles(0, 1).unwrap(), 2);
        assert_eq!(store.bundle(0, &holder).unwrap().unwrap().balance, 100);

        // Promotion replaces the whole set; holder 8 left
        store.stage_bundles(0, 2, &[bundle(0, 2, 150)]).unwrap();
        assert_eq!(store.bundle(0, &holder).unwrap().unwrap().epoch_id, 1);
        assert_eq!(store.promote_bundles(0, 2).unwrap(), 1);
        let latest = store.bundle(0, &holder).unwrap().unwrap();
        assert_eq!((latest.epoch_id, latest.balance), (2, 150));
        assert!(store.bundle(0, &HolderAddress::Account([8; 32])).unwrap().is_none());
        assert!(store.bundle(1, &holder).unwrap().is_none());

        // A discarded stage never reaches holders
        store.stage_bundles(0, 3, &[bundle(0, 3, 999)]).unwrap();
        store.discard_staged(0).unwrap();
        assert!(matches!(
            store.promote_bundles(0, 3),
            Err(StoreError::NothingStaged { pool_index: 0, epoch_id: 3 })
        ));
        assert_eq!(store.bundle(0, &holder).unwrap().unwrap().epoch_id, 2);

        // Promoting the wrong epoch fails and keeps the stage
        store.stage_bundles(0, 3, &[bundle(0, 3, 175)]).unwrap();
        assert!(store.promote_bundles(0, 4).is_err());
        assert_eq!(store.promote_bundles(0, 3).unwrap(), 1);

        // Leases
        let lease = store.try_lease(0).unwrap();
        assert!(matches!(store.try_lease(0), Err(StoreError::LeaseHeld { pool_index: 0 })));
        assert!(store.try_lease(1).is_ok());
        drop(lease);
        assert!(store.try_lease(0).is_ok());

        // Manifests are write-once
        assert!(store.latest_manifest(0).unwrap().is_none());
        store.publish_manifest(&manifest(0, 1)).unwrap();
        store.publish_manifest(&manifest(0, 2)).unwrap();
        store.publish_manifest(&manifest(1, 7)).unwrap();
        assert!(matches!(
            store.publish_manifest(&manifest(0, 2)),
            Err(StoreError::ManifestExists { pool_index: 0, epoch_id: 2 })
        ));
        assert_eq!(store.latest_manifest(0).unwrap().unwrap().epoch_id, 2);
        assert_eq!(store.manifest(0, 1).unwrap().unwrap(), manifest(0, 1));
        assert!(store.manifest(0, 3).unwrap().is_none());

        // Journal
        assert!(store.journal(0).unwrap().is_none());
        store.save_journal(&journal(0)).unwrap();
        assert_eq!(store.journal(0).unwrap().unwrap(), journal(0));
        store.clear_journal(0).unwrap();
        store.clear_journal(0).unwrap();
        assert!(store.journal(0).unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        exercise_store(&store);

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("manifests").join("pool-0"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_file_store_lease_shared_across_handles() {
        let dir = TempDir::new().unwrap();
        let first = FileStore::new(dir.path());
        let second = FileStore::new(dir.path());

        let lease = first.try_lease(2).unwrap();
        assert!(matches!(second.try_lease(2), Err(StoreError::LeaseHeld { pool_index: 2 })));
        drop(lease);
        assert!(second.try_lease(2).is_ok());
    }

    #[test]
    fn test_file_store_promotion_leaves_no_staging() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store.stage_bundles(0, 1, &[bundle(0, 1, 100)]).unwrap();
        store.promote_bundles(0, 1).unwrap();

        assert!(!dir.path().join("staging").join("pool-0").exists());
        assert!(!dir.path().join("proofs").join("pool-0.old").exists());
        assert!(dir.path().join("proofs").join("pool-0").is_dir());
    }

    #[test]
    fn test_file_store_latest_manifest_orders_numerically() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store.publish_manifest(&manifest(0, 9)).unwrap();
        store.publish_manifest(&manifest(0, 10)).unwrap();
        assert_eq!(store.latest_manifest(0).unwrap().unwrap().epoch_id, 10);
    }

    #[test]
    fn test_journal_batch_progress() {
        let mut j = journal(0);
        assert_eq!(j.batch_count(), 3);
        assert!(!j.is_reconciled());
        j.applied_batches.extend([1, 2]);
        assert!(j.is_reconciled());
    }
}
