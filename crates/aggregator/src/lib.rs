//! ShareCraft Aggregator
//!
//! Runs the per-pool epoch pipeline: take a holder census, build the
//! Merkle tree, publish proof bundles, commit the root on-ledger, carry
//! existing stakers into the new epoch with batched balance updates, and
//! publish the epoch manifest the next run diffs against.
//!
//! Runs for one pool are single-flight across every pipeline sharing a
//! store, including other processes on the same data directory. Progress
//! past root submission is journaled so an interrupted run resumes instead
//! of re-deriving its diff. Proof bundles go live only once their root is
//! on the ledger.

mod diff;
mod history;
mod lease;
mod pipeline;
mod store;

pub use diff::{compute_diff, DiffSummary, ReconciliationDiff};
pub use history::{HistoryEntry, HistoryEvent, HistoryLog};
pub use lease::{EpochLease, EpochLeases, LockFile};
pub use pipeline::{PipelineConfig, PoolRunReport, SnapshotPipeline};
pub use store::{
    EpochManifest, FileStore, JournalStore, LeaseStore, ManifestStore, MemoryStore, PipelineStore,
    ProofBundle, ProofStore, RunJournal, StoreError, StoreResult, DEFAULT_LEASE_TIMEOUT,
};

use sharecraft_core::{Digest, EpochId, PoolIndex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Census failed: {0}")]
    Census(#[from] sharecraft_census::CensusError),

    #[error("Tree build failed: {0}")]
    Merkle(#[from] sharecraft_merkle::MerkleError),

    #[error("Settlement failed: {0}")]
    Settlement(#[from] sharecraft_settlement::SettlementError),

    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Pool {0} is not configured")]
    UnknownPool(PoolIndex),

    #[error("Root {root} for pool {pool_index} epoch {epoch_id} not visible on ledger after {attempts} submissions")]
    RootNotCommitted {
        pool_index: PoolIndex,
        epoch_id: EpochId,
        root: Digest,
        attempts: u32,
    },

    #[error("Journal for pool {pool_index} epoch {epoch_id} rebuilds to root {rebuilt}, expected {journaled}")]
    JournalMismatch {
        pool_index: PoolIndex,
        epoch_id: EpochId,
        journaled: Digest,
        rebuilt: Digest,
    },

    #[error("Pool {pool_index} epoch {epoch_id}: {} of {total_batches} reconciliation batches failed", .failed_batches.len())]
    PartialReconciliation {
        pool_index: PoolIndex,
        epoch_id: EpochId,
        failed_batches: Vec<usize>,
        total_batches: usize,
    },
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
