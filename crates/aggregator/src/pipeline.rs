//! Snapshot and reconciliation pipeline
//!
//! One run per pool, under the pool's store lease:
//!
//! 1. Census of current holders
//! 2. `next_epoch = committed epoch + 1`
//! 3. Leaves, tree and staged per-holder proof bundles
//! 4. Root commitment (journaled first), then the staged bundles go live
//! 5. Diff against the previous epoch's manifest
//! 6. Balance updates in fixed-size batches
//! 7. Manifest publication, then the journal is cleared
//!
//! Nothing reaches the ledger before step 4 succeeds, and no batch is sent
//! unless the ledger shows this run's root committed. Holders only ever see
//! bundles for a root the ledger has.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use sharecraft_census::{Census, CensusSnapshot, HolderBalance};
use sharecraft_core::{Digest, EpochId, LedgerHeight, PoolDescriptor, PoolIndex};
use sharecraft_merkle::{leaf_for, MerkleTree};
use sharecraft_rewards::{BalanceUpdate, RootCommit, UpdateOutcome, MAX_BALANCE_UPDATES_PER_CALL};
use sharecraft_settlement::{SettlementClient, SettlementError};

use crate::diff::{compute_diff, DiffSummary};
use crate::history::{unix_now, HistoryEvent, HistoryLog};
use crate::store::{EpochManifest, PipelineStore, ProofBundle, RunJournal, StoreError};
use crate::{AggregatorError, Result};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Balance updates per ledger transaction
    pub batch_size: usize,
    /// Retries per batch after the first attempt
    pub max_batch_retries: u32,
    /// Linear backoff step between batch retries
    pub retry_backoff: Duration,
    /// Root submissions before giving up on an unknown outcome
    pub max_root_submissions: u32,
    /// JSONL history file; `None` keeps history in memory only
    pub history_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_batch_retries: 5,
            retry_backoff: Duration::from_secs(2),
            max_root_submissions: 3,
            history_path: None,
        }
    }
}

/// Outcome of one successful pool run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRunReport {
    pub pool_index: PoolIndex,
    pub epoch_id: EpochId,
    pub root: Digest,
    pub snapshot_height: LedgerHeight,
    pub holders: usize,
    pub diff: DiffSummary,
    /// Stakers moved to the new epoch
    pub applied: usize,
    /// Diff entries with no stake to carry over
    pub skipped: usize,
    pub batches: usize,
    /// Picked up from a journal left by an interrupted run
    pub resumed: bool,
}

/// Counts from the reconciliation step
#[derive(Default)]
struct Reconciled {
    applied: usize,
    skipped: usize,
    failed_batches: Vec<usize>,
}

pub struct SnapshotPipeline {
    config: PipelineConfig,
    pools: Vec<PoolDescriptor>,
    census: Arc<dyn Census>,
    settlement: Arc<SettlementClient>,
    store: Arc<dyn PipelineStore>,
    history: Mutex<HistoryLog>,
}

impl SnapshotPipeline {
    pub fn new(
        config: PipelineConfig,
        pools: Vec<PoolDescriptor>,
        census: Arc<dyn Census>,
        settlement: Arc<SettlementClient>,
        store: Arc<dyn PipelineStore>,
    ) -> Self {
        let history = match &config.history_path {
            Some(path) => HistoryLog::load(path),
            None => HistoryLog::new(),
        };
        Self {
            config,
            pools,
            census,
            settlement,
            store,
            history: Mutex::new(history),
        }
    }

    pub fn pools(&self) -> &[PoolDescriptor] {
        &self.pools
    }

    pub fn pool(&self, pool_index: PoolIndex) -> Result<&PoolDescriptor> {
        self.pools
            .iter()
            .find(|p| p.index == pool_index)
            .ok_or(AggregatorError::UnknownPool(pool_index))
    }

    /// Snapshot of the history log
    pub fn history(&self) -> Vec<crate::HistoryEntry> {
        self.history.lock().entries().to_vec()
    }

    /// Run every configured pool concurrently
    pub async fn run_all(&self) -> Vec<(PoolIndex, Result<PoolRunReport>)> {
        let runs = self
            .pools
            .iter()
            .map(|pool| async move { (pool.index, self.run_pool(pool).await) });
        join_all(runs).await
    }

    /// Run one pool under its epoch lease.
    ///
    /// Fails with `StoreError::LeaseHeld` while any other pipeline on the
    /// same store is running the pool.
    pub async fn run_pool(&self, pool: &PoolDescriptor) -> Result<PoolRunReport> {
        let _lease = self.store.try_lease(pool.index)?;
        info!("Pipeline run for {} started", pool.name());

        let result = self.run_leased(pool).await;
        match &result {
            Ok(report) => info!(
                "Pipeline run for {} finished: epoch {} root {} ({} holders, {} applied, {} skipped)",
                pool.name(),
                report.epoch_id,
                report.root.short(),
                report.holders,
                report.applied,
                report.skipped
            ),
            Err(e) => {
                error!("Pipeline run for {} failed: {}", pool.name(), e);
                self.record(HistoryEvent::RunAborted {
                    pool_index: pool.index,
                    reason: e.to_string(),
                });
            }
        }
        self.flush_history();
        result
    }

    async fn run_leased(&self, pool: &PoolDescriptor) -> Result<PoolRunReport> {
        let committed = self.settlement.committed_root(pool.index).await?;
        let committed_epoch = committed.as_ref().map_or(0, |c| c.epoch_id);

        if let Some(journal) = self.store.journal(pool.index)? {
            let landed = committed
                .as_ref()
                .is_some_and(|c| c.epoch_id == journal.epoch_id && c.root == journal.root);
            if landed {
                info!(
                    "Resuming {} epoch {} from journal ({}/{} batches applied)",
                    pool.name(),
                    journal.epoch_id,
                    journal.applied_batches.len(),
                    journal.batch_count()
                );
                return self.resume(pool, journal).await;
            }
            warn!(
                "Discarding journal for {} epoch {}: ledger is at epoch {}",
                pool.name(),
                journal.epoch_id,
                committed_epoch
            );
            self.store.clear_journal(pool.index)?;
            self.store.discard_staged(pool.index)?;
        }

        let epoch_id = committed_epoch + 1;

        // Census and tree: a failure here has no side effects
        let CensusSnapshot {
            ledger_height,
            mut holders,
        } = self.census.snapshot(pool).await?;
        holders.sort_by(|a, b| a.address.cmp(&b.address));
        let tree = build_tree(pool.index, &holders, epoch_id)?;
        self.store
            .stage_bundles(pool.index, epoch_id, &bundles(pool.index, epoch_id, &holders, &tree))?;
        debug!(
            "{} epoch {}: {} leaves, root {}",
            pool.name(),
            epoch_id,
            tree.leaf_count(),
            tree.root().short()
        );

        let previous = match committed_epoch {
            0 => Vec::new(),
            epoch => match self.store.manifest(pool.index, epoch)? {
                Some(manifest) => manifest.holders,
                None => {
                    warn!(
                        "No manifest for {} epoch {}; nobody will be carried over",
                        pool.name(),
                        epoch
                    );
                    Vec::new()
                }
            },
        };
        let diff = compute_diff(&previous, &holders);
        info!(
            "{} diff: {} unchanged, {} changed, {} removed, {} new",
            pool.name(),
            diff.summary.unchanged,
            diff.summary.changed,
            diff.summary.removed,
            diff.summary.new_holders
        );

        let mut journal = RunJournal {
            pool_index: pool.index,
            epoch_id,
            root: tree.root(),
            snapshot_height: ledger_height,
            holders,
            updates: diff.updates,
            batch_size: self.batch_size(),
            applied_batches: Default::default(),
            created_at: unix_now(),
        };
        self.store.save_journal(&journal)?;

        if let Err(e) = self.commit_root(&journal).await {
            // A definite rejection means the root never landed
            if matches!(&e, AggregatorError::Settlement(SettlementError::Rejected { .. })) {
                self.store.clear_journal(pool.index)?;
            }
            // A resumed run re-stages from the journal
            self.store.discard_staged(pool.index)?;
            return Err(e);
        }
        let promoted = self.store.promote_bundles(pool.index, epoch_id)?;
        debug!("{} epoch {}: {} proof bundles live", pool.name(), epoch_id, promoted);

        self.finish(pool, &mut journal, diff.summary, false).await
    }

    /// Pick up a run whose root is already on the ledger
    async fn resume(&self, pool: &PoolDescriptor, mut journal: RunJournal) -> Result<PoolRunReport> {
        let tree = build_tree(pool.index, &journal.holders, journal.epoch_id)?;
        if tree.root() != journal.root {
            return Err(AggregatorError::JournalMismatch {
                pool_index: pool.index,
                epoch_id: journal.epoch_id,
                journaled: journal.root,
                rebuilt: tree.root(),
            });
        }
        // The root is on the ledger, so the bundles can go straight live
        self.store.stage_bundles(
            pool.index,
            journal.epoch_id,
            &bundles(pool.index, journal.epoch_id, &journal.holders, &tree),
        )?;
        self.store.promote_bundles(pool.index, journal.epoch_id)?;

        let previous = match journal.epoch_id {
            1 => Vec::new(),
            epoch => self
                .store
                .manifest(pool.index, epoch - 1)?
                .map(|m| m.holders)
                .unwrap_or_default(),
        };
        let summary = compute_diff(&previous, &journal.holders).summary;
        self.finish(pool, &mut journal, summary, true).await
    }

    /// Reconcile, publish the manifest and clear the journal
    async fn finish(
        &self,
        pool: &PoolDescriptor,
        journal: &mut RunJournal,
        diff: DiffSummary,
        resumed: bool,
    ) -> Result<PoolRunReport> {
        let reconciled = self.reconcile(journal).await?;
        if !reconciled.failed_batches.is_empty() {
            return Err(AggregatorError::PartialReconciliation {
                pool_index: journal.pool_index,
                epoch_id: journal.epoch_id,
                failed_batches: reconciled.failed_batches,
                total_batches: journal.batch_count(),
            });
        }

        let manifest = EpochManifest {
            pool_index: journal.pool_index,
            epoch_id: journal.epoch_id,
            root: journal.root,
            snapshot_height: journal.snapshot_height,
            holders: journal.holders.clone(),
            created_at: unix_now(),
        };
        match self.store.publish_manifest(&manifest) {
            Ok(()) => {}
            Err(StoreError::ManifestExists { .. }) => {
                // Published by the interrupted run before its journal was cleared
                let existing = self.store.manifest(journal.pool_index, journal.epoch_id)?;
                if existing.map(|m| m.root) != Some(journal.root) {
                    return Err(StoreError::ManifestExists {
                        pool_index: journal.pool_index,
                        epoch_id: journal.epoch_id,
                    }
                    .into());
                }
                debug!("{} epoch {} manifest already published", pool.name(), journal.epoch_id);
            }
            Err(e) => return Err(e.into()),
        }
        self.record(HistoryEvent::ManifestPublished {
            pool_index: journal.pool_index,
            epoch_id: journal.epoch_id,
            root: journal.root,
        });
        self.store.clear_journal(journal.pool_index)?;

        Ok(PoolRunReport {
            pool_index: journal.pool_index,
            epoch_id: journal.epoch_id,
            root: journal.root,
            snapshot_height: journal.snapshot_height,
            holders: journal.holders.len(),
            diff,
            applied: reconciled.applied,
            skipped: reconciled.skipped,
            batches: journal.batch_count(),
            resumed,
        })
    }

    /// Submit the journal's root until the ledger shows it committed.
    ///
    /// After an unknown outcome the committed root is re-read before any
    /// resubmission.
    async fn commit_root(&self, journal: &RunJournal) -> Result<()> {
        let attempts = self.config.max_root_submissions.max(1);
        for attempt in 1..=attempts {
            let submitted = self
                .settlement
                .submit_root(journal.pool_index, journal.root, journal.epoch_id, journal.snapshot_height)
                .await;
            match submitted {
                Ok(outcome) => {
                    if outcome == RootCommit::AlreadyCommitted {
                        debug!("Pool {} epoch {} root was already committed", journal.pool_index, journal.epoch_id);
                    }
                    self.record_root(journal);
                    return Ok(());
                }
                Err(SettlementError::UnknownOutcome { tx_hash }) => {
                    warn!(
                        "Root submission {} for pool {} has unknown outcome (attempt {}/{}); re-reading ledger",
                        &tx_hash[..16.min(tx_hash.len())],
                        journal.pool_index,
                        attempt,
                        attempts
                    );
                    let committed = self.settlement.committed_root(journal.pool_index).await?;
                    if committed.is_some_and(|c| c.epoch_id == journal.epoch_id && c.root == journal.root) {
                        info!("Root for pool {} epoch {} landed", journal.pool_index, journal.epoch_id);
                        self.record_root(journal);
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AggregatorError::RootNotCommitted {
            pool_index: journal.pool_index,
            epoch_id: journal.epoch_id,
            root: journal.root,
            attempts,
        })
    }

    fn record_root(&self, journal: &RunJournal) {
        self.record(HistoryEvent::RootCommitted {
            pool_index: journal.pool_index,
            epoch_id: journal.epoch_id,
            root: journal.root,
            snapshot_height: journal.snapshot_height,
            holders: journal.holders.len(),
        });
    }

    /// Send every batch not yet journaled as applied.
    ///
    /// Batches are idempotent overwrites, so a batch with an unknown outcome
    /// is simply sent again. Failed batches are reported, never dropped.
    async fn reconcile(&self, journal: &mut RunJournal) -> Result<Reconciled> {
        let mut reconciled = Reconciled::default();
        let batch_size = journal.batch_size.max(1);
        let batches: Vec<Vec<BalanceUpdate>> = journal
            .updates
            .chunks(batch_size)
            .map(<[BalanceUpdate]>::to_vec)
            .collect();

        for (index, batch) in batches.into_iter().enumerate() {
            if journal.applied_batches.contains(&index) {
                continue;
            }
            match self.submit_batch(journal, index, batch).await {
                Some(outcomes) => {
                    let applied = outcomes.iter().filter(|o| **o == UpdateOutcome::Applied).count();
                    let skipped = outcomes.len() - applied;
                    reconciled.applied += applied;
                    reconciled.skipped += skipped;
                    journal.applied_batches.insert(index);
                    self.store.save_journal(journal)?;
                    self.record(HistoryEvent::BatchApplied {
                        pool_index: journal.pool_index,
                        epoch_id: journal.epoch_id,
                        batch: index,
                        applied,
                        skipped,
                    });
                }
                None => reconciled.failed_batches.push(index),
            }
        }
        Ok(reconciled)
    }

    async fn submit_batch(
        &self,
        journal: &RunJournal,
        index: usize,
        batch: Vec<BalanceUpdate>,
    ) -> Option<Vec<UpdateOutcome>> {
        let attempts = self.config.max_batch_retries + 1;
        for attempt in 1..=attempts {
            let err = match self
                .settlement
                .submit_balance_updates(journal.pool_index, journal.epoch_id, batch.clone())
                .await
            {
                Ok(outcomes) => return Some(outcomes),
                Err(e) => e,
            };
            if let Some(contract_error) = err.contract_error() {
                error!(
                    "Pool {} batch {} rejected by contract: {}",
                    journal.pool_index, index, contract_error
                );
                return None;
            }
            warn!(
                "Pool {} batch {} attempt {}/{} failed: {}",
                journal.pool_index, index, attempt, attempts, err
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
        }
        None
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.clamp(1, MAX_BALANCE_UPDATES_PER_CALL)
    }

    fn record(&self, event: HistoryEvent) {
        self.history.lock().append(event);
    }

    fn flush_history(&self) {
        let Some(path) = &self.config.history_path else { return };
        if let Err(e) = self.history.lock().flush(path) {
            warn!("Failed to flush history to {}: {}", path.display(), e);
        }
    }
}

fn build_tree(pool_index: PoolIndex, holders: &[HolderBalance], epoch_id: EpochId) -> Result<MerkleTree> {
    let leaves: Vec<Digest> = holders
        .iter()
        .map(|h| leaf_for(pool_index, &h.address, h.balance, epoch_id))
        .collect();
    Ok(MerkleTree::build(&leaves)?)
}

fn bundles(
    pool_index: PoolIndex,
    epoch_id: EpochId,
    holders: &[HolderBalance],
    tree: &MerkleTree,
) -> Vec<ProofBundle> {
    holders
        .iter()
        .zip(tree.proofs())
        .map(|(holder, proof)| ProofBundle {
            pool_index,
            holder_address: holder.address,
            balance: holder.balance,
            epoch_id,
            proof: proof.clone(),
        })
        .collect()
}
