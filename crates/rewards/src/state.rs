use serde::{Deserialize, Serialize};

use sharecraft_core::{Amount, Digest, EpochId, HolderAddress, LedgerHeight};

/// Accumulator state of one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    /// Reward per staked unit, scaled by `PRECISION`. Never decreases.
    pub acc_reward_per_share: i128,
    /// `acc_reward_per_share` frozen at the last root commit
    pub prev_acc_reward_per_share: i128,
    /// Accrual high-water mark (ledger seconds)
    pub last_reward_time: u64,
    /// Sum of stake proven or reconciled for the current epoch
    pub total_staked: Amount,
    /// False once the pool has been removed
    pub active: bool,
}

/// Per-holder, per-pool stake record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakerInfo {
    /// Epoch the stake was last proven or reconciled against
    pub epoch_id: EpochId,
    pub staked_amount: Amount,
    /// `staked_amount * acc / PRECISION` at the last settlement
    pub reward_debt: Amount,
    /// Settled but unclaimed reward
    pub pending_rewards: Amount,
}

/// The root currently authoritative for a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleRootData {
    pub root: Digest,
    pub epoch_id: EpochId,
    pub snapshot_height: LedgerHeight,
    /// Ledger time the root was committed at
    pub posted_at: u64,
}

/// Outcome of `commit_root`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootCommit {
    /// A new epoch became authoritative
    Committed,
    /// The same root was already committed for this epoch; nothing changed
    AlreadyCommitted,
}

/// Reconciliation target for one holder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub holder: HolderAddress,
    pub new_balance: Amount,
}

/// Per-holder outcome of `apply_balance_updates`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    /// Stake overwritten and moved to the current epoch
    Applied,
    /// Holder has never staked; left to prove on their own
    Skipped,
}
