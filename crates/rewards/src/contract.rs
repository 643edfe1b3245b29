//! The reward contract as a pure state machine.
//!
//! Every entry point takes the ledger timestamp `now` explicitly. Each call
//! either applies completely or returns an error with no state change,
//! matching the all-or-nothing semantics of a ledger transaction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sharecraft_core::{Amount, Digest, EpochId, HolderAddress, LedgerHeight, PoolId, PoolIndex};
use sharecraft_merkle::{leaf_for, verify};

use crate::error::{ContractError, Result};
use crate::estimator::Accrual;
use crate::math::{accrual_delta, checked_add, checked_sub, pending_at, reward_debt};
use crate::state::{BalanceUpdate, MerkleRootData, PoolState, RootCommit, StakerInfo, UpdateOutcome};

/// Upper bound on updates accepted by one `apply_balance_updates` call,
/// keeping a reconciliation transaction inside the ledger's per-call budget.
pub const MAX_BALANCE_UPDATES_PER_CALL: usize = 100;

type StakerKey = (HolderAddress, PoolIndex);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolRecord {
    pool_id: PoolId,
    state: PoolState,
    root: Option<MerkleRootData>,
    /// Accumulator value at the moment each past epoch was superseded
    epoch_close_acc: BTreeMap<EpochId, i128>,
}

impl PoolRecord {
    fn current_epoch(&self) -> Option<EpochId> {
        self.root.as_ref().map(|r| r.epoch_id)
    }

    fn is_current(&self, staker: &StakerInfo) -> bool {
        self.current_epoch() == Some(staker.epoch_id)
    }

    /// Accumulator a staker is settled against: the live value when their
    /// epoch is current, otherwise the value frozen when their epoch closed.
    fn settlement_acc(&self, state: &PoolState, staker: &StakerInfo) -> i128 {
        if self.is_current(staker) {
            state.acc_reward_per_share
        } else {
            self.epoch_close_acc
                .get(&staker.epoch_id)
                .copied()
                .unwrap_or(state.prev_acc_reward_per_share)
        }
    }
}

/// Authoritative reward bookkeeping for every registered pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewardContract {
    admin: Option<HolderAddress>,
    /// Reward units per second, shared by all pools
    reward_rate: Amount,
    /// Funded reward units not yet paid out
    reward_balance: Amount,
    pools: Vec<PoolRecord>,
    pool_ids: BTreeMap<PoolId, PoolIndex>,
    stakers: BTreeMap<StakerKey, StakerInfo>,
}

impl RewardContract {
    /// An uninitialized contract
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Admin entry points
    // =========================================================================

    pub fn initialize(&mut self, admin: HolderAddress, reward_rate: Amount) -> Result<()> {
        if self.admin.is_some() {
            return Err(ContractError::AlreadyInitialized);
        }
        if reward_rate < 0 {
            return Err(ContractError::InvalidAmount);
        }
        info!("Reward contract initialized, admin {}, rate {}/s", admin.short(), reward_rate);
        self.admin = Some(admin);
        self.reward_rate = reward_rate;
        Ok(())
    }

    /// Register a liquidity pool; returns its index.
    pub fn add_pool(&mut self, caller: &HolderAddress, pool_id: PoolId, now: u64) -> Result<PoolIndex> {
        self.require_admin(caller)?;
        if self.pool_ids.contains_key(&pool_id) {
            return Err(ContractError::PoolAlreadyExists);
        }
        let index = self.pools.len() as PoolIndex;
        self.pools.push(PoolRecord {
            pool_id,
            state: PoolState {
                last_reward_time: now,
                active: true,
                ..PoolState::default()
            },
            root: None,
            epoch_close_acc: BTreeMap::new(),
        });
        self.pool_ids.insert(pool_id, index);
        info!("Pool {} registered ({})", index, hex::encode(&pool_id[..8]));
        Ok(index)
    }

    /// Deactivate a pool. Accrual is settled first; pending rewards stay claimable.
    pub fn remove_pool(&mut self, caller: &HolderAddress, pool_index: PoolIndex, now: u64) -> Result<()> {
        self.require_admin(caller)?;
        let rate = self.reward_rate;
        let record = self.pool_mut(pool_index)?;
        let mut state = settle(&record.state, rate, now)?;
        state.total_staked = 0;
        state.active = false;
        record.state = state;
        info!("Pool {} deactivated", pool_index);
        Ok(())
    }

    /// Change the global rate. Every active pool is settled at the old rate first.
    pub fn set_reward_rate(&mut self, caller: &HolderAddress, new_rate: Amount, now: u64) -> Result<()> {
        self.require_admin(caller)?;
        if new_rate < 0 {
            return Err(ContractError::InvalidAmount);
        }
        let rate = self.reward_rate;
        let settled = self
            .pools
            .iter()
            .map(|p| settle(&p.state, rate, now))
            .collect::<Result<Vec<_>>>()?;
        for (record, state) in self.pools.iter_mut().zip(settled) {
            record.state = state;
        }
        info!("Reward rate {} -> {}/s", rate, new_rate);
        self.reward_rate = new_rate;
        Ok(())
    }

    pub fn set_admin(&mut self, caller: &HolderAddress, new_admin: HolderAddress) -> Result<()> {
        self.require_admin(caller)?;
        info!("Admin transferred to {}", new_admin.short());
        self.admin = Some(new_admin);
        Ok(())
    }

    /// Add reward units to the fund; returns the new fund balance.
    pub fn fund(&mut self, amount: Amount) -> Result<Amount> {
        if self.admin.is_none() {
            return Err(ContractError::NotInitialized);
        }
        if amount <= 0 {
            return Err(ContractError::InvalidAmount);
        }
        self.reward_balance = checked_add(self.reward_balance, amount)?;
        Ok(self.reward_balance)
    }

    /// Make `root` authoritative for `epoch_id` of a pool.
    ///
    /// `epoch_id` must be exactly one past the committed epoch. Re-sending
    /// the committed `(epoch_id, root)` is a no-op so a submission with an
    /// unknown outcome can be retried safely.
    pub fn commit_root(
        &mut self,
        caller: &HolderAddress,
        pool_index: PoolIndex,
        root: Digest,
        epoch_id: EpochId,
        snapshot_height: LedgerHeight,
        now: u64,
    ) -> Result<RootCommit> {
        self.require_admin(caller)?;
        let rate = self.reward_rate;
        let record = self.pool_mut(pool_index)?;
        if !record.state.active {
            return Err(ContractError::PoolInactive);
        }

        let latest = record.current_epoch().unwrap_or(0);
        if let Some(committed) = &record.root {
            if committed.epoch_id == epoch_id && committed.root == root {
                debug!("Pool {} epoch {} root already committed", pool_index, epoch_id);
                return Ok(RootCommit::AlreadyCommitted);
            }
        }
        if epoch_id != latest + 1 {
            return Err(ContractError::StaleEpoch);
        }

        // Close the outgoing epoch at the settled accumulator
        let mut state = settle(&record.state, rate, now)?;
        if latest > 0 {
            record.epoch_close_acc.insert(latest, state.acc_reward_per_share);
        }
        state.prev_acc_reward_per_share = state.acc_reward_per_share;
        state.total_staked = 0;
        record.state = state;
        record.root = Some(MerkleRootData {
            root,
            epoch_id,
            snapshot_height,
            posted_at: now,
        });

        info!(
            "Pool {} epoch {} committed: root {} at height {}",
            pool_index,
            epoch_id,
            root.short(),
            snapshot_height
        );
        Ok(RootCommit::Committed)
    }

    /// Overwrite existing stakers' balances for the committed epoch without proofs.
    ///
    /// Holders with no record, or whose stake is zero, are reported `Skipped`
    /// and must prove on their own. A negative target rejects the whole batch.
    pub fn apply_balance_updates(
        &mut self,
        caller: &HolderAddress,
        pool_index: PoolIndex,
        epoch_id: EpochId,
        updates: &[BalanceUpdate],
        now: u64,
    ) -> Result<Vec<UpdateOutcome>> {
        self.require_admin(caller)?;
        if updates.len() > MAX_BALANCE_UPDATES_PER_CALL {
            return Err(ContractError::BatchTooLarge);
        }
        if updates.iter().any(|u| u.new_balance < 0) {
            return Err(ContractError::InvalidAmount);
        }

        let record = self.pool(pool_index)?;
        if !record.state.active {
            return Err(ContractError::PoolInactive);
        }
        let current = record.current_epoch().ok_or(ContractError::NoMerkleRoot)?;
        if epoch_id != current {
            return Err(ContractError::StaleEpoch);
        }

        let mut state = settle(&record.state, self.reward_rate, now)?;
        let mut writes: BTreeMap<StakerKey, StakerInfo> = BTreeMap::new();
        let mut outcomes = Vec::with_capacity(updates.len());

        for update in updates {
            let key = (update.holder, pool_index);
            let existing = writes.get(&key).or_else(|| self.stakers.get(&key)).cloned();
            let staker = match existing {
                Some(s) if s.staked_amount > 0 => s,
                _ => {
                    outcomes.push(UpdateOutcome::Skipped);
                    continue;
                }
            };

            let pending = pending_at(&staker, record.settlement_acc(&state, &staker))?;
            if record.is_current(&staker) {
                state.total_staked = checked_sub(state.total_staked, staker.staked_amount)?;
            }
            state.total_staked = checked_add(state.total_staked, update.new_balance)?;
            writes.insert(
                key,
                StakerInfo {
                    epoch_id: current,
                    staked_amount: update.new_balance,
                    reward_debt: reward_debt(update.new_balance, state.acc_reward_per_share)?,
                    pending_rewards: pending,
                },
            );
            outcomes.push(UpdateOutcome::Applied);
        }

        let applied = writes.len();
        self.stakers.extend(writes);
        self.pools[pool_index as usize].state = state;
        debug!(
            "Pool {} epoch {}: {} of {} balance updates applied",
            pool_index,
            epoch_id,
            applied,
            updates.len()
        );
        Ok(outcomes)
    }

    // =========================================================================
    // Holder entry points
    // =========================================================================

    /// Prove `lp_balance` for the current epoch and start accruing on it.
    pub fn stake(
        &mut self,
        holder: &HolderAddress,
        pool_index: PoolIndex,
        lp_balance: Amount,
        epoch_id: EpochId,
        proof: &[Digest],
        now: u64,
    ) -> Result<()> {
        let record = self.pool(pool_index)?;
        if !record.state.active {
            return Err(ContractError::PoolInactive);
        }
        if lp_balance <= 0 {
            return Err(ContractError::InvalidAmount);
        }
        let committed = record.root.as_ref().ok_or(ContractError::NoMerkleRoot)?;
        if epoch_id != committed.epoch_id {
            return Err(ContractError::StaleEpoch);
        }
        let leaf = leaf_for(pool_index, holder, lp_balance, epoch_id);
        if !verify(&leaf, proof, &committed.root) {
            return Err(ContractError::InvalidProof);
        }

        let key = (*holder, pool_index);
        let mut state = settle(&record.state, self.reward_rate, now)?;
        let carried = match self.stakers.get(&key) {
            Some(existing) if record.is_current(existing) && existing.staked_amount > 0 => {
                return Err(ContractError::AlreadyStakedThisEpoch);
            }
            Some(existing) => pending_at(existing, record.settlement_acc(&state, existing))?,
            None => 0,
        };

        let info = StakerInfo {
            epoch_id,
            staked_amount: lp_balance,
            reward_debt: reward_debt(lp_balance, state.acc_reward_per_share)?,
            pending_rewards: carried,
        };
        state.total_staked = checked_add(state.total_staked, lp_balance)?;

        self.stakers.insert(key, info);
        self.pools[pool_index as usize].state = state;
        debug!("{} staked {} in pool {} epoch {}", holder.short(), lp_balance, pool_index, epoch_id);
        Ok(())
    }

    /// Stop accruing. Pending rewards are kept for a later claim.
    pub fn unstake(&mut self, holder: &HolderAddress, pool_index: PoolIndex, now: u64) -> Result<()> {
        let record = self.pool(pool_index)?;
        let key = (*holder, pool_index);
        let staker = self.stakers.get(&key).ok_or(ContractError::NoStakeFound)?;

        let mut state = settle(&record.state, self.reward_rate, now)?;
        let pending = pending_at(staker, record.settlement_acc(&state, staker))?;
        if record.is_current(staker) && staker.staked_amount > 0 && state.active {
            state.total_staked = checked_sub(state.total_staked, staker.staked_amount)?;
        }
        let epoch_id = staker.epoch_id;

        self.pools[pool_index as usize].state = state;
        if pending > 0 {
            self.stakers.insert(
                key,
                StakerInfo {
                    epoch_id,
                    staked_amount: 0,
                    reward_debt: 0,
                    pending_rewards: pending,
                },
            );
        } else {
            self.stakers.remove(&key);
        }
        debug!("{} unstaked from pool {} ({} pending)", holder.short(), pool_index, pending);
        Ok(())
    }

    /// Pay out everything pending; returns the amount paid.
    pub fn claim(&mut self, holder: &HolderAddress, pool_index: PoolIndex, now: u64) -> Result<Amount> {
        let record = self.pool(pool_index)?;
        let key = (*holder, pool_index);
        let staker = self.stakers.get(&key).ok_or(ContractError::NoStakeFound)?;

        let state = settle(&record.state, self.reward_rate, now)?;
        let acc = record.settlement_acc(&state, staker);
        let pending = pending_at(staker, acc)?;
        if pending <= 0 {
            return Err(ContractError::NoRewardsToClaim);
        }
        if self.reward_balance < pending {
            return Err(ContractError::InsufficientRewardBalance);
        }

        // Stale stakers reset their debt against their epoch's close value,
        // so a second claim before reconciliation pays nothing.
        let info = StakerInfo {
            reward_debt: reward_debt(staker.staked_amount, acc)?,
            pending_rewards: 0,
            ..staker.clone()
        };

        self.reward_balance -= pending;
        self.stakers.insert(key, info);
        self.pools[pool_index as usize].state = state;
        info!("{} claimed {} from pool {}", holder.short(), pending, pool_index);
        Ok(pending)
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Pending reward as of `now`, without mutating anything
    pub fn pending_reward(&self, holder: &HolderAddress, pool_index: PoolIndex, now: u64) -> Result<Amount> {
        let record = self.pool(pool_index)?;
        let Some(staker) = self.stakers.get(&(*holder, pool_index)) else {
            return Ok(0);
        };
        let state = settle(&record.state, self.reward_rate, now)?;
        pending_at(staker, record.settlement_acc(&state, staker))
    }

    /// Whether `staker` follows the live accumulator or is frozen at the
    /// close of their epoch
    pub fn staker_accrual(&self, staker: &StakerInfo, pool_index: PoolIndex) -> Result<Accrual> {
        let record = self.pool(pool_index)?;
        if record.is_current(staker) {
            return Ok(Accrual::Live);
        }
        Ok(Accrual::Frozen {
            close_acc: record.settlement_acc(&record.state, staker),
        })
    }

    pub fn pool_state(&self, pool_index: PoolIndex) -> Result<PoolState> {
        Ok(self.pool(pool_index)?.state.clone())
    }

    pub fn staker_info(&self, holder: &HolderAddress, pool_index: PoolIndex) -> Option<StakerInfo> {
        self.stakers.get(&(*holder, pool_index)).cloned()
    }

    pub fn merkle_root(&self, pool_index: PoolIndex) -> Result<Option<MerkleRootData>> {
        Ok(self.pool(pool_index)?.root.clone())
    }

    pub fn pool_count(&self) -> u32 {
        self.pools.len() as u32
    }

    pub fn pool_id(&self, pool_index: PoolIndex) -> Result<PoolId> {
        Ok(self.pool(pool_index)?.pool_id)
    }

    pub fn pool_index(&self, pool_id: &PoolId) -> Option<PoolIndex> {
        self.pool_ids.get(pool_id).copied()
    }

    pub fn reward_balance(&self) -> Amount {
        self.reward_balance
    }

    pub fn reward_rate(&self) -> Amount {
        self.reward_rate
    }

    pub fn admin(&self) -> Option<HolderAddress> {
        self.admin
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn require_admin(&self, caller: &HolderAddress) -> Result<()> {
        match &self.admin {
            None => Err(ContractError::NotInitialized),
            Some(admin) if admin == caller => Ok(()),
            Some(_) => Err(ContractError::Unauthorized),
        }
    }

    fn pool(&self, pool_index: PoolIndex) -> Result<&PoolRecord> {
        self.pools
            .get(pool_index as usize)
            .ok_or(ContractError::PoolNotFound)
    }

    fn pool_mut(&mut self, pool_index: PoolIndex) -> Result<&mut PoolRecord> {
        self.pools
            .get_mut(pool_index as usize)
            .ok_or(ContractError::PoolNotFound)
    }
}

/// Pool state with accrual brought up to `now`.
///
/// The high-water mark only moves forward; with nothing staked it advances
/// without crediting the accumulator.
fn settle(state: &PoolState, rate: Amount, now: u64) -> Result<PoolState> {
    let mut next = state.clone();
    if now > state.last_reward_time {
        let delta = accrual_delta(now - state.last_reward_time, rate, state.total_staked)?;
        next.acc_reward_per_share = checked_add(state.acc_reward_per_share, delta)?;
        next.last_reward_time = now;
    }
    Ok(next)
}
