//! ShareCraft Rewards
//!
//! The per-pool reward accumulator: pending reward for a holder is
//! `staked * acc_reward_per_share / PRECISION - reward_debt`, with the
//! accumulator advanced by `elapsed * rate / total_staked` on every
//! mutating call.
//!
//! Epoch rollover (a new Merkle root) zeroes `total_staked`. Holders whose
//! recorded epoch lags the committed one are stale: their reward is frozen
//! at the accumulator value their epoch closed with until they re-prove or
//! are reconciled by the snapshot pipeline.
//!
//! `RewardContract` is the authoritative model hosted by the ledger (see
//! the settlement crate's mock ledger). `RateEstimator` is a display-side
//! helper and never participates in settlement.

mod contract;
mod error;
mod estimator;
mod math;
mod state;

pub use contract::{RewardContract, MAX_BALANCE_UPDATES_PER_CALL};
pub use error::{ContractError, Result};
pub use estimator::{Accrual, Confidence, EstimatorConfig, RateEstimate, RateEstimator, RateSample};
pub use math::{accrual_delta, pending_at, reward_debt, PRECISION};
pub use state::{BalanceUpdate, MerkleRootData, PoolState, RootCommit, StakerInfo, UpdateOutcome};
