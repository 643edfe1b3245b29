//! Fixed-point accumulator arithmetic.
//!
//! Every division truncates toward zero. All operations are checked and
//! report `ArithmeticOverflow` instead of wrapping.

use sharecraft_core::Amount;

use crate::error::{ContractError, Result};
use crate::state::StakerInfo;

/// Scale of `acc_reward_per_share` (1e18), shared by the ledger contract
/// and every off-ledger estimator.
pub const PRECISION: i128 = 1_000_000_000_000_000_000;

/// Per-share delta for `elapsed` seconds at `rate` spread over `total_staked`.
///
/// Zero when nothing is staked, no time passed, or the rate is zero.
pub fn accrual_delta(elapsed: u64, rate: Amount, total_staked: Amount) -> Result<i128> {
    if elapsed == 0 || total_staked <= 0 || rate <= 0 {
        return Ok(0);
    }
    let reward = (elapsed as i128)
        .checked_mul(rate)
        .ok_or(ContractError::ArithmeticOverflow)?;
    reward
        .checked_mul(PRECISION)
        .map(|scaled| scaled / total_staked)
        .ok_or(ContractError::ArithmeticOverflow)
}

/// `staked * acc / PRECISION`
pub fn reward_debt(staked: Amount, acc: i128) -> Result<Amount> {
    staked
        .checked_mul(acc)
        .map(|v| v / PRECISION)
        .ok_or(ContractError::ArithmeticOverflow)
}

/// Settled-plus-accrued reward for `staker` against accumulator `acc`.
pub fn pending_at(staker: &StakerInfo, acc: i128) -> Result<Amount> {
    if staker.staked_amount == 0 {
        return Ok(staker.pending_rewards);
    }
    let accrued = reward_debt(staker.staked_amount, acc)?
        .checked_sub(staker.reward_debt)
        .ok_or(ContractError::ArithmeticOverflow)?;
    staker
        .pending_rewards
        .checked_add(accrued)
        .ok_or(ContractError::ArithmeticOverflow)
}

pub(crate) fn checked_add(a: Amount, b: Amount) -> Result<Amount> {
    a.checked_add(b).ok_or(ContractError::ArithmeticOverflow)
}

pub(crate) fn checked_sub(a: Amount, b: Amount) -> Result<Amount> {
    a.checked_sub(b).ok_or(ContractError::ArithmeticOverflow)
}
