//! Off-ledger reward-rate estimation for live displays.
//!
//! A ticker that polls pool state can derive the rate from successive
//! accumulator readings. Those readings are noisy (stake changes between
//! polls, epoch rollovers, clock skew), so a derived rate is only trusted
//! when several consecutive samples agree and the value lies inside fixed
//! sanity bounds. Otherwise the last authoritative rate is used. Nothing
//! here feeds back into settlement.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use sharecraft_core::Amount;

use crate::math::{accrual_delta, pending_at, PRECISION};
use crate::state::{PoolState, StakerInfo};

/// One polled reading of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSample {
    pub timestamp: u64,
    pub acc_reward_per_share: i128,
    pub total_staked: Amount,
}

impl From<&PoolState> for RateSample {
    fn from(state: &PoolState) -> Self {
        Self {
            timestamp: state.last_reward_time,
            acc_reward_per_share: state.acc_reward_per_share,
            total_staked: state.total_staked,
        }
    }
}

/// Where an estimate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// Read directly from the contract and newer than every sample
    Authoritative,
    /// Agreed on by enough consecutive samples
    Derived,
    /// Samples were insufficient or disagreed; last authoritative value
    Fallback,
}

/// How a staker's reward follows the pool accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accrual {
    /// The staker's epoch is current
    Live,
    /// Stale staker, settled at the accumulator their epoch closed with
    Frozen { close_acc: i128 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateEstimate {
    /// Reward units per second
    pub rate: Amount,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Samples retained
    pub window: usize,
    /// Consecutive agreeing intervals needed before a derived rate is used
    pub min_agreeing: usize,
    /// Largest plausible rate
    pub max_rate: Amount,
    /// Allowed spread between derived intervals, in basis points of the median
    pub tolerance_bps: u32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            window: 8,
            min_agreeing: 3,
            max_rate: 1_000_000_000_000,
            tolerance_bps: 100,
        }
    }
}

pub struct RateEstimator {
    config: EstimatorConfig,
    samples: VecDeque<RateSample>,
    authoritative: Option<(u64, Amount)>,
}

impl RateEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window),
            config,
            authoritative: None,
        }
    }

    /// Record a rate read straight from the contract at `timestamp`
    pub fn observe_authoritative(&mut self, timestamp: u64, rate: Amount) {
        self.authoritative = Some((timestamp, rate));
    }

    /// Record a polled pool reading. Readings that go back in time, or whose
    /// accumulator decreased, reset the window.
    pub fn observe(&mut self, sample: RateSample) {
        if let Some(last) = self.samples.back() {
            if sample.timestamp <= last.timestamp
                || sample.acc_reward_per_share < last.acc_reward_per_share
            {
                self.samples.clear();
            }
        }
        self.samples.push_back(sample);
        while self.samples.len() > self.config.window {
            self.samples.pop_front();
        }
    }

    pub fn estimate(&self) -> Option<RateEstimate> {
        let newest_sample = self.samples.back().map(|s| s.timestamp);
        if let Some((at, rate)) = self.authoritative {
            if newest_sample.map_or(true, |t| at >= t) {
                return Some(RateEstimate {
                    rate,
                    confidence: Confidence::Authoritative,
                });
            }
        }

        if let Some(rate) = self.derived_rate() {
            return Some(RateEstimate {
                rate,
                confidence: Confidence::Derived,
            });
        }

        self.authoritative.map(|(_, rate)| RateEstimate {
            rate,
            confidence: Confidence::Fallback,
        })
    }

    /// Median of the most recent run of agreeing interval rates, if long enough
    fn derived_rate(&self) -> Option<Amount> {
        let mut rates: Vec<Amount> = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter_map(|(a, b)| interval_rate(a, b))
            .filter(|r| (0..=self.config.max_rate).contains(r))
            .collect();

        if rates.len() < self.config.min_agreeing.max(1) {
            return None;
        }
        let recent = rates.split_off(rates.len() - self.config.min_agreeing.max(1));
        let mut sorted = recent.clone();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];

        let tolerance = median.saturating_mul(self.config.tolerance_bps as i128) / 10_000;
        let agree = recent.iter().all(|r| (r - median).abs() <= tolerance);
        agree.then_some(median)
    }

    /// Projected pending reward for `staker` at `now`, using `estimate`.
    ///
    /// A frozen staker does not grow with the pool, whatever the rate.
    /// Display only: rounding matches the contract but the rate may not.
    pub fn project_pending(
        staker: &StakerInfo,
        pool: &PoolState,
        accrual: Accrual,
        estimate: RateEstimate,
        now: u64,
    ) -> Amount {
        let acc = match accrual {
            Accrual::Frozen { close_acc } => close_acc,
            Accrual::Live => {
                let elapsed = now.saturating_sub(pool.last_reward_time);
                accrual_delta(elapsed, estimate.rate, pool.total_staked)
                    .ok()
                    .and_then(|d| pool.acc_reward_per_share.checked_add(d))
                    .unwrap_or(pool.acc_reward_per_share)
            }
        };
        pending_at(staker, acc).unwrap_or(staker.pending_rewards)
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

/// Rate implied by two readings; `None` when stake changed in between or
/// nothing was staked, since the accumulator delta then no longer maps to
/// one rate.
fn interval_rate(a: &RateSample, b: &RateSample) -> Option<Amount> {
    if b.timestamp <= a.timestamp || a.total_staked != b.total_staked || a.total_staked <= 0 {
        return None;
    }
    let delta = b.acc_reward_per_share.checked_sub(a.acc_reward_per_share)?;
    let elapsed = (b.timestamp - a.timestamp) as i128;
    delta
        .checked_mul(a.total_staked)
        .map(|v| v / PRECISION / elapsed)
}
