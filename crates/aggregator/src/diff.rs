//! Reconciliation diff between two consecutive epochs of a pool.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use sharecraft_census::HolderBalance;
use sharecraft_core::{Amount, HolderAddress};
use sharecraft_rewards::BalanceUpdate;

/// How the holder set moved between two epochs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Present in both epochs with the same balance
    pub unchanged: usize,
    /// Present in both epochs with a different balance
    pub changed: usize,
    /// Present before, gone now (target zero)
    pub removed: usize,
    /// Only in the new census; not part of the diff
    pub new_holders: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationDiff {
    /// Sorted by holder address
    pub updates: Vec<BalanceUpdate>,
    pub summary: DiffSummary,
}

/// Balance targets that carry the previous epoch's holders into the current one.
///
/// Every previous holder appears exactly once: at their new balance, or at
/// zero if they left. Unchanged holders are included so their accrual moves
/// to the new epoch. New holders are counted but left out; they prove their
/// own stake.
pub fn compute_diff(previous: &[HolderBalance], current: &[HolderBalance]) -> ReconciliationDiff {
    let current_by_addr: BTreeMap<HolderAddress, Amount> =
        current.iter().map(|h| (h.address, h.balance)).collect();
    let previous_by_addr: BTreeMap<HolderAddress, Amount> =
        previous.iter().map(|h| (h.address, h.balance)).collect();

    let mut summary = DiffSummary::default();
    let mut updates = Vec::with_capacity(previous_by_addr.len());

    for (holder, old_balance) in &previous_by_addr {
        let new_balance = match current_by_addr.get(holder) {
            Some(&b) if b == *old_balance => {
                summary.unchanged += 1;
                b
            }
            Some(&b) => {
                summary.changed += 1;
                b
            }
            None => {
                summary.removed += 1;
                0
            }
        };
        updates.push(BalanceUpdate {
            holder: *holder,
            new_balance,
        });
    }

    summary.new_holders = current_by_addr
        .keys()
        .filter(|h| !previous_by_addr.contains_key(h))
        .count();

    ReconciliationDiff { updates, summary }
}
