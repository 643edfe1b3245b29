//! In-memory census for tests and dry runs

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use sharecraft_core::{PoolDescriptor, PoolIndex};

use crate::{validate_holders, Census, CensusError, CensusSnapshot, Result};

/// Serves whatever snapshot was last set for a pool
#[derive(Default)]
pub struct StaticCensus {
    snapshots: RwLock<HashMap<PoolIndex, CensusSnapshot>>,
}

impl StaticCensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pool_index: PoolIndex, snapshot: CensusSnapshot) {
        self.snapshots.write().insert(pool_index, snapshot);
    }

    /// Subsequent snapshots of this pool fail with `UnknownPool`
    pub fn clear(&self, pool_index: PoolIndex) {
        self.snapshots.write().remove(&pool_index);
    }
}

#[async_trait]
impl Census for StaticCensus {
    async fn snapshot(&self, pool: &PoolDescriptor) -> Result<CensusSnapshot> {
        let snapshot = self
            .snapshots
            .read()
            .get(&pool.index)
            .cloned()
            .ok_or(CensusError::UnknownPool(pool.index))?;
        let holders = validate_holders(snapshot.holders)?;
        debug!("Static census for {}: {} holders", pool.name(), holders.len());
        Ok(CensusSnapshot {
            ledger_height: snapshot.ledger_height,
            holders,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HolderBalance;
    use sharecraft_core::HolderAddress;

    fn pool(index: PoolIndex) -> PoolDescriptor {
        PoolDescriptor {
            index,
            pool_id: "00".repeat(32),
            label: String::new(),
        }
    }

    #[tokio::test]
    async fn test_static_census_serves_and_validates() {
        let census = StaticCensus::new();
        census.set(
            0,
            CensusSnapshot {
                ledger_height: 77,
                holders: vec![
                    HolderBalance { address: HolderAddress::Account([1; 32]), balance: 10 },
                    HolderBalance { address: HolderAddress::Account([2; 32]), balance: 0 },
                ],
            },
        );
        let snap = census.snapshot(&pool(0)).await.unwrap();
        assert_eq!(snap.ledger_height, 77);
        assert_eq!(snap.holders.len(), 1);

        assert!(matches!(census.snapshot(&pool(1)).await, Err(CensusError::UnknownPool(1))));
        census.clear(0);
        assert!(census.snapshot(&pool(0)).await.is_err());
    }
}
