//! ShareCraft Census
//!
//! Enumerates every holder of a pool-share asset and their balance at an
//! observable ledger height. A census is all or nothing: pagination is
//! exhausted and transient failures are retried, and if that is not
//! possible the census fails instead of returning a truncated holder list.
//!
//! The same Horizon client also discovers which pools hold a given asset.

mod discovery;
mod expert;
mod memory;

pub use discovery::{AssetRef, DiscoveredPool};
pub use expert::{ExpertCensus, ExpertConfig};
pub use memory::StaticCensus;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sharecraft_core::{Amount, CoreError, HolderAddress, LedgerHeight, PoolDescriptor, PoolIndex};

/// One holder's pool-share balance in base units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderBalance {
    pub address: HolderAddress,
    pub balance: Amount,
}

/// Complete holder set of one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusSnapshot {
    /// Ledger the census is at least as recent as
    pub ledger_height: LedgerHeight,
    pub holders: Vec<HolderBalance>,
}

#[derive(Error, Debug)]
pub enum CensusError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Gave up on {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Holder {0} listed twice")]
    DuplicateHolder(HolderAddress),

    #[error("Negative balance {balance} for {holder}")]
    NegativeBalance { holder: HolderAddress, balance: Amount },

    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] CoreError),

    #[error("Invalid asset {0}; expected native or CODE:ISSUER")]
    InvalidAsset(String),

    #[error("No census available for pool {0}")]
    UnknownPool(PoolIndex),
}

pub type Result<T> = std::result::Result<T, CensusError>;

/// Source of holder balances for a pool
#[async_trait]
pub trait Census: Send + Sync {
    async fn snapshot(&self, pool: &PoolDescriptor) -> Result<CensusSnapshot>;
}

/// Reject duplicates and negative balances; drop zero balances.
///
/// Zero-balance holders have nothing to prove and are left out of the tree.
pub fn validate_holders(holders: Vec<HolderBalance>) -> Result<Vec<HolderBalance>> {
    let mut seen = HashSet::with_capacity(holders.len());
    let mut kept = Vec::with_capacity(holders.len());
    for holder in holders {
        if !seen.insert(holder.address) {
            return Err(CensusError::DuplicateHolder(holder.address));
        }
        if holder.balance < 0 {
            return Err(CensusError::NegativeBalance {
                holder: holder.address,
                balance: holder.balance,
            });
        }
        if holder.balance > 0 {
            kept.push(holder);
        }
    }
    Ok(kept)
}
