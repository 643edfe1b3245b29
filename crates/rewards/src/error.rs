use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a contract entry point rejects a call.
///
/// The numeric codes are part of the contract interface and must stay
/// stable; new variants are only ever appended.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ContractError {
    #[error("Contract already initialized")]
    AlreadyInitialized = 1,

    #[error("Contract not initialized")]
    NotInitialized = 2,

    #[error("Caller is not the admin")]
    Unauthorized = 3,

    #[error("Pool already registered")]
    PoolAlreadyExists = 4,

    #[error("Pool not found")]
    PoolNotFound = 5,

    #[error("Merkle proof does not match the committed root")]
    InvalidProof = 6,

    #[error("Stake already proven for the current epoch")]
    AlreadyStakedThisEpoch = 7,

    #[error("No stake found for holder")]
    NoStakeFound = 8,

    #[error("No rewards to claim")]
    NoRewardsToClaim = 9,

    #[error("Reward fund balance is insufficient")]
    InsufficientRewardBalance = 10,

    #[error("Invalid amount")]
    InvalidAmount = 11,

    #[error("No Merkle root committed for pool")]
    NoMerkleRoot = 12,

    #[error("Epoch is not the current or next epoch")]
    StaleEpoch = 13,

    #[error("Arithmetic overflow")]
    ArithmeticOverflow = 14,

    #[error("Pool is inactive")]
    PoolInactive = 15,

    #[error("Too many balance updates in one call")]
    BatchTooLarge = 16,
}

impl ContractError {
    /// Stable numeric code as surfaced by the ledger
    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use ContractError::*;
        let err = match code {
            1 => AlreadyInitialized,
            2 => NotInitialized,
            3 => Unauthorized,
            4 => PoolAlreadyExists,
            5 => PoolNotFound,
            6 => InvalidProof,
            7 => AlreadyStakedThisEpoch,
            8 => NoStakeFound,
            9 => NoRewardsToClaim,
            10 => InsufficientRewardBalance,
            11 => InvalidAmount,
            12 => NoMerkleRoot,
            13 => StaleEpoch,
            14 => ArithmeticOverflow,
            15 => PoolInactive,
            16 => BatchTooLarge,
            _ => return None,
        };
        Some(err)
    }
}

pub type Result<T> = std::result::Result<T, ContractError>;
