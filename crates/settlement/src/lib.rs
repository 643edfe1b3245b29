//! ShareCraft Settlement
//!
//! Typed client for the reward contract. There is one method per contract
//! entry point and no runtime method discovery.
//!
//! ## Submission discipline
//!
//! Every mutating call is a discrete request/await unit:
//!
//! 1. **Sign**: ed25519 over network id, account sequence and the bincode
//!    encoded invocation.
//! 2. **Simulate**: a contract rejection here is definite; nothing was sent.
//! 3. **Submit**: from here on the transaction cannot be cancelled.
//! 4. **Poll**: until final or the submit timeout elapses. A timeout is
//!    `UnknownOutcome`, never a failure: callers must re-read ledger state
//!    before retrying.

mod client;
mod mock;
mod transport;
mod types;

pub use client::{SettlementClient, SettlementConfig};
pub use mock::{MockLedger, MOCK_NETWORK_PASSPHRASE};
pub use transport::LedgerTransport;
pub use types::*;

use sharecraft_rewards::ContractError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Contract rejected {entry_point}: {error} (code {})", .error.code())]
    Rejected {
        entry_point: &'static str,
        error: ContractError,
    },

    #[error("Outcome of transaction {tx_hash} unknown after timeout; re-query ledger state before retrying")]
    UnknownOutcome { tx_hash: String },

    #[error("Invalid transaction signature")]
    BadSignature,

    #[error("Bad sequence number: expected {expected}, got {got}")]
    BadSequence { expected: u64, got: u64 },

    #[error("Ledger is on network \"{ledger}\" but settings name \"{configured}\"")]
    WrongNetwork { ledger: String, configured: String },

    #[error("Unexpected result from {0}")]
    UnexpectedResult(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SettlementError {
    /// The contract's own rejection reason, if that is what this is
    pub fn contract_error(&self) -> Option<ContractError> {
        match self {
            SettlementError::Rejected { error, .. } => Some(*error),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
