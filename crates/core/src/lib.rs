//! ShareCraft Core Types
//!
//! Identifiers shared by the census, the reward contract model and the
//! pipeline: digests, holder addresses, pool/epoch indices and ledger amounts.

mod error;
mod types;

pub use error::*;
pub use types::*;
