//! Ledger transport seam.
//!
//! A transport moves signed invocations to a ledger node and reports back.
//! `MockLedger` is the in-process implementation; a network RPC transport
//! implements the same trait.

use async_trait::async_trait;

use crate::types::{InvocationResult, SignedInvocation, TxHash, TxStatus, ViewCall, ViewResult};
use crate::Result;

#[async_trait]
pub trait LedgerTransport: Send + Sync {
    /// Dry-run against current state. A contract rejection here is definite
    /// and nothing was submitted.
    async fn simulate(&self, tx: &SignedInvocation) -> Result<InvocationResult>;

    /// Hand the transaction to the network. Once this returns `Ok` the
    /// transaction can no longer be cancelled.
    async fn submit(&self, tx: &SignedInvocation) -> Result<TxHash>;

    /// Finality status of a submitted transaction
    async fn poll(&self, hash: &TxHash) -> Result<TxStatus>;

    /// Read-only accessor
    async fn view(&self, call: ViewCall) -> Result<ViewResult>;
}
