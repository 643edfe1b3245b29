//! In-memory ledger hosting a `RewardContract`.
//!
//! Used by tests and by the CLI's local mode. Behaves like a ledger node
//! closely enough to exercise the submission discipline: signatures and
//! account sequences are checked, transactions are deduplicated by hash,
//! finality can be delayed or withheld, and submissions can be made to fail.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sharecraft_core::HolderAddress;
use sharecraft_rewards::{ContractError, RewardContract};

use crate::transport::LedgerTransport;
use crate::types::{
    network_id, Invocation, InvocationResult, SignedInvocation, TxHash, TxStatus, ViewCall,
    ViewResult,
};
use crate::{Result, SettlementError};

/// Passphrase of the mock network
pub const MOCK_NETWORK_PASSPHRASE: &str = "ShareCraft Mock Network";

/// Ledger close time used to derive a ledger height from the clock
const LEDGER_CLOSE_SECS: u64 = 5;

#[derive(Debug, Clone)]
struct TxRecord {
    status: TxStatus,
    /// Polls still answered with `Pending`
    polls_remaining: u32,
}

/// Persisted portion of the mock ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerState {
    network_passphrase: String,
    contract: RewardContract,
    now: u64,
    sequences: HashMap<[u8; 32], u64>,
}

#[derive(Debug, Default)]
struct MockState {
    ledger: LedgerState,
    txs: HashMap<TxHash, TxRecord>,
    /// Polls a new transaction stays pending for
    finality_polls: u32,
    /// Transactions are applied but never reported final
    withhold_finality: bool,
    /// Next N submissions fail before reaching the ledger
    failing_submits: u32,
    /// Next N submissions are accepted but never applied
    dropped_submits: u32,
}

pub struct MockLedger {
    network: [u8; 32],
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::on_network(MOCK_NETWORK_PASSPHRASE)
    }

    /// Empty ledger that only accepts transactions signed for `passphrase`
    pub fn on_network(passphrase: &str) -> Self {
        Self::from_state(LedgerState {
            network_passphrase: passphrase.to_string(),
            ..LedgerState::default()
        })
    }

    fn from_state(ledger: LedgerState) -> Self {
        Self {
            network: network_id(&ledger.network_passphrase),
            state: Mutex::new(MockState {
                ledger,
                ..MockState::default()
            }),
        }
    }

    pub fn network_passphrase(&self) -> String {
        self.state.lock().ledger.network_passphrase.clone()
    }

    // =========================================================================
    // Clock and fault injection
    // =========================================================================

    pub fn now(&self) -> u64 {
        self.state.lock().ledger.now
    }

    pub fn set_time(&self, now: u64) {
        self.state.lock().ledger.now = now;
    }

    pub fn advance_time(&self, secs: u64) -> u64 {
        let mut state = self.state.lock();
        state.ledger.now += secs;
        debug!("[MOCK] Clock advanced {}s to {}", secs, state.ledger.now);
        state.ledger.now
    }

    /// Ledger sequence implied by the clock
    pub fn ledger_height(&self) -> u32 {
        (self.now() / LEDGER_CLOSE_SECS) as u32
    }

    /// New transactions report `Pending` for `polls` polls before going final
    pub fn set_finality_polls(&self, polls: u32) {
        self.state.lock().finality_polls = polls;
    }

    /// Apply transactions but never report them final
    pub fn withhold_finality(&self, withhold: bool) {
        self.state.lock().withhold_finality = withhold;
    }

    /// Make the next `count` submissions fail with a transport error
    pub fn fail_next_submits(&self, count: u32) {
        self.state.lock().failing_submits = count;
    }

    /// Accept the next `count` submissions without ever applying them
    pub fn drop_next_submits(&self, count: u32) {
        self.state.lock().dropped_submits = count;
    }

    /// Snapshot of the hosted contract
    pub fn contract(&self) -> RewardContract {
        self.state.lock().ledger.contract.clone()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Save contract, clock and sequences (bincode, atomic rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = {
            let state = self.state.lock();
            bincode::serialize(&state.ledger)
                .map_err(|e| SettlementError::Serialization(e.to_string()))?
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        debug!("[MOCK] Ledger saved to {:?}", path);
        Ok(())
    }

    /// Load a saved ledger, or start an empty one on `passphrase` if `path`
    /// does not exist. A saved ledger of another network is refused.
    pub fn load_or_new(path: &Path, passphrase: &str) -> Result<Self> {
        if !path.exists() {
            info!("[MOCK] No ledger at {:?}, starting fresh on \"{}\"", path, passphrase);
            return Ok(Self::on_network(passphrase));
        }
        let bytes = std::fs::read(path)?;
        let ledger: LedgerState = bincode::deserialize(&bytes)
            .map_err(|e| SettlementError::Serialization(e.to_string()))?;
        if ledger.network_passphrase != passphrase {
            return Err(SettlementError::WrongNetwork {
                ledger: ledger.network_passphrase,
                configured: passphrase.to_string(),
            });
        }
        Ok(Self::from_state(ledger))
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(
        contract: &mut RewardContract,
        caller: &HolderAddress,
        invocation: &Invocation,
        now: u64,
    ) -> std::result::Result<InvocationResult, ContractError> {
        let result = match invocation.clone() {
            Invocation::Initialize { reward_rate } => {
                contract.initialize(*caller, reward_rate)?;
                InvocationResult::Unit
            }
            Invocation::AddPool { pool_id } => {
                InvocationResult::PoolAdded(contract.add_pool(caller, pool_id, now)?)
            }
            Invocation::RemovePool { pool_index } => {
                contract.remove_pool(caller, pool_index, now)?;
                InvocationResult::Unit
            }
            Invocation::SetRewardRate { rate } => {
                contract.set_reward_rate(caller, rate, now)?;
                InvocationResult::Unit
            }
            Invocation::SetAdmin { new_admin } => {
                contract.set_admin(caller, new_admin)?;
                InvocationResult::Unit
            }
            Invocation::Fund { amount } => InvocationResult::Funded(contract.fund(amount)?),
            Invocation::CommitRoot {
                pool_index,
                root,
                epoch_id,
                snapshot_height,
            } => InvocationResult::RootCommit(contract.commit_root(
                caller,
                pool_index,
                root,
                epoch_id,
                snapshot_height,
                now,
            )?),
            Invocation::ApplyBalanceUpdates {
                pool_index,
                epoch_id,
                updates,
            } => InvocationResult::BalanceUpdates(
                contract.apply_balance_updates(caller, pool_index, epoch_id, &updates, now)?,
            ),
            Invocation::Stake {
                pool_index,
                lp_balance,
                epoch_id,
                proof,
            } => {
                contract.stake(caller, pool_index, lp_balance, epoch_id, &proof, now)?;
                InvocationResult::Unit
            }
            Invocation::Unstake { pool_index } => {
                contract.unstake(caller, pool_index, now)?;
                InvocationResult::Unit
            }
            Invocation::Claim { pool_index } => {
                InvocationResult::Claimed(contract.claim(caller, pool_index, now)?)
            }
        };
        Ok(result)
    }

    fn check_envelope(&self, state: &MockState, tx: &SignedInvocation) -> Result<()> {
        if !tx.verify(&self.network) {
            return Err(SettlementError::BadSignature);
        }
        let expected = state.ledger.sequences.get(&tx.signer).copied().unwrap_or(0) + 1;
        if tx.nonce != expected {
            return Err(SettlementError::BadSequence {
                expected,
                got: tx.nonce,
            });
        }
        Ok(())
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerTransport for MockLedger {
    async fn simulate(&self, tx: &SignedInvocation) -> Result<InvocationResult> {
        let state = self.state.lock();
        self.check_envelope(&state, tx)?;
        let mut scratch = state.ledger.contract.clone();
        Self::execute(&mut scratch, &tx.caller(), &tx.invocation, state.ledger.now).map_err(
            |error| SettlementError::Rejected {
                entry_point: tx.invocation.name(),
                error,
            },
        )
    }

    async fn submit(&self, tx: &SignedInvocation) -> Result<TxHash> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let hash = tx.hash(&self.network);

        if state.txs.contains_key(&hash) {
            debug!("[MOCK] Duplicate submission of {}", hex::encode(&hash[..8]));
            return Ok(hash);
        }
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            warn!("[MOCK] Injected submit failure for {}", tx.invocation.name());
            return Err(SettlementError::Transport("injected submit failure".to_string()));
        }
        self.check_envelope(state, tx)?;
        if state.dropped_submits > 0 {
            state.dropped_submits -= 1;
            warn!("[MOCK] Dropping {} {}", tx.invocation.name(), hex::encode(&hash[..8]));
            return Ok(hash);
        }

        state.ledger.sequences.insert(tx.signer, tx.nonce);

        // Failed transactions roll back: run against a copy, keep it on success
        let mut contract = state.ledger.contract.clone();
        let status = match Self::execute(&mut contract, &tx.caller(), &tx.invocation, state.ledger.now) {
            Ok(result) => {
                state.ledger.contract = contract;
                TxStatus::Success(result)
            }
            Err(error) => TxStatus::Failed(error),
        };
        info!(
            "[MOCK] {} by {} at t={}: {:?}",
            tx.invocation.name(),
            tx.caller().short(),
            state.ledger.now,
            status
        );

        let polls_remaining = if state.withhold_finality {
            u32::MAX
        } else {
            state.finality_polls
        };
        state.txs.insert(hash, TxRecord { status, polls_remaining });
        Ok(hash)
    }

    async fn poll(&self, hash: &TxHash) -> Result<TxStatus> {
        let mut state = self.state.lock();
        let Some(record) = state.txs.get_mut(hash) else {
            return Ok(TxStatus::Pending);
        };
        if record.polls_remaining > 0 {
            if record.polls_remaining != u32::MAX {
                record.polls_remaining -= 1;
            }
            return Ok(TxStatus::Pending);
        }
        Ok(record.status.clone())
    }

    async fn view(&self, call: ViewCall) -> Result<ViewResult> {
        let state = self.state.lock();
        let contract = &state.ledger.contract;
        let rejected = |error| SettlementError::Rejected {
            entry_point: "view",
            error,
        };
        let result = match call {
            ViewCall::PoolState { pool_index } => {
                ViewResult::PoolState(contract.pool_state(pool_index).map_err(rejected)?)
            }
            ViewCall::StakerInfo { holder, pool_index } => {
                ViewResult::StakerInfo(contract.staker_info(&holder, pool_index))
            }
            ViewCall::MerkleRoot { pool_index } => {
                ViewResult::MerkleRoot(contract.merkle_root(pool_index).map_err(rejected)?)
            }
            ViewCall::PendingReward { holder, pool_index } => ViewResult::Amount(
                contract
                    .pending_reward(&holder, pool_index, state.ledger.now)
                    .map_err(rejected)?,
            ),
            ViewCall::PoolCount => ViewResult::Count(contract.pool_count()),
            ViewCall::PoolId { pool_index } => {
                ViewResult::PoolId(contract.pool_id(pool_index).map_err(rejected)?)
            }
            ViewCall::RewardBalance => ViewResult::Amount(contract.reward_balance()),
            ViewCall::RewardRate => ViewResult::Amount(contract.reward_rate()),
            ViewCall::Sequence { account } => {
                ViewResult::Sequence(state.ledger.sequences.get(&account).copied().unwrap_or(0))
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn admin_key() -> SigningKey {
        SigningKey::from_bytes(&[1u8; 32])
    }

    fn signed(ledger: &MockLedger, key: &SigningKey, nonce: u64, invocation: Invocation) -> SignedInvocation {
        SignedInvocation::sign(key, &ledger.network, nonce, invocation)
    }

    #[tokio::test]
    async fn test_submit_applies_and_polls_final() {
        let ledger = MockLedger::new();
        let tx = signed(&ledger, &admin_key(), 1, Invocation::Initialize { reward_rate: 5 });
        let hash = ledger.submit(&tx).await.unwrap();
        assert_eq!(ledger.poll(&hash).await.unwrap(), TxStatus::Success(InvocationResult::Unit));
        assert_eq!(ledger.contract().reward_rate(), 5);
    }

    #[tokio::test]
    async fn test_bad_signature_and_sequence() {
        let ledger = MockLedger::new();
        let mut tx = signed(&ledger, &admin_key(), 1, Invocation::Initialize { reward_rate: 5 });
        tx.signature[0] ^= 0xFF;
        assert!(matches!(ledger.submit(&tx).await, Err(SettlementError::BadSignature)));

        let tx = signed(&ledger, &admin_key(), 2, Invocation::Initialize { reward_rate: 5 });
        assert!(matches!(
            ledger.submit(&tx).await,
            Err(SettlementError::BadSequence { expected: 1, got: 2 })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_submission_not_reapplied() {
        let ledger = MockLedger::new();
        let key = admin_key();
        ledger
            .submit(&signed(&ledger, &key, 1, Invocation::Initialize { reward_rate: 5 }))
            .await
            .unwrap();

        let fund = signed(&ledger, &key, 2, Invocation::Fund { amount: 100 });
        let first = ledger.submit(&fund).await.unwrap();
        let second = ledger.submit(&fund).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.contract().reward_balance(), 100);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back_but_consumes_sequence() {
        let ledger = MockLedger::new();
        let key = admin_key();
        ledger
            .submit(&signed(&ledger, &key, 1, Invocation::Initialize { reward_rate: 5 }))
            .await
            .unwrap();

        let bad = signed(&ledger, &key, 2, Invocation::Fund { amount: -1 });
        let hash = ledger.submit(&bad).await.unwrap();
        assert_eq!(
            ledger.poll(&hash).await.unwrap(),
            TxStatus::Failed(ContractError::InvalidAmount)
        );
        assert_eq!(
            ledger.view(ViewCall::Sequence { account: bad.signer }).await.unwrap(),
            ViewResult::Sequence(2)
        );
    }

    #[tokio::test]
    async fn test_simulate_does_not_mutate() {
        let ledger = MockLedger::new();
        let tx = signed(&ledger, &admin_key(), 1, Invocation::Initialize { reward_rate: 5 });
        assert_eq!(ledger.simulate(&tx).await.unwrap(), InvocationResult::Unit);
        assert!(ledger.contract().admin().is_none());

        let not_admin = signed(&ledger, &admin_key(), 1, Invocation::AddPool { pool_id: [1; 32] });
        let err = ledger.simulate(&not_admin).await.unwrap_err();
        assert_eq!(err.contract_error(), Some(ContractError::NotInitialized));
    }

    #[tokio::test]
    async fn test_finality_delay() {
        let ledger = MockLedger::new();
        ledger.set_finality_polls(2);
        let tx = signed(&ledger, &admin_key(), 1, Invocation::Initialize { reward_rate: 5 });
        let hash = ledger.submit(&tx).await.unwrap();
        assert_eq!(ledger.poll(&hash).await.unwrap(), TxStatus::Pending);
        assert_eq!(ledger.poll(&hash).await.unwrap(), TxStatus::Pending);
        assert_eq!(ledger.poll(&hash).await.unwrap(), TxStatus::Success(InvocationResult::Unit));
    }

    #[tokio::test]
    async fn test_injected_and_dropped_submits() {
        let ledger = MockLedger::new();
        ledger.fail_next_submits(1);
        ledger.drop_next_submits(1);
        let tx = signed(&ledger, &admin_key(), 1, Invocation::Initialize { reward_rate: 5 });

        assert!(matches!(ledger.submit(&tx).await, Err(SettlementError::Transport(_))));
        let hash = ledger.submit(&tx).await.unwrap();
        assert_eq!(ledger.poll(&hash).await.unwrap(), TxStatus::Pending);
        assert!(ledger.contract().admin().is_none());

        // The dropped envelope was never recorded, so it can be sent again
        let hash = ledger.submit(&tx).await.unwrap();
        assert_eq!(ledger.poll(&hash).await.unwrap(), TxStatus::Success(InvocationResult::Unit));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.bin");

        let ledger = MockLedger::new();
        ledger.set_time(1234);
        ledger
            .submit(&signed(&ledger, &admin_key(), 1, Invocation::Initialize { reward_rate: 9 }))
            .await
            .unwrap();
        ledger.save(&path).unwrap();

        let restored = MockLedger::load_or_new(&path, MOCK_NETWORK_PASSPHRASE).unwrap();
        assert_eq!(restored.now(), 1234);
        assert_eq!(restored.contract().reward_rate(), 9);
        assert_eq!(
            restored
                .view(ViewCall::Sequence { account: admin_key().verifying_key().to_bytes() })
                .await
                .unwrap(),
            ViewResult::Sequence(1)
        );

        let fresh = MockLedger::load_or_new(&dir.path().join("missing.bin"), "Other Net").unwrap();
        assert_eq!(fresh.now(), 0);
        assert_eq!(fresh.network_passphrase(), "Other Net");
    }

    #[tokio::test]
    async fn test_saved_ledger_keeps_its_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.bin");
        let ledger = MockLedger::on_network("Site Net");
        ledger.save(&path).unwrap();

        assert!(matches!(
            MockLedger::load_or_new(&path, MOCK_NETWORK_PASSPHRASE),
            Err(SettlementError::WrongNetwork { .. })
        ));

        // Signatures for another network do not verify here
        let restored = MockLedger::load_or_new(&path, "Site Net").unwrap();
        let foreign = SignedInvocation::sign(
            &admin_key(),
            &network_id(MOCK_NETWORK_PASSPHRASE),
            1,
            Invocation::Initialize { reward_rate: 5 },
        );
        assert!(matches!(restored.submit(&foreign).await, Err(SettlementError::BadSignature)));
        let native = signed(&restored, &admin_key(), 1, Invocation::Initialize { reward_rate: 5 });
        restored.submit(&native).await.unwrap();
    }

    #[test]
    fn test_ledger_height_follows_clock() {
        let ledger = MockLedger::new();
        ledger.set_time(100);
        assert_eq!(ledger.ledger_height(), 20);
        ledger.advance_time(10);
        assert_eq!(ledger.ledger_height(), 22);
    }
}
