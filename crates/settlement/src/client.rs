//! Settlement client for the reward contract
//!
//! Wraps a `LedgerTransport` with a signing key and the submission
//! discipline: sign, simulate, submit, then poll with a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sharecraft_core::{Amount, Digest, EpochId, HolderAddress, LedgerHeight, PoolId, PoolIndex};
use sharecraft_rewards::{BalanceUpdate, MerkleRootData, PoolState, RootCommit, StakerInfo, UpdateOutcome};

use crate::transport::LedgerTransport;
use crate::types::{
    network_id, Invocation, InvocationResult, SignedInvocation, TxStatus, ViewCall, ViewResult,
};
use crate::{Result, SettlementError, MOCK_NETWORK_PASSPHRASE};

/// Settlement client configuration
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Passphrase of the target network; signatures are bound to it
    pub network_passphrase: String,
    /// Delay between finality polls
    pub poll_interval: Duration,
    /// Give up polling (with `UnknownOutcome`) after this long
    pub submit_timeout: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            network_passphrase: "Test SDF Network ; September 2015".to_string(),
            poll_interval: Duration::from_secs(1),
            submit_timeout: Duration::from_secs(30),
        }
    }
}

impl SettlementConfig {
    /// Configuration for the in-memory mock ledger
    pub fn mock() -> Self {
        Self {
            network_passphrase: MOCK_NETWORK_PASSPHRASE.to_string(),
            poll_interval: Duration::from_millis(5),
            submit_timeout: Duration::from_millis(500),
        }
    }
}

/// Typed client: one method per contract entry point.
pub struct SettlementClient {
    config: SettlementConfig,
    network: [u8; 32],
    transport: Arc<dyn LedgerTransport>,
    signing_key: SigningKey,
    /// One transaction in flight per account; sequence numbers are consumed in order
    submit_lock: tokio::sync::Mutex<()>,
}

impl SettlementClient {
    pub fn new(config: SettlementConfig, transport: Arc<dyn LedgerTransport>, signing_key: SigningKey) -> Self {
        Self {
            network: network_id(&config.network_passphrase),
            config,
            transport,
            signing_key,
            submit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The signer as a contract address
    pub fn address(&self) -> HolderAddress {
        HolderAddress::Account(self.signing_key.verifying_key().to_bytes())
    }

    // ==================== Submission ====================

    /// Run one invocation through sign, simulate, submit and poll.
    async fn invoke(&self, invocation: Invocation) -> Result<InvocationResult> {
        let entry_point = invocation.name();
        let _guard = self.submit_lock.lock().await;

        // 1. Sign with the next account sequence
        let nonce = self.next_sequence().await?;
        let tx = SignedInvocation::sign(&self.signing_key, &self.network, nonce, invocation);

        // 2. Simulate: a rejection here is definite and nothing was sent
        let simulated = self.transport.simulate(&tx).await?;
        debug!("{} simulated: {:?}", entry_point, simulated);

        // 3. Submit: no cancellation past this point
        let hash = self.transport.submit(&tx).await?;
        debug!("{} submitted as {}", entry_point, hex::encode(&hash[..8]));

        // 4. Poll until final or timed out
        let deadline = Instant::now() + self.config.submit_timeout;
        loop {
            match self.transport.poll(&hash).await {
                Ok(TxStatus::Success(result)) => {
                    info!("{} confirmed: {}", entry_point, hex::encode(&hash[..8]));
                    return Ok(result);
                }
                Ok(TxStatus::Failed(error)) => {
                    warn!("{} failed on ledger: {}", entry_point, error);
                    return Err(SettlementError::Rejected { entry_point, error });
                }
                Ok(TxStatus::Pending) => {}
                Err(e) => debug!("Poll for {} failed, retrying: {}", hex::encode(&hash[..8]), e),
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} not final after {:?}: outcome unknown",
                    entry_point, self.config.submit_timeout
                );
                return Err(SettlementError::UnknownOutcome {
                    tx_hash: hex::encode(hash),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn next_sequence(&self) -> Result<u64> {
        let account = self.signing_key.verifying_key().to_bytes();
        match self.transport.view(ViewCall::Sequence { account }).await? {
            ViewResult::Sequence(seq) => Ok(seq + 1),
            _ => Err(SettlementError::UnexpectedResult("sequence")),
        }
    }

    // ==================== Admin ====================

    pub async fn initialize(&self, reward_rate: Amount) -> Result<()> {
        self.invoke(Invocation::Initialize { reward_rate }).await?;
        Ok(())
    }

    pub async fn add_pool(&self, pool_id: PoolId) -> Result<PoolIndex> {
        match self.invoke(Invocation::AddPool { pool_id }).await? {
            InvocationResult::PoolAdded(index) => Ok(index),
            _ => Err(SettlementError::UnexpectedResult("add_pool")),
        }
    }

    pub async fn remove_pool(&self, pool_index: PoolIndex) -> Result<()> {
        self.invoke(Invocation::RemovePool { pool_index }).await?;
        Ok(())
    }

    pub async fn set_reward_rate(&self, rate: Amount) -> Result<()> {
        self.invoke(Invocation::SetRewardRate { rate }).await?;
        Ok(())
    }

    pub async fn set_admin(&self, new_admin: HolderAddress) -> Result<()> {
        self.invoke(Invocation::SetAdmin { new_admin }).await?;
        Ok(())
    }

    /// Returns the fund balance after the transfer
    pub async fn fund(&self, amount: Amount) -> Result<Amount> {
        match self.invoke(Invocation::Fund { amount }).await? {
            InvocationResult::Funded(balance) => Ok(balance),
            _ => Err(SettlementError::UnexpectedResult("fund")),
        }
    }

    /// Commit the root for `epoch_id`. Safe to repeat for the same root.
    pub async fn submit_root(
        &self,
        pool_index: PoolIndex,
        root: Digest,
        epoch_id: EpochId,
        snapshot_height: LedgerHeight,
    ) -> Result<RootCommit> {
        info!(
            "Submitting root {} for pool {} epoch {} (height {})",
            root.short(),
            pool_index,
            epoch_id,
            snapshot_height
        );
        match self
            .invoke(Invocation::CommitRoot {
                pool_index,
                root,
                epoch_id,
                snapshot_height,
            })
            .await?
        {
            InvocationResult::RootCommit(outcome) => Ok(outcome),
            _ => Err(SettlementError::UnexpectedResult("commit_root")),
        }
    }

    /// One reconciliation batch; the caller sizes batches.
    pub async fn submit_balance_updates(
        &self,
        pool_index: PoolIndex,
        epoch_id: EpochId,
        updates: Vec<BalanceUpdate>,
    ) -> Result<Vec<UpdateOutcome>> {
        match self
            .invoke(Invocation::ApplyBalanceUpdates {
                pool_index,
                epoch_id,
                updates,
            })
            .await?
        {
            InvocationResult::BalanceUpdates(outcomes) => Ok(outcomes),
            _ => Err(SettlementError::UnexpectedResult("apply_balance_updates")),
        }
    }

    // ==================== Holder ====================

    pub async fn stake(
        &self,
        pool_index: PoolIndex,
        lp_balance: Amount,
        epoch_id: EpochId,
        proof: Vec<Digest>,
    ) -> Result<()> {
        self.invoke(Invocation::Stake {
            pool_index,
            lp_balance,
            epoch_id,
            proof,
        })
        .await?;
        Ok(())
    }

    pub async fn unstake(&self, pool_index: PoolIndex) -> Result<()> {
        self.invoke(Invocation::Unstake { pool_index }).await?;
        Ok(())
    }

    /// Returns the amount paid out
    pub async fn claim(&self, pool_index: PoolIndex) -> Result<Amount> {
        match self.invoke(Invocation::Claim { pool_index }).await? {
            InvocationResult::Claimed(amount) => Ok(amount),
            _ => Err(SettlementError::UnexpectedResult("claim")),
        }
    }

    // ==================== Views ====================

    pub async fn pool_state(&self, pool_index: PoolIndex) -> Result<PoolState> {
        match self.transport.view(ViewCall::PoolState { pool_index }).await? {
            ViewResult::PoolState(state) => Ok(state),
            _ => Err(SettlementError::UnexpectedResult("pool_state")),
        }
    }

    pub async fn staker_info(&self, holder: HolderAddress, pool_index: PoolIndex) -> Result<Option<StakerInfo>> {
        match self.transport.view(ViewCall::StakerInfo { holder, pool_index }).await? {
            ViewResult::StakerInfo(info) => Ok(info),
            _ => Err(SettlementError::UnexpectedResult("staker_info")),
        }
    }

    /// Currently committed `(epoch_id, root)` data, if any
    pub async fn committed_root(&self, pool_index: PoolIndex) -> Result<Option<MerkleRootData>> {
        match self.transport.view(ViewCall::MerkleRoot { pool_index }).await? {
            ViewResult::MerkleRoot(root) => Ok(root),
            _ => Err(SettlementError::UnexpectedResult("merkle_root")),
        }
    }

    pub async fn pending_reward(&self, holder: HolderAddress, pool_index: PoolIndex) -> Result<Amount> {
        match self.transport.view(ViewCall::PendingReward { holder, pool_index }).await? {
            ViewResult::Amount(amount) => Ok(amount),
            _ => Err(SettlementError::UnexpectedResult("pending_reward")),
        }
    }

    pub async fn reward_balance(&self) -> Result<Amount> {
        match self.transport.view(ViewCall::RewardBalance).await? {
            ViewResult::Amount(amount) => Ok(amount),
            _ => Err(SettlementError::UnexpectedResult("reward_balance")),
        }
    }

    pub async fn reward_rate(&self) -> Result<Amount> {
        match self.transport.view(ViewCall::RewardRate).await? {
            ViewResult::Amount(amount) => Ok(amount),
            _ => Err(SettlementError::UnexpectedResult("reward_rate")),
        }
    }

    pub async fn pool_count(&self) -> Result<u32> {
        match self.transport.view(ViewCall::PoolCount).await? {
            ViewResult::Count(count) => Ok(count),
            _ => Err(SettlementError::UnexpectedResult("pool_count")),
        }
    }

    pub async fn pool_id(&self, pool_index: PoolIndex) -> Result<PoolId> {
        match self.transport.view(ViewCall::PoolId { pool_index }).await? {
            ViewResult::PoolId(id) => Ok(id),
            _ => Err(SettlementError::UnexpectedResult("pool_id")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockLedger;
    use sharecraft_merkle::{leaf_for, MerkleTree};
    use sharecraft_rewards::ContractError;

    fn admin_key() -> SigningKey {
        SigningKey::from_bytes(&[1u8; 32])
    }

    fn holder_key() -> SigningKey {
        SigningKey::from_bytes(&[2u8; 32])
    }

    async fn setup() -> (Arc<MockLedger>, SettlementClient) {
        let ledger = Arc::new(MockLedger::new());
        let admin = SettlementClient::new(SettlementConfig::mock(), ledger.clone(), admin_key());
        admin.initialize(10).await.unwrap();
        assert_eq!(admin.add_pool([0x11; 32]).await.unwrap(), 0);
        admin.fund(1_000_000).await.unwrap();
        (ledger, admin)
    }

    #[tokio::test]
    async fn test_admin_flow() {
        let (_ledger, admin) = setup().await;
        assert_eq!(admin.pool_count().await.unwrap(), 1);
        assert_eq!(admin.pool_id(0).await.unwrap(), [0x11; 32]);
        assert_eq!(admin.reward_balance().await.unwrap(), 1_000_000);
        assert_eq!(admin.reward_rate().await.unwrap(), 10);
        assert!(admin.committed_root(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_root_idempotent() {
        let (_ledger, admin) = setup().await;
        let root = Digest([9; 32]);
        assert_eq!(admin.submit_root(0, root, 1, 100).await.unwrap(), RootCommit::Committed);
        assert_eq!(admin.submit_root(0, root, 1, 100).await.unwrap(), RootCommit::AlreadyCommitted);

        let committed = admin.committed_root(0).await.unwrap().unwrap();
        assert_eq!(committed.epoch_id, 1);
        assert_eq!(committed.root, root);
    }

    #[tokio::test]
    async fn test_rejection_is_definite() {
        let (_ledger, admin) = setup().await;
        let err = admin.submit_root(0, Digest([9; 32]), 5, 100).await.unwrap_err();
        assert_eq!(err.contract_error(), Some(ContractError::StaleEpoch));
        // Simulation caught it; the sequence was not consumed
        admin.submit_root(0, Digest([9; 32]), 1, 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_holder_stake_and_claim() {
        let (ledger, admin) = setup().await;
        let holder = SettlementClient::new(SettlementConfig::mock(), ledger.clone(), holder_key());

        let leaf = leaf_for(0, &holder.address(), 500, 1);
        let tree = MerkleTree::build(&[leaf]).unwrap();
        admin.submit_root(0, tree.root(), 1, 100).await.unwrap();
        holder.stake(0, 500, 1, vec![]).await.unwrap();

        ledger.advance_time(100);
        assert_eq!(holder.pending_reward(holder.address(), 0).await.unwrap(), 1000);
        assert_eq!(holder.claim(0).await.unwrap(), 1000);

        let info = holder.staker_info(holder.address(), 0).await.unwrap().unwrap();
        assert_eq!(info.staked_amount, 500);
        assert_eq!(info.pending_rewards, 0);

        holder.unstake(0).await.unwrap();
        assert_eq!(admin.pool_state(0).await.unwrap().total_staked, 0);
    }

    #[tokio::test]
    async fn test_balance_updates_through_client() {
        let (ledger, admin) = setup().await;
        let holder = SettlementClient::new(SettlementConfig::mock(), ledger.clone(), holder_key());
        let leaf = leaf_for(0, &holder.address(), 500, 1);
        admin.submit_root(0, leaf, 1, 100).await.unwrap();
        holder.stake(0, 500, 1, vec![]).await.unwrap();

        let outcomes = admin
            .submit_balance_updates(
                0,
                1,
                vec![
                    BalanceUpdate { holder: holder.address(), new_balance: 700 },
                    BalanceUpdate { holder: HolderAddress::Account([9; 32]), new_balance: 1 },
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcomes, vec![UpdateOutcome::Applied, UpdateOutcome::Skipped]);
        assert_eq!(admin.pool_state(0).await.unwrap().total_staked, 700);
    }

    #[tokio::test]
    async fn test_wrong_network_passphrase_rejected() {
        let (ledger, admin) = setup().await;
        let config = SettlementConfig {
            network_passphrase: "Test SDF Network ; September 2015".to_string(),
            ..SettlementConfig::mock()
        };
        let stray = SettlementClient::new(config, ledger.clone(), admin_key());
        assert!(matches!(stray.fund(5).await, Err(SettlementError::BadSignature)));
        assert_eq!(admin.reward_balance().await.unwrap(), 1_000_000);
    }

    #[tokio::test]
    async fn test_slow_finality_within_timeout() {
        let (ledger, admin) = setup().await;
        ledger.set_finality_polls(3);
        assert_eq!(admin.fund(5).await.unwrap(), 1_000_005);
    }

    #[tokio::test]
    async fn test_timeout_reports_unknown_outcome() {
        let (ledger, admin) = setup().await;
        ledger.withhold_finality(true);

        let err = admin.submit_root(0, Digest([9; 32]), 1, 100).await.unwrap_err();
        assert!(matches!(err, SettlementError::UnknownOutcome { .. }));

        // It did land: re-querying shows the root committed
        ledger.withhold_finality(false);
        let committed = admin.committed_root(0).await.unwrap().unwrap();
        assert_eq!(committed.epoch_id, 1);
    }

    #[tokio::test]
    async fn test_submit_transport_failure_surfaces() {
        let (ledger, admin) = setup().await;
        ledger.fail_next_submits(1);
        assert!(matches!(admin.fund(5).await.unwrap_err(), SettlementError::Transport(_)));
        assert_eq!(admin.fund(5).await.unwrap(), 1_000_005);
    }
}
