//! Settlement types for on-ledger operations

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use sharecraft_core::{Amount, Digest, EpochId, HolderAddress, LedgerHeight, PoolId, PoolIndex};
use sharecraft_rewards::{
    BalanceUpdate, ContractError, MerkleRootData, PoolState, RootCommit, StakerInfo, UpdateOutcome,
};

/// Transaction hash (SHA-256 of the signed envelope)
pub type TxHash = [u8; 32];

/// One mutating contract entry point with its arguments.
///
/// The caller identity is the transaction signer, so it never appears here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Invocation {
    Initialize {
        reward_rate: Amount,
    },
    AddPool {
        pool_id: PoolId,
    },
    RemovePool {
        pool_index: PoolIndex,
    },
    SetRewardRate {
        rate: Amount,
    },
    SetAdmin {
        new_admin: HolderAddress,
    },
    Fund {
        amount: Amount,
    },
    CommitRoot {
        pool_index: PoolIndex,
        root: Digest,
        epoch_id: EpochId,
        snapshot_height: LedgerHeight,
    },
    ApplyBalanceUpdates {
        pool_index: PoolIndex,
        epoch_id: EpochId,
        updates: Vec<BalanceUpdate>,
    },
    Stake {
        pool_index: PoolIndex,
        lp_balance: Amount,
        epoch_id: EpochId,
        proof: Vec<Digest>,
    },
    Unstake {
        pool_index: PoolIndex,
    },
    Claim {
        pool_index: PoolIndex,
    },
}

impl Invocation {
    /// Entry point name, for log lines
    pub fn name(&self) -> &'static str {
        match self {
            Invocation::Initialize { .. } => "initialize",
            Invocation::AddPool { .. } => "add_pool",
            Invocation::RemovePool { .. } => "remove_pool",
            Invocation::SetRewardRate { .. } => "set_reward_rate",
            Invocation::SetAdmin { .. } => "set_admin",
            Invocation::Fund { .. } => "fund",
            Invocation::CommitRoot { .. } => "commit_root",
            Invocation::ApplyBalanceUpdates { .. } => "apply_balance_updates",
            Invocation::Stake { .. } => "stake",
            Invocation::Unstake { .. } => "unstake",
            Invocation::Claim { .. } => "claim",
        }
    }
}

/// Return value of a successful invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationResult {
    Unit,
    PoolAdded(PoolIndex),
    Funded(Amount),
    RootCommit(RootCommit),
    BalanceUpdates(Vec<UpdateOutcome>),
    Claimed(Amount),
}

/// Read-only accessor calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewCall {
    PoolState { pool_index: PoolIndex },
    StakerInfo { holder: HolderAddress, pool_index: PoolIndex },
    MerkleRoot { pool_index: PoolIndex },
    PendingReward { holder: HolderAddress, pool_index: PoolIndex },
    PoolCount,
    PoolId { pool_index: PoolIndex },
    RewardBalance,
    RewardRate,
    /// Last sequence number used by an account
    Sequence { account: [u8; 32] },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewResult {
    PoolState(PoolState),
    StakerInfo(Option<StakerInfo>),
    MerkleRoot(Option<MerkleRootData>),
    Amount(Amount),
    Count(u32),
    PoolId(PoolId),
    Sequence(u64),
}

/// Finality state of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// Not final yet (or not known to the node)
    Pending,
    Success(InvocationResult),
    Failed(ContractError),
}

/// An invocation signed by its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedInvocation {
    pub invocation: Invocation,
    /// ed25519 public key of the caller
    pub signer: [u8; 32],
    /// Per-account sequence number; must be exactly one past the last used
    pub nonce: u64,
    /// ed25519 signature over `signing_payload`
    pub signature: Vec<u8>,
}

/// Network identifier: SHA-256 of the network passphrase
pub fn network_id(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}

/// Bytes a caller signs: network id, nonce, then the bincode invocation.
pub fn signing_payload(network: &[u8; 32], nonce: u64, invocation: &Invocation) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);
    payload.extend_from_slice(network);
    payload.extend_from_slice(&nonce.to_be_bytes());
    // Serializing an in-memory enum of plain data cannot fail
    if let Ok(body) = bincode::serialize(invocation) {
        payload.extend_from_slice(&body);
    }
    payload
}

impl SignedInvocation {
    pub fn sign(key: &SigningKey, network: &[u8; 32], nonce: u64, invocation: Invocation) -> Self {
        let payload = signing_payload(network, nonce, &invocation);
        let signature = key.sign(&payload);
        Self {
            invocation,
            signer: key.verifying_key().to_bytes(),
            nonce,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Check the signature against `network`
    pub fn verify(&self, network: &[u8; 32]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signer) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        let payload = signing_payload(network, self.nonce, &self.invocation);
        key.verify(&payload, &signature).is_ok()
    }

    /// Hash identifying this exact envelope
    pub fn hash(&self, network: &[u8; 32]) -> TxHash {
        let mut hasher = Sha256::new();
        hasher.update(signing_payload(network, self.nonce, &self.invocation));
        hasher.update(self.signer);
        hasher.finalize().into()
    }

    /// The caller as a contract address
    pub fn caller(&self) -> HolderAddress {
        HolderAddress::Account(self.signer)
    }
}
