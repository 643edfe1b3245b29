//! Epoch pipeline integration tests
//!
//! Drives the full flow against the mock ledger and an on-disk store:
//! 1. Census → tree → root commit → proof bundles on disk
//! 2. Holders stake with their bundles and accrue
//! 3. Next epoch reconciles existing stakers without new proofs
//! 4. A stale staker's rewards freeze at the epoch close
//! 5. Several pools in one pass

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tempfile::TempDir;

use sharecraft_aggregator::{
    DiffSummary, FileStore, HistoryEvent, HistoryLog, ManifestStore, PipelineConfig, ProofStore,
    SnapshotPipeline,
};
use sharecraft_census::{CensusSnapshot, HolderBalance, StaticCensus};
use sharecraft_core::{Amount, Digest, HolderAddress, PoolDescriptor, PoolIndex};
use sharecraft_merkle::{leaf_for, verify};
use sharecraft_rewards::ContractError;
use sharecraft_settlement::{MockLedger, SettlementClient, SettlementConfig};

const ADMIN: u8 = 1;
const ALICE: u8 = 10;
const BOB: u8 = 11;
const CAROL: u8 = 12;
const DAVE: u8 = 13;

fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

fn address_of(seed: u8) -> HolderAddress {
    HolderAddress::Account(key(seed).verifying_key().to_bytes())
}

fn client(ledger: &Arc<MockLedger>, seed: u8) -> SettlementClient {
    SettlementClient::new(SettlementConfig::mock(), ledger.clone(), key(seed))
}

fn descriptor(index: PoolIndex, fill: char) -> PoolDescriptor {
    PoolDescriptor {
        index,
        pool_id: fill.to_string().repeat(64),
        label: format!("pool {}", index),
    }
}

fn snapshot(height: u32, balances: &[(u8, Amount)]) -> CensusSnapshot {
    CensusSnapshot {
        ledger_height: height,
        holders: balances
            .iter()
            .map(|(seed, balance)| HolderBalance {
                address: address_of(*seed),
                balance: *balance,
            })
            .collect(),
    }
}

fn config(data_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        batch_size: 2,
        max_batch_retries: 1,
        retry_backoff: Duration::from_millis(1),
        max_root_submissions: 3,
        history_path: Some(data_dir.join("history.jsonl")),
    }
}

struct Deployment {
    ledger: Arc<MockLedger>,
    admin: Arc<SettlementClient>,
    census: Arc<StaticCensus>,
    store: Arc<FileStore>,
    pipeline: SnapshotPipeline,
}

/// Reward rate 10 per second, starting at t=1000
async fn deploy(data_dir: &Path, pools: Vec<PoolDescriptor>) -> Deployment {
    let ledger = Arc::new(MockLedger::new());
    ledger.set_time(1_000);

    let admin = Arc::new(client(&ledger, ADMIN));
    admin.initialize(10).await.unwrap();
    admin.fund(1_000_000_000).await.unwrap();
    for pool in &pools {
        let index = admin.add_pool(pool.pool_id_bytes().unwrap()).await.unwrap();
        assert_eq!(index, pool.index);
    }

    let census = Arc::new(StaticCensus::new());
    let store = Arc::new(FileStore::new(data_dir));
    let pipeline = SnapshotPipeline::new(
        config(data_dir),
        pools,
        census.clone(),
        admin.clone(),
        store.clone(),
    );
    Deployment {
        ledger,
        admin,
        census,
        store,
        pipeline,
    }
}

async fn stake_from_bundle(d: &Deployment, pool_index: PoolIndex, seed: u8) {
    let bundle = d.store.bundle(pool_index, &address_of(seed)).unwrap().unwrap();
    client(&d.ledger, seed)
        .stake(pool_index, bundle.balance, bundle.epoch_id, bundle.proof)
        .await
        .unwrap();
}

// ============================================================================
// Full lifecycle
// ============================================================================

#[tokio::test]
async fn test_two_epochs_with_claims_and_stale_freeze() {
    let dir = TempDir::new().unwrap();
    let pool = descriptor(0, 'a');
    let d = deploy(dir.path(), vec![pool.clone()]).await;

    // Epoch 1: Carol holds nothing and gets no leaf
    d.census.set(0, snapshot(500, &[(ALICE, 100), (BOB, 50), (CAROL, 0)]));
    let first = d.pipeline.run_pool(&pool).await.unwrap();
    assert_eq!((first.epoch_id, first.holders), (1, 2));

    let reopened = FileStore::new(dir.path());
    for seed in [ALICE, BOB] {
        let bundle = reopened.bundle(0, &address_of(seed)).unwrap().unwrap();
        let leaf = leaf_for(0, &bundle.holder_address, bundle.balance, bundle.epoch_id);
        assert!(verify(&leaf, &bundle.proof, &first.root));
    }
    assert!(reopened.bundle(0, &address_of(CAROL)).unwrap().is_none());

    stake_from_bundle(&d, 0, ALICE).await;
    stake_from_bundle(&d, 0, BOB).await;

    // 150s at 10/s over 150 staked
    d.ledger.advance_time(150);
    assert_eq!(d.admin.pending_reward(address_of(ALICE), 0).await.unwrap(), 1_000);
    assert_eq!(d.admin.pending_reward(address_of(BOB), 0).await.unwrap(), 500);

    // Epoch 2: Bob grows, Dave arrives
    d.census.set(0, snapshot(520, &[(ALICE, 100), (BOB, 80), (DAVE, 30)]));
    let second = d.pipeline.run_pool(&pool).await.unwrap();
    assert_eq!(second.epoch_id, 2);
    assert_eq!(
        second.diff,
        DiffSummary { unchanged: 1, changed: 1, removed: 0, new_holders: 1 }
    );
    assert_eq!(second.batches, 1);

    let contract = d.ledger.contract();
    assert_eq!(contract.pool_state(0).unwrap().total_staked, 180);
    let bob = contract.staker_info(&address_of(BOB), 0).unwrap();
    assert_eq!((bob.epoch_id, bob.staked_amount, bob.pending_rewards), (2, 80, 500));
    assert!(contract.staker_info(&address_of(DAVE), 0).is_none());

    // Dave was never a staker, so he proves with his own bundle
    stake_from_bundle(&d, 0, DAVE).await;
    assert_eq!(d.ledger.contract().pool_state(0).unwrap().total_staked, 210);

    d.ledger.advance_time(210);
    assert_eq!(d.admin.pending_reward(address_of(ALICE), 0).await.unwrap(), 2_000);
    assert_eq!(d.admin.pending_reward(address_of(BOB), 0).await.unwrap(), 1_300);
    assert_eq!(d.admin.pending_reward(address_of(DAVE), 0).await.unwrap(), 300);

    assert_eq!(client(&d.ledger, DAVE).claim(0).await.unwrap(), 300);

    // A root nobody reconciles against leaves every staker stale
    d.admin.submit_root(0, Digest([9u8; 32]), 3, 540).await.unwrap();
    d.ledger.advance_time(500);
    assert_eq!(d.admin.pending_reward(address_of(ALICE), 0).await.unwrap(), 2_000);

    let alice = client(&d.ledger, ALICE);
    assert_eq!(alice.claim(0).await.unwrap(), 2_000);
    let again = alice.claim(0).await.unwrap_err();
    assert_eq!(again.contract_error(), Some(ContractError::NoRewardsToClaim));

    // Both epochs are on disk, and so is the history
    assert_eq!(reopened.manifest(0, 1).unwrap().unwrap().root, first.root);
    assert_eq!(reopened.latest_manifest(0).unwrap().unwrap().epoch_id, 2);

    let history = HistoryLog::load(&dir.path().join("history.jsonl"));
    let published: Vec<_> = history
        .entries()
        .iter()
        .filter_map(|e| match &e.event {
            HistoryEvent::ManifestPublished { epoch_id, .. } => Some(*epoch_id),
            _ => None,
        })
        .collect();
    assert_eq!(published, vec![1, 2]);
}

#[tokio::test]
async fn test_departed_holder_keeps_settled_rewards() {
    let dir = TempDir::new().unwrap();
    let pool = descriptor(0, 'b');
    let d = deploy(dir.path(), vec![pool.clone()]).await;

    d.census.set(0, snapshot(500, &[(ALICE, 100), (BOB, 100)]));
    d.pipeline.run_pool(&pool).await.unwrap();
    stake_from_bundle(&d, 0, ALICE).await;
    stake_from_bundle(&d, 0, BOB).await;

    d.ledger.advance_time(100);
    d.census.set(0, snapshot(510, &[(ALICE, 100)]));
    let report = d.pipeline.run_pool(&pool).await.unwrap();
    assert_eq!(report.diff.removed, 1);
    assert!(d.store.bundle(0, &address_of(BOB)).unwrap().is_none());
    assert!(!dir.path().join("staging").join("pool-0").exists());

    // Bob's stake is zeroed but what he earned before leaving is still his
    d.ledger.advance_time(100);
    let bob = d.ledger.contract().staker_info(&address_of(BOB), 0).unwrap();
    assert_eq!(bob.staked_amount, 0);
    assert_eq!(d.admin.pending_reward(address_of(BOB), 0).await.unwrap(), 500);
    assert_eq!(d.admin.pending_reward(address_of(ALICE), 0).await.unwrap(), 1_500);
    assert_eq!(client(&d.ledger, BOB).claim(0).await.unwrap(), 500);
}

// ============================================================================
// Multiple pools
// ============================================================================

#[tokio::test]
async fn test_run_all_commits_each_pool() {
    let dir = TempDir::new().unwrap();
    let d = deploy(dir.path(), vec![descriptor(0, 'c'), descriptor(1, 'd')]).await;

    d.census.set(0, snapshot(700, &[(ALICE, 10), (BOB, 20)]));
    d.census.set(1, snapshot(700, &[(ALICE, 5), (CAROL, 7), (DAVE, 9)]));

    let results = d.pipeline.run_all().await;
    assert_eq!(results.len(), 2);

    let contract = d.ledger.contract();
    for (pool_index, result) in results {
        let report = result.unwrap();
        let committed = contract.merkle_root(pool_index).unwrap().unwrap();
        assert_eq!((committed.epoch_id, committed.root), (1, report.root));
        assert_eq!(d.store.manifest(pool_index, 1).unwrap().unwrap().root, report.root);
    }

    // Same holder, different pool, different leaf
    let in_zero = d.store.bundle(0, &address_of(ALICE)).unwrap().unwrap();
    let in_one = d.store.bundle(1, &address_of(ALICE)).unwrap().unwrap();
    assert_eq!((in_zero.balance, in_one.balance), (10, 5));
    let root_one = contract.merkle_root(1).unwrap().unwrap().root;
    assert!(!verify(&leaf_for(1, &address_of(ALICE), 10, 1), &in_one.proof, &root_one));
    assert!(verify(&leaf_for(1, &address_of(ALICE), 5, 1), &in_one.proof, &root_one));
}
