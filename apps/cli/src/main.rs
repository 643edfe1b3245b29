//! ShareCraft CLI
//!
//! Operator entry point: run the epoch pipeline, discover pools, inspect
//! manifests, verify proof bundles, and drive a local mock ledger.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::info;

use sharecraft_aggregator::{
    FileStore, LockFile, ManifestStore, PipelineConfig, PoolRunReport, ProofBundle, ProofStore,
    SnapshotPipeline,
};
use sharecraft_census::{AssetRef, Census, CensusSnapshot, ExpertCensus, ExpertConfig, StaticCensus};
use sharecraft_core::{format_amount, parse_amount, HolderAddress, PoolIndex};
use sharecraft_keystore::{default_key_path, expand_path, load_signing_key, save_signing_key};
use sharecraft_merkle::{leaf_for, verify};
use sharecraft_rewards::{Accrual, RateEstimator};
use sharecraft_settings::{LedgerMode, Settings};
use sharecraft_settlement::{MockLedger, SettlementClient, SettlementConfig};

/// ShareCraft - LP-share reward snapshots
#[derive(Parser)]
#[command(name = "sharecraft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.sharecraft/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the epoch pipeline now (admin key required)
    Run {
        /// Only this pool
        #[arg(short, long)]
        pool: Option<PoolIndex>,

        /// Read holders from a JSON file instead of the explorer
        #[arg(long)]
        census_file: Option<PathBuf>,
    },

    /// Find liquidity pools holding an asset
    Pools {
        #[command(subcommand)]
        action: PoolsAction,
    },

    /// Check a proof bundle against its published manifest root
    Verify {
        #[arg(short, long)]
        bundle: PathBuf,
    },

    /// Print a published manifest
    Manifest {
        #[arg(short, long)]
        pool: PoolIndex,

        /// Defaults to the latest epoch
        #[arg(short, long)]
        epoch: Option<u64>,
    },

    /// Generate a new signing key
    Keygen {
        /// Defaults to ~/.sharecraft/admin.key
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Operate the local mock ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
}

#[derive(Subcommand)]
enum PoolsAction {
    /// List pools with the asset as one reserve
    Discover {
        /// `CODE:ISSUER`, or `native`
        #[arg(short, long)]
        asset: String,

        /// Append pools not yet configured to the settings file
        #[arg(long)]
        add: bool,
    },
}

#[derive(Subcommand)]
enum LedgerAction {
    /// Initialize the reward contract with the admin key
    Init {
        /// Reward tokens per second across all pools
        #[arg(short, long)]
        reward_rate: String,
    },

    /// Register a configured pool with the contract
    AddPool {
        #[arg(short, long)]
        pool: PoolIndex,
    },

    /// Deposit reward tokens
    Fund {
        #[arg(short, long)]
        amount: String,
    },

    /// Move the ledger clock forward
    Advance {
        #[arg(short, long)]
        secs: u64,
    },

    /// Stake using the holder's published proof bundle
    Stake {
        #[arg(short, long)]
        pool: PoolIndex,

        /// Holder signing key
        #[arg(short, long)]
        key: PathBuf,
    },

    /// Claim pending rewards
    Claim {
        #[arg(short, long)]
        pool: PoolIndex,

        #[arg(short, long)]
        key: PathBuf,
    },

    /// Show a holder's pending reward
    Pending {
        #[arg(short, long)]
        pool: PoolIndex,

        /// Holder address (G... or C...)
        #[arg(long)]
        holder: String,

        /// Also project the reward this many seconds ahead
        #[arg(long, default_value_t = 3600)]
        ahead: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    sharecraft_logging::init(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { pool, census_file } => run(&settings, pool, census_file.as_deref()).await,
        Commands::Pools { action } => {
            pools(settings, action).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify { bundle } => {
            verify_bundle(&settings, &bundle)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Manifest { pool, epoch } => {
            show_manifest(&settings, pool, epoch)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Keygen { out } => {
            keygen(out)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ledger { action } => {
            ledger(&settings, action).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(&expand_path(path)),
        None => Settings::load_or_default(),
    };
    settings.context("loading settings")
}

fn data_dir(settings: &Settings) -> PathBuf {
    expand_path(&settings.pipeline.data_dir)
}

fn lease_timeout(settings: &Settings) -> Duration {
    Duration::from_secs(settings.pipeline.lease_timeout_secs)
}

fn store(settings: &Settings) -> FileStore {
    FileStore::new(data_dir(settings)).with_lease_timeout(lease_timeout(settings))
}

// ============================================================================
// Pipeline
// ============================================================================

async fn run(settings: &Settings, only: Option<PoolIndex>, census_file: Option<&Path>) -> Result<ExitCode> {
    settings.validate().context("invalid settings")?;
    let pools = match only {
        Some(index) => vec![settings
            .pool(index)
            .cloned()
            .with_context(|| format!("pool {} is not configured", index))?],
        None => settings.pools.clone(),
    };

    let admin = load_admin_key(settings)?;
    let session = open_mock_ledger(settings)?;
    let settlement = Arc::new(SettlementClient::new(
        settlement_config(settings),
        session.ledger.clone(),
        admin,
    ));
    info!("Running as {}", settlement.address());

    let census: Arc<dyn Census> = match census_file {
        Some(path) => Arc::new(load_census_file(path)?),
        None => Arc::new(ExpertCensus::new(expert_config(settings))?),
    };

    let pipeline = SnapshotPipeline::new(
        pipeline_config(settings),
        pools,
        census,
        settlement,
        Arc::new(store(settings)),
    );

    let results = pipeline.run_all().await;
    session.save()?;

    let mut failed = false;
    for (pool_index, result) in results {
        match result {
            Ok(report) => print_report(&report),
            Err(e) => {
                failed = true;
                println!("pool {}: FAILED: {}", pool_index, e);
            }
        }
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn print_report(report: &PoolRunReport) {
    println!(
        "pool {}: epoch {} root {} height {} holders {} | diff {} unchanged, {} changed, {} removed, {} new | {} applied, {} skipped in {} batches{}",
        report.pool_index,
        report.epoch_id,
        report.root,
        report.snapshot_height,
        report.holders,
        report.diff.unchanged,
        report.diff.changed,
        report.diff.removed,
        report.diff.new_holders,
        report.applied,
        report.skipped,
        report.batches,
        if report.resumed { " (resumed)" } else { "" }
    );
}

fn pipeline_config(settings: &Settings) -> PipelineConfig {
    PipelineConfig {
        batch_size: settings.pipeline.batch_size,
        max_batch_retries: settings.pipeline.max_batch_retries,
        retry_backoff: Duration::from_millis(settings.pipeline.retry_backoff_ms),
        max_root_submissions: settings.pipeline.max_root_submissions,
        history_path: Some(data_dir(settings).join("history.jsonl")),
    }
}

fn expert_config(settings: &Settings) -> ExpertConfig {
    let c = &settings.census;
    ExpertConfig {
        explorer_url: c.explorer_url.clone(),
        horizon_url: c.horizon_url.clone(),
        page_limit: c.page_limit,
        request_delay: Duration::from_millis(c.request_delay_ms),
        min_retry_after: Duration::from_millis(c.min_retry_after_ms),
        max_retries: c.max_retries,
        initial_backoff: Duration::from_millis(c.initial_backoff_ms),
        max_backoff: Duration::from_millis(c.max_backoff_ms),
        timeout: Duration::from_secs(c.timeout_secs),
    }
}

/// `{ "<pool_index>": { "ledger_height": .., "holders": [ { "address": "G..", "balance": .. } ] } }`
fn load_census_file(path: &Path) -> Result<StaticCensus> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading census file {}", path.display()))?;
    let snapshots: HashMap<PoolIndex, CensusSnapshot> =
        serde_json::from_str(&content).context("parsing census file")?;
    let census = StaticCensus::new();
    for (pool_index, snapshot) in snapshots {
        census.set(pool_index, snapshot);
    }
    Ok(census)
}

// ============================================================================
// Pool discovery
// ============================================================================

async fn pools(mut settings: Settings, action: PoolsAction) -> Result<()> {
    let PoolsAction::Discover { asset, add } = action;
    let asset: AssetRef = asset.parse()?;
    let census = ExpertCensus::new(expert_config(&settings))?;
    let found = census
        .discover_pools(&asset, settings.census.max_discovery_pages)
        .await
        .context("discovering pools")?;

    let mut next_index = settings.pools.iter().map(|p| p.index + 1).max().unwrap_or(0);
    let mut added = 0usize;
    for pool in &found {
        let configured = settings
            .pools
            .iter()
            .find(|p| p.pool_id.eq_ignore_ascii_case(&pool.pool_id))
            .map(|p| p.index);
        match configured {
            Some(index) => println!("{}  {}  (pool {})", pool.pool_id, pool.label, index),
            None if add => {
                settings.pools.push(pool.descriptor(next_index));
                println!("{}  {}  (added as pool {})", pool.pool_id, pool.label, next_index);
                next_index += 1;
                added += 1;
            }
            None => println!("{}  {}  (not configured)", pool.pool_id, pool.label),
        }
    }
    println!("{} pools hold {}", found.len(), asset.label());

    if added > 0 {
        settings.save().context("saving settings")?;
        println!(
            "Added {} pools to settings; register each with `sharecraft ledger add-pool`",
            added
        );
    }
    Ok(())
}

// ============================================================================
// Inspection
// ============================================================================

fn verify_bundle(settings: &Settings, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading bundle {}", path.display()))?;
    let bundle: ProofBundle = serde_json::from_str(&content).context("parsing bundle")?;

    let manifest = store(settings)
        .manifest(bundle.pool_index, bundle.epoch_id)?
        .with_context(|| {
            format!(
                "no manifest published for pool {} epoch {}",
                bundle.pool_index, bundle.epoch_id
            )
        })?;

    let leaf = leaf_for(bundle.pool_index, &bundle.holder_address, bundle.balance, bundle.epoch_id);
    if !verify(&leaf, &bundle.proof, &manifest.root) {
        bail!(
            "proof for {} does not verify against root {}",
            bundle.holder_address,
            manifest.root
        );
    }
    println!(
        "OK: {} holds {} in pool {} epoch {} (root {})",
        bundle.holder_address,
        format_amount(bundle.balance),
        bundle.pool_index,
        bundle.epoch_id,
        manifest.root
    );
    Ok(())
}

fn show_manifest(settings: &Settings, pool: PoolIndex, epoch: Option<u64>) -> Result<()> {
    let store = store(settings);
    let manifest = match epoch {
        Some(epoch) => store.manifest(pool, epoch)?,
        None => store.latest_manifest(pool)?,
    }
    .with_context(|| format!("no manifest for pool {}", pool))?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

fn keygen(out: Option<PathBuf>) -> Result<()> {
    let path = out.map(expand_path).unwrap_or_else(default_key_path);
    let key = SigningKey::generate(&mut OsRng);
    save_signing_key(&path, &key)?;
    println!("Wrote {}", path.display());
    println!("Address: {}", HolderAddress::Account(key.verifying_key().to_bytes()));
    Ok(())
}

// ============================================================================
// Mock ledger
// ============================================================================

fn load_admin_key(settings: &Settings) -> Result<SigningKey> {
    let path = expand_path(&settings.ledger.admin_key_path);
    load_signing_key(&path).with_context(|| {
        format!(
            "loading admin key from {} (create one with `sharecraft keygen`)",
            path.display()
        )
    })
}

fn mock_state_path(settings: &Settings) -> PathBuf {
    match &settings.ledger.mock_state_path {
        Some(path) => expand_path(path),
        None => data_dir(settings).join("mock-ledger.bin"),
    }
}

/// Mock ledger opened for one command; its state file stays locked until
/// the session drops, so concurrent commands cannot overwrite each other
struct MockSession {
    ledger: Arc<MockLedger>,
    path: PathBuf,
    _lock: LockFile,
}

impl MockSession {
    fn save(&self) -> Result<()> {
        self.ledger.save(&self.path)?;
        Ok(())
    }
}

fn open_mock_ledger(settings: &Settings) -> Result<MockSession> {
    if settings.ledger.mode == LedgerMode::Live {
        bail!(
            "ledger mode \"live\" needs a Soroban RPC transport, which this build does not include; \
             set ledger.mode to \"mock\""
        );
    }
    let path = mock_state_path(settings);
    let mut lock_path = path.clone().into_os_string();
    lock_path.push(".lock");
    let lock = LockFile::try_acquire(Path::new(&lock_path), lease_timeout(settings))?
        .with_context(|| format!("mock ledger {} is in use by another sharecraft process", path.display()))?;

    let ledger = MockLedger::load_or_new(&path, &settings.ledger.network_passphrase)
        .with_context(|| format!("opening mock ledger {}", path.display()))?;
    Ok(MockSession {
        ledger: Arc::new(ledger),
        path,
        _lock: lock,
    })
}

fn settlement_config(settings: &Settings) -> SettlementConfig {
    SettlementConfig {
        network_passphrase: settings.ledger.network_passphrase.clone(),
        poll_interval: Duration::from_millis(settings.ledger.poll_interval_ms),
        submit_timeout: Duration::from_secs(settings.ledger.submit_timeout_secs),
    }
}

async fn ledger(settings: &Settings, action: LedgerAction) -> Result<()> {
    let session = open_mock_ledger(settings)?;
    let ledger = &session.ledger;
    let client_for = |key: SigningKey| SettlementClient::new(settlement_config(settings), ledger.clone(), key);

    match action {
        LedgerAction::Init { reward_rate } => {
            let rate = parse_amount(&reward_rate)?;
            let admin = client_for(load_admin_key(settings)?);
            admin.initialize(rate).await?;
            println!("Initialized with admin {} at {} per second", admin.address(), format_amount(rate));
        }
        LedgerAction::AddPool { pool } => {
            let descriptor = settings
                .pool(pool)
                .with_context(|| format!("pool {} is not configured", pool))?;
            let admin = client_for(load_admin_key(settings)?);
            let index = admin.add_pool(descriptor.pool_id_bytes()?).await?;
            if index != pool {
                bail!(
                    "contract assigned index {} to {}, but settings say {}; add pools in index order",
                    index,
                    descriptor.name(),
                    pool
                );
            }
            println!("Added {} as pool {}", descriptor.name(), index);
        }
        LedgerAction::Fund { amount } => {
            let amount = parse_amount(&amount)?;
            let admin = client_for(load_admin_key(settings)?);
            let balance = admin.fund(amount).await?;
            println!("Reward balance: {}", format_amount(balance));
        }
        LedgerAction::Advance { secs } => {
            let now = ledger.advance_time(secs);
            println!("Ledger time {} (height {})", now, ledger.ledger_height());
        }
        LedgerAction::Stake { pool, key } => {
            let key = load_signing_key(&expand_path(&key))?;
            let holder = client_for(key);
            let bundle = store(settings)
                .bundle(pool, &holder.address())?
                .with_context(|| format!("no proof bundle for {} in pool {}", holder.address(), pool))?;
            holder
                .stake(pool, bundle.balance, bundle.epoch_id, bundle.proof)
                .await?;
            println!(
                "Staked {} in pool {} for epoch {}",
                format_amount(bundle.balance),
                pool,
                bundle.epoch_id
            );
        }
        LedgerAction::Claim { pool, key } => {
            let holder = client_for(load_signing_key(&expand_path(&key))?);
            let paid = holder.claim(pool).await?;
            println!("Claimed {}", format_amount(paid));
        }
        LedgerAction::Pending { pool, holder, ahead } => {
            let address: HolderAddress = holder.parse()?;
            let contract = ledger.contract();
            let now = ledger.now();
            let pending = contract.pending_reward(&address, pool, now)?;
            let state = contract.pool_state(pool)?;
            println!(
                "{} pending in pool {}: {} (pool total staked {})",
                address,
                pool,
                format_amount(pending),
                format_amount(state.total_staked)
            );

            if let Some(staker) = contract.staker_info(&address, pool) {
                let accrual = contract.staker_accrual(&staker, pool)?;
                let mut estimator = RateEstimator::default();
                estimator.observe_authoritative(now, contract.reward_rate());
                if let Some(estimate) = estimator.estimate() {
                    let projected =
                        RateEstimator::project_pending(&staker, &state, accrual, estimate, now + ahead);
                    let note = match accrual {
                        Accrual::Live => "accruing",
                        Accrual::Frozen { .. } => "frozen until the next snapshot or re-stake",
                    };
                    println!("In {}s: {} ({})", ahead, format_amount(projected), note);
                }
            }
        }
    }

    session.save()
}
