//! Paginated holder census against the public ledger explorer
//!
//! The latest ledger height is read from Horizon before enumeration starts,
//! so the snapshot is at least as recent as the reported height. Holder
//! pages are followed through `_links.next.href` until a page comes back
//! empty or the link stops advancing.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sharecraft_core::{parse_amount, Amount, HolderAddress, LedgerHeight, PoolDescriptor};

use crate::{validate_holders, Census, CensusError, CensusSnapshot, HolderBalance, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertConfig {
    /// Explorer base including the network segment, e.g. `.../explorer/public`
    pub explorer_url: String,
    pub horizon_url: String,
    pub page_limit: u32,
    /// Pause before every request; up to half of it again is added as jitter
    pub request_delay: Duration,
    /// Lower bound on the pause after a 429 without `Retry-After`
    pub min_retry_after: Duration,
    /// Retries per request after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl Default for ExpertConfig {
    fn default() -> Self {
        Self {
            explorer_url: "https://api.stellar.expert/explorer/public".to_string(),
            horizon_url: "https://horizon.stellar.org".to_string(),
            page_limit: 50,
            request_delay: Duration::from_millis(500),
            min_retry_after: Duration::from_secs(5),
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// HAL page shared by the explorer and Horizon
#[derive(Deserialize)]
pub(crate) struct Page<T> {
    #[serde(rename = "_embedded", default = "Embedded::empty")]
    pub(crate) embedded: Embedded<T>,
    #[serde(rename = "_links", default)]
    pub(crate) links: Links,
}

#[derive(Deserialize)]
pub(crate) struct Embedded<T> {
    #[serde(default = "Vec::new")]
    pub(crate) records: Vec<T>,
}

impl<T> Embedded<T> {
    fn empty() -> Self {
        Self { records: Vec::new() }
    }
}

#[derive(Deserialize, Default)]
pub(crate) struct Links {
    pub(crate) next: Option<Link>,
}

#[derive(Deserialize)]
pub(crate) struct Link {
    pub(crate) href: String,
}

#[derive(Deserialize)]
struct HolderRecord {
    #[serde(alias = "address")]
    account: String,
    balance: serde_json::Value,
}

#[derive(Deserialize)]
struct LedgerRecord {
    sequence: LedgerHeight,
}

/// Explorer balances are integer base units; decimal strings are also accepted.
fn record_balance(value: &serde_json::Value) -> Result<Amount> {
    let malformed = || CensusError::Malformed(format!("balance {}", value));
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Amount::from)
            .or_else(|| n.as_u64().map(Amount::from))
            .ok_or_else(malformed),
        serde_json::Value::String(s) if s.contains('.') => Ok(parse_amount(s)?),
        serde_json::Value::String(s) => s.trim().parse::<Amount>().map_err(|_| malformed()),
        _ => Err(malformed()),
    }
}

pub struct ExpertCensus {
    pub(crate) config: ExpertConfig,
    http: reqwest::Client,
}

impl ExpertCensus {
    pub fn new(config: ExpertConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("sharecraft/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, http })
    }

    /// Latest closed ledger according to Horizon
    pub async fn latest_ledger(&self) -> Result<LedgerHeight> {
        let mut url = parse_url(&format!(
            "{}/ledgers",
            self.config.horizon_url.trim_end_matches('/')
        ))?;
        url.query_pairs_mut()
            .append_pair("order", "desc")
            .append_pair("limit", "1");
        let page: Page<LedgerRecord> = self.fetch(&url).await?;
        page.embedded
            .records
            .first()
            .map(|r| r.sequence)
            .ok_or_else(|| CensusError::Malformed("no ledgers returned".to_string()))
    }

    fn first_page_url(&self, pool: &PoolDescriptor) -> Result<Url> {
        let mut url = parse_url(&format!(
            "{}/liquidity-pool/{}/holders",
            self.config.explorer_url.trim_end_matches('/'),
            pool.pool_id
        ))?;
        url.query_pairs_mut()
            .append_pair("filter", "asset-holders")
            .append_pair("limit", &self.config.page_limit.to_string())
            .append_pair("order", "desc");
        Ok(url)
    }

    async fn pause(&self) {
        let base = self.config.request_delay.as_millis() as u64;
        if base == 0 {
            return;
        }
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
    }

    /// GET with retries on 429, 5xx and connection failures.
    ///
    /// Other non-success statuses are definite and returned immediately.
    pub(crate) async fn fetch<T: DeserializeOwned>(&self, url: &Url) -> Result<T> {
        let attempts = self.config.max_retries + 1;
        let mut backoff = self.config.initial_backoff;

        for attempt in 1..=attempts {
            self.pause().await;

            let wait = match self.http.get(url.clone()).send().await {
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = retry_after(&resp)
                        .unwrap_or_else(|| backoff.max(self.config.min_retry_after));
                    warn!(
                        "Rate limited by {} (attempt {}/{}), waiting {:?}",
                        url.path(),
                        attempt,
                        attempts,
                        wait
                    );
                    wait
                }
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(
                        "Server error {} from {} (attempt {}/{})",
                        resp.status(),
                        url.path(),
                        attempt,
                        attempts
                    );
                    backoff
                }
                Ok(resp) if !resp.status().is_success() => {
                    return Err(CensusError::Status {
                        status: resp.status().as_u16(),
                        url: url.to_string(),
                    });
                }
                Ok(resp) => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| CensusError::Malformed(format!("{}: {}", url, e)));
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    warn!(
                        "Request to {} failed (attempt {}/{}): {}",
                        url.path(),
                        attempt,
                        attempts,
                        e
                    );
                    backoff
                }
                Err(e) => return Err(e.into()),
            };

            if attempt < attempts {
                tokio::time::sleep(wait).await;
                backoff = backoff.mul_f64(1.5).min(self.config.max_backoff);
            }
        }

        Err(CensusError::RetriesExhausted {
            url: url.to_string(),
            attempts,
        })
    }
}

pub(crate) fn parse_url(s: &str) -> Result<Url> {
    Url::parse(s).map_err(|e| CensusError::Url(format!("{}: {}", s, e)))
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let secs: f64 = resp.headers().get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

#[async_trait]
impl Census for ExpertCensus {
    async fn snapshot(&self, pool: &PoolDescriptor) -> Result<CensusSnapshot> {
        pool.pool_id_bytes()?;
        let ledger_height = self.latest_ledger().await?;

        let mut url = self.first_page_url(pool)?;
        let mut holders = Vec::new();
        let mut pages = 0u32;

        loop {
            let page: Page<HolderRecord> = self.fetch(&url).await?;
            pages += 1;
            if page.embedded.records.is_empty() {
                break;
            }
            for record in &page.embedded.records {
                let address: HolderAddress = record.account.parse()?;
                holders.push(HolderBalance {
                    address,
                    balance: record_balance(&record.balance)?,
                });
            }
            debug!(
                "{} page {}: {} records ({} total)",
                pool.name(),
                pages,
                page.embedded.records.len(),
                holders.len()
            );

            let Some(link) = page.links.next else { break };
            let next = url
                .join(&link.href)
                .map_err(|e| CensusError::Url(format!("{}: {}", link.href, e)))?;
            if next == url {
                break;
            }
            url = next;
        }

        let holders = validate_holders(holders)?;
        info!(
            "Census of {} at ledger {}: {} holders over {} pages",
            pool.name(),
            ledger_height,
            holders.len(),
            pages
        );
        Ok(CensusSnapshot {
            ledger_height,
            holders,
        })
    }
}
