//! Liquidity pool discovery through Horizon
//!
//! Lists the constant-product pools that hold a given asset on one side,
//! so new pools can be registered without looking up their ids by hand.
//! Pages are followed through `_links.next.href` up to a page cap.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sharecraft_core::{HolderAddress, PoolDescriptor, PoolIndex};

use crate::expert::{parse_url, Page};
use crate::{CensusError, ExpertCensus, Result};

/// Horizon's page size ceiling
const DISCOVERY_PAGE_LIMIT: u32 = 200;

/// Asset as Horizon spells it: `native` or `CODE:ISSUER`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetRef {
    Native,
    Credit { code: String, issuer: String },
}

impl AssetRef {
    pub fn code(&self) -> &str {
        match self {
            AssetRef::Native => "XLM",
            AssetRef::Credit { code, .. } => code,
        }
    }

    /// `XLM` for native, `CODE:ISSUER` otherwise so issuers stay apart
    pub fn label(&self) -> String {
        match self {
            AssetRef::Native => "XLM".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetRef::Native => f.write_str("native"),
            AssetRef::Credit { code, issuer } => write!(f, "{}:{}", code, issuer),
        }
    }
}

impl FromStr for AssetRef {
    type Err = CensusError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CensusError::InvalidAsset(s.to_string());
        if s.eq_ignore_ascii_case("native") || s.eq_ignore_ascii_case("xlm") {
            return Ok(AssetRef::Native);
        }
        let (code, issuer) = s.split_once(':').ok_or_else(invalid)?;
        if code.is_empty() || code.len() > 12 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        match issuer.parse::<HolderAddress>() {
            Ok(HolderAddress::Account(_)) => Ok(AssetRef::Credit {
                code: code.to_string(),
                issuer: issuer.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

/// A pool holding the searched asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPool {
    /// 64 hex characters
    pub pool_id: String,
    /// The other side of the pool
    pub counter_asset: AssetRef,
    /// `<OTHER>-<CODE>`, e.g. `XLM-LMNR`
    pub label: String,
}

impl DiscoveredPool {
    pub fn descriptor(&self, index: PoolIndex) -> PoolDescriptor {
        PoolDescriptor {
            index,
            pool_id: self.pool_id.clone(),
            label: self.label.clone(),
        }
    }
}

#[derive(Deserialize)]
struct PoolRecord {
    id: String,
    #[serde(default)]
    reserves: Vec<ReserveRecord>,
}

/// Horizon reports `asset`; older responses split it into type, code and issuer
#[derive(Deserialize)]
struct ReserveRecord {
    #[serde(default)]
    asset: Option<String>,
    #[serde(default)]
    asset_type: Option<String>,
    #[serde(default)]
    asset_code: Option<String>,
    #[serde(default)]
    asset_issuer: Option<String>,
}

impl ReserveRecord {
    fn asset(&self) -> Option<AssetRef> {
        if let Some(asset) = self.asset.as_deref().filter(|a| !a.is_empty()) {
            return asset.parse().ok();
        }
        if self.asset_type.as_deref() == Some("native") {
            return Some(AssetRef::Native);
        }
        match (&self.asset_code, &self.asset_issuer) {
            (Some(code), Some(issuer)) => format!("{}:{}", code, issuer).parse().ok(),
            _ => None,
        }
    }
}

fn is_pool_id(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn match_pool(record: &PoolRecord, asset: &AssetRef) -> Option<DiscoveredPool> {
    if !is_pool_id(&record.id) || record.reserves.len() != 2 {
        return None;
    }
    let first = record.reserves[0].asset()?;
    let second = record.reserves[1].asset()?;
    let counter_asset = if first == *asset {
        second
    } else if second == *asset {
        first
    } else {
        return None;
    };
    Some(DiscoveredPool {
        pool_id: record.id.to_ascii_lowercase(),
        label: format!("{}-{}", counter_asset.label(), asset.code()),
        counter_asset,
    })
}

impl ExpertCensus {
    /// Every pool with `asset` as one reserve, ordered by pool id.
    ///
    /// Stops after `max_pages` pages even if Horizon offers more.
    pub async fn discover_pools(&self, asset: &AssetRef, max_pages: u32) -> Result<Vec<DiscoveredPool>> {
        let max_pages = max_pages.max(1);
        let mut url = parse_url(&format!(
            "{}/liquidity_pools",
            self.config.horizon_url.trim_end_matches('/')
        ))?;
        url.query_pairs_mut()
            .append_pair("reserves", &asset.to_string())
            .append_pair("limit", &DISCOVERY_PAGE_LIMIT.to_string())
            .append_pair("order", "asc");

        let mut found = BTreeMap::new();
        let mut scanned = 0usize;
        let mut pages = 0u32;

        loop {
            let page: Page<PoolRecord> = self.fetch(&url).await?;
            pages += 1;
            if page.embedded.records.is_empty() {
                break;
            }
            scanned += page.embedded.records.len();
            for record in &page.embedded.records {
                if let Some(pool) = match_pool(record, asset) {
                    found.insert(pool.pool_id.clone(), pool);
                }
            }
            debug!(
                "Discovery page {}: {} records, {} matching so far",
                pages,
                page.embedded.records.len(),
                found.len()
            );

            let Some(link) = page.links.next else { break };
            let next = url
                .join(&link.href)
                .map_err(|e| CensusError::Url(format!("{}: {}", link.href, e)))?;
            if next == url {
                break;
            }
            if pages >= max_pages {
                warn!("Stopping discovery after {} pages", max_pages);
                break;
            }
            url = next;
        }

        info!(
            "Discovered {} pools holding {} ({} scanned over {} pages)",
            found.len(),
            asset.code(),
            scanned,
            pages
        );
        Ok(found.into_values().collect())
    }
}
