use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stellar_strkey::{ed25519, Contract, Strkey};

use crate::{CoreError, Result};

/// Index of a registered pool inside the reward contract
pub type PoolIndex = u32;

/// Monotonic per-pool epoch counter (first committed epoch is 1)
pub type EpochId = u64;

/// Ledger sequence number a census was taken at
pub type LedgerHeight = u32;

/// Ledger amount in integer base units
pub type Amount = i128;

/// Liquidity-pool identifier (the 32-byte pool hash)
pub type PoolId = [u8; 32];

/// Decimal places of a ledger amount string ("1.0000000" == 10_000_000)
pub const AMOUNT_DECIMALS: u32 = 7;

/// 32-byte SHA-256 digest (leaf, node or root).
///
/// Ordering is lexicographic over the raw bytes, which is the ordering
/// the node hash uses to canonicalise its two children.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| CoreError::InvalidDigest(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidDigest(s.to_string()))?;
        Ok(Digest(arr))
    }

    /// First 8 bytes as hex, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::from_hex(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// XDR discriminants of `ScVal::Address(ScAddress)`.
const SCV_ADDRESS: u32 = 18;
const SC_ADDRESS_TYPE_ACCOUNT: u32 = 0;
const SC_ADDRESS_TYPE_CONTRACT: u32 = 1;
const PUBLIC_KEY_TYPE_ED25519: u32 = 0;

/// A pool-share holder: a classic ed25519 account (`G...`) or a contract (`C...`).
///
/// The derived ordering (accounts first, then key bytes) is the stable
/// order leaves are fed to the tree builder in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HolderAddress {
    Account([u8; 32]),
    Contract([u8; 32]),
}

impl HolderAddress {
    /// Canonical account-identifier binary encoding (XDR of an `ScVal::Address`).
    ///
    /// This is the byte string the on-ledger verifier appends to a leaf,
    /// so it must not change.
    pub fn to_xdr(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(44);
        out.extend_from_slice(&SCV_ADDRESS.to_be_bytes());
        match self {
            HolderAddress::Account(key) => {
                out.extend_from_slice(&SC_ADDRESS_TYPE_ACCOUNT.to_be_bytes());
                out.extend_from_slice(&PUBLIC_KEY_TYPE_ED25519.to_be_bytes());
                out.extend_from_slice(key);
            }
            HolderAddress::Contract(hash) => {
                out.extend_from_slice(&SC_ADDRESS_TYPE_CONTRACT.to_be_bytes());
                out.extend_from_slice(hash);
            }
        }
        out
    }

    pub fn to_strkey(&self) -> String {
        match self {
            HolderAddress::Account(key) => {
                Strkey::PublicKeyEd25519(ed25519::PublicKey(*key)).to_string()
            }
            HolderAddress::Contract(hash) => Strkey::Contract(Contract(*hash)).to_string(),
        }
    }

    /// Raw 32-byte key or contract hash
    pub fn key_bytes(&self) -> &[u8; 32] {
        match self {
            HolderAddress::Account(key) => key,
            HolderAddress::Contract(hash) => hash,
        }
    }

    /// First 8 strkey characters, for log lines
    pub fn short(&self) -> String {
        let mut s = self.to_strkey();
        s.truncate(8);
        s
    }
}

impl fmt::Display for HolderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_strkey())
    }
}

impl fmt::Debug for HolderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HolderAddress({})", self.short())
    }
}

impl FromStr for HolderAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match Strkey::from_string(s) {
            Ok(Strkey::PublicKeyEd25519(key)) => Ok(HolderAddress::Account(key.0)),
            Ok(Strkey::Contract(contract)) => Ok(HolderAddress::Contract(contract.0)),
            _ => Err(CoreError::InvalidAddress(s.to_string())),
        }
    }
}

impl Serialize for HolderAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_strkey())
    }
}

impl<'de> Deserialize<'de> for HolderAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A configured liquidity pool: contract index plus the pool's ledger id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    /// Index the pool was registered under in the reward contract
    pub index: PoolIndex,
    /// Liquidity pool id as 64 hex characters
    pub pool_id: String,
    /// Human-readable name for logs
    #[serde(default)]
    pub label: String,
}

impl PoolDescriptor {
    pub fn pool_id_bytes(&self) -> Result<PoolId> {
        let bytes =
            hex::decode(&self.pool_id).map_err(|_| CoreError::InvalidPoolId(self.pool_id.clone()))?;
        bytes
            .try_into()
            .map_err(|_| CoreError::InvalidPoolId(self.pool_id.clone()))
    }

    /// Label if set, otherwise the index
    pub fn name(&self) -> String {
        if self.label.is_empty() {
            format!("pool-{}", self.index)
        } else {
            self.label.clone()
        }
    }
}

/// Parse a ledger amount string ("12.5", "0.0000001") into base units.
///
/// More than `AMOUNT_DECIMALS` fractional digits, signs and overflow are rejected.
pub fn parse_amount(s: &str) -> Result<Amount> {
    let invalid = || CoreError::InvalidAmount(s.to_string());
    let trimmed = s.trim();
    let (whole, frac) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if frac.len() > AMOUNT_DECIMALS as usize {
        return Err(invalid());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole_units: i128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut frac_units: i128 = if frac.is_empty() {
        0
    } else {
        frac.parse().map_err(|_| invalid())?
    };
    for _ in frac.len()..AMOUNT_DECIMALS as usize {
        frac_units *= 10;
    }

    whole_units
        .checked_mul(10i128.pow(AMOUNT_DECIMALS))
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(invalid)
}

/// Render base units as a ledger amount string with all seven decimals
pub fn format_amount(amount: Amount) -> String {
    let scale = 10i128.pow(AMOUNT_DECIMALS);
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!(
        "{}{}.{:07}",
        sign,
        abs / scale as u128,
        abs % scale as u128
    )
}
