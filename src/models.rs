//! Result models for the typed wrapper methods.
//!
//! Only the commonly used fields are named. Everything else the daemon
//! returns is kept in `extra`, so newer daemon versions still decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chain name reported by `getblockchaininfo`.
///
/// Includes `Unknown` for forward-compatibility with new chain names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Main,
    Test,
    Regtest,
    #[serde(other)]
    Unknown,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Main => "main",
            Chain::Test => "test",
            Chain::Regtest => "regtest",
            Chain::Unknown => "unknown",
        }
    }
}

/// `getblockchaininfo` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub chain: Chain,
    pub blocks: u64,
    pub headers: u64,
    pub bestblockhash: String,
    pub difficulty: f64,
    #[serde(default)]
    pub mediantime: u64,
    #[serde(default)]
    pub verificationprogress: f64,
    #[serde(default)]
    pub pruned: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BlockchainInfo {
    /// Whether the node still has headers it has not validated blocks for.
    pub fn is_syncing(&self) -> bool {
        self.blocks < self.headers
    }
}

/// `getnetworkinfo` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub version: u64,
    pub subversion: String,
    pub protocolversion: u64,
    #[serde(default)]
    pub connections: u64,
    #[serde(default)]
    pub networkactive: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `getmempoolinfo` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolInfo {
    pub size: u64,
    pub bytes: u64,
    #[serde(default)]
    pub usage: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `getmininginfo` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningInfo {
    pub blocks: u64,
    pub difficulty: f64,
    pub networkhashps: f64,
    #[serde(default)]
    pub chain: Option<Chain>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}
