//! Typed wrappers for well-known daemon methods.
//!
//! Each entry expands to an `async fn` on [`AsyncClient`] and a blocking
//! `fn` on [`BlockingClient`]. The Rust name is the RPC method name, and
//! every wrapper goes through `call_as`, so `call` stays the single path to
//! the daemon. Methods missing here are still reachable through `call`.

use serde_json::Value;

use super::{AsyncClient, BlockingClient};
use crate::error::Result;
use crate::models::{BlockchainInfo, MempoolInfo, MiningInfo, NetworkInfo};

macro_rules! rpc_methods {
    ($(
        $(#[$meta:meta])*
        fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;
    )*) => {
        /// Names of every method with a typed wrapper.
        pub const CATALOG: &[&str] = &[$(stringify!($name)),*];

        impl AsyncClient {
            $(
                $(#[$meta])*
                pub async fn $name(&self $(, $arg: $ty)*) -> Result<$ret> {
                    let params: Vec<Value> = vec![$(serde_json::to_value($arg)?),*];
                    self.call_as(stringify!($name), params).await
                }
            )*
        }

        impl BlockingClient {
            $(
                $(#[$meta])*
                pub fn $name(&self $(, $arg: $ty)*) -> Result<$ret> {
                    let params: Vec<Value> = vec![$(serde_json::to_value($arg)?),*];
                    self.call_as(stringify!($name), params)
                }
            )*
        }
    };
}

rpc_methods! {
    // == Blockchain ==

    /// Height of the most-work fully validated chain.
    fn getblockcount() -> u64;
    fn getbestblockhash() -> String;
    /// Hash of the block at `height` in the best chain.
    fn getblockhash(height: u64) -> String;
    /// Block by hash. Verbosity 0 returns hex, 1 a JSON object, 2 includes
    /// decoded transactions.
    fn getblock(blockhash: &str, verbosity: u8) -> Value;
    fn getblockheader(blockhash: &str, verbose: bool) -> Value;
    fn getblockchaininfo() -> BlockchainInfo;
    fn getchaintips() -> Value;
    fn getdifficulty() -> f64;
    fn getmempoolinfo() -> MempoolInfo;
    /// Transaction ids currently in the mempool.
    fn getrawmempool() -> Vec<String>;
    /// Unspent output details, `null` when spent or unknown.
    fn gettxout(txid: &str, n: u32, include_mempool: bool) -> Value;
    fn decodeblock(blockhex: &str) -> Value;

    // == Rawtransactions ==

    fn getrawtransaction(txid: &str, verbose: bool) -> Value;
    fn decoderawtransaction(hexstring: &str) -> Value;
    fn decodescript(hexstring: &str) -> Value;
    /// Submit a signed transaction; returns its id.
    fn sendrawtransaction(hexstring: &str) -> String;

    // == Network ==

    fn getnetworkinfo() -> NetworkInfo;
    fn getconnectioncount() -> u64;
    fn getpeerinfo() -> Vec<Value>;

    // == Mining ==

    fn getmininginfo() -> MiningInfo;

    // == Assets ==

    fn getassetdata(asset_name: &str) -> Value;
    fn listassets(asset: &str, verbose: bool) -> Value;

    // == Wallet ==

    fn getbalance() -> f64;
    fn getwalletinfo() -> Value;
    fn listtransactions(label: &str, count: u32) -> Vec<Value>;

    // == Control ==

    /// Seconds since the daemon started.
    fn uptime() -> u64;
    fn help(command: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_are_lowercase_rpc_names() {
        assert!(CATALOG.contains(&"getblockcount"));
        assert!(CATALOG.contains(&"getassetdata"));
        assert!(CATALOG
            .iter()
            .all(|name| name.chars().all(|c| c.is_ascii_lowercase())));
    }
}
