//! Evrmore RPC client library.
//!
//! - `client` - blocking and async clients over one shared session
//! - `transport` - keep-alive HTTP connection to the daemon
//! - `config` - endpoint and credential resolution (params, env, conf, cookie)
//! - `context` - execution-mode detection
//! - `protocol` - JSON-RPC wire types
//! - `notify` - ZMQ notification subscriber and decoding
//!
//! # Usage
//!
//! ```ignore
//! use evrmore_rpc::{AsyncClient, RpcConfig};
//! use serde_json::json;
//!
//! let config = RpcConfig::builder().resolve()?;
//! let client = AsyncClient::new(config)?;
//! let height = client.getblockcount().await?;
//! let block = client.call("getblock", vec![json!(client.getblockhash(height).await?), json!(2)]).await?;
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod notify;
pub mod protocol;
pub mod transport;

pub use client::{AsyncClient, BlockingClient, Client, RpcCaller, Session};
pub use config::{Credentials, Network, RpcConfig};
pub use context::ExecutionMode;
pub use error::{Error, Result};
pub use protocol::Params;
