//! RPC client facade.
//!
//! Two concrete variants share one request/response core ([`Session`]):
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐
//! │ AsyncClient  │   │ BlockingClient │
//! │ (.await)     │   │ (blocks)       │
//! └──────┬───────┘   └───────┬────────┘
//!        └────────┬──────────┘
//!            ┌────▼────┐      ┌───────────────┐      ┌─────────┐
//!            │ Session │─────►│ HttpTransport │─────►│ evrmored│
//!            └─────────┘      └───────────────┘      └─────────┘
//! ```
//!
//! [`Client::new`] picks the variant from the execution context at
//! construction time. Any method name can be called through `call`; the
//! typed methods in [`methods`] are thin wrappers over it.

mod async_client;
mod blocking;
pub mod methods;
mod session;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use async_client::AsyncClient;
pub use blocking::BlockingClient;
pub use session::Session;

use crate::config::RpcConfig;
use crate::context::{self, ExecutionMode};
use crate::error::Result;
use crate::protocol::Params;

/// The method-call surface other components build on.
///
/// Notification decoding resolves hashes through this trait, so it works
/// with any implementation, including test doubles.
#[async_trait]
pub trait RpcCaller: Send + Sync {
    /// Invoke `method` with `params` and return the raw result.
    async fn invoke(&self, method: &str, params: Params) -> Result<Value>;
}

#[async_trait]
impl<C: RpcCaller + ?Sized> RpcCaller for Arc<C> {
    async fn invoke(&self, method: &str, params: Params) -> Result<Value> {
        (**self).invoke(method, params).await
    }
}

/// A client whose variant was chosen by the calling context.
#[derive(Debug)]
pub enum Client {
    Async(AsyncClient),
    Blocking(BlockingClient),
}

impl Client {
    /// Build the variant that fits the current thread: [`AsyncClient`]
    /// inside a tokio runtime, [`BlockingClient`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `config` has no credentials.
    pub fn new(config: RpcConfig) -> Result<Self> {
        Self::with_mode(config, context::detect())
    }

    /// Build a specific variant.
    pub fn with_mode(config: RpcConfig, mode: ExecutionMode) -> Result<Self> {
        let session = Session::shared(config)?;
        match mode {
            ExecutionMode::Cooperative => Ok(Client::Async(AsyncClient::from_session(session))),
            ExecutionMode::Blocking => Ok(Client::Blocking(BlockingClient::from_session(session)?)),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            Client::Async(_) => ExecutionMode::Cooperative,
            Client::Blocking(_) => ExecutionMode::Blocking,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        match self {
            Client::Async(c) => c.session(),
            Client::Blocking(c) => c.session(),
        }
    }

    pub fn as_async(&self) -> Option<&AsyncClient> {
        match self {
            Client::Async(c) => Some(c),
            Client::Blocking(_) => None,
        }
    }

    pub fn as_blocking(&self) -> Option<&BlockingClient> {
        match self {
            Client::Blocking(c) => Some(c),
            Client::Async(_) => None,
        }
    }
}
