//! Cooperative client variant.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::session::Session;
use super::RpcCaller;
use crate::config::RpcConfig;
use crate::context::ExecutionMode;
use crate::error::Result;
use crate::protocol::Params;

/// Client for code running on a tokio runtime.
///
/// Cloning is cheap and every clone shares the session and its connection.
/// Concurrent calls are allowed; the transport serializes them on the wire.
///
/// # Example
///
/// ```ignore
/// use evrmore_rpc::{AsyncClient, RpcConfig};
/// use serde_json::json;
///
/// let client = AsyncClient::new(RpcConfig::builder().resolve()?)?;
/// let height = client.getblockcount().await?;
/// let hash = client.call("getblockhash", vec![json!(height)]).await?;
/// client.close().await;
/// ```
#[derive(Debug, Clone)]
pub struct AsyncClient {
    session: Arc<Session>,
}

impl AsyncClient {
    /// Create a client with its own session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `config` has no credentials.
    pub fn new(config: RpcConfig) -> Result<Self> {
        Ok(Self::from_session(Session::shared(config)?))
    }

    /// Wrap an existing session.
    pub fn from_session(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Invoke any RPC method by name.
    ///
    /// # Errors
    ///
    /// - `Error::Rpc` when the daemon rejects the call
    /// - `Error::Transport` / `Error::Timeout` on connection problems
    /// - `Error::Authentication` when the credentials are refused
    /// - `Error::Context` if the session is bound to blocking mode
    pub async fn call(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        self.session.claim(ExecutionMode::Cooperative)?;
        self.session.call(method, params.into()).await
    }

    /// Invoke a method and decode its result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Into<Params>,
    ) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send several calls in one batch. Results keep the order of `calls`.
    pub async fn call_batch<I, M, P>(&self, calls: I) -> Result<Vec<Result<Value>>>
    where
        I: IntoIterator<Item = (M, P)>,
        M: Into<String>,
        P: Into<Params>,
    {
        self.session.claim(ExecutionMode::Cooperative)?;
        let calls = calls
            .into_iter()
            .map(|(m, p)| (m.into(), p.into()))
            .collect();
        self.session.call_batch(calls).await
    }

    /// Release the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

#[async_trait]
impl RpcCaller for AsyncClient {
    async fn invoke(&self, method: &str, params: Params) -> Result<Value> {
        self.call(method, params).await
    }
}
