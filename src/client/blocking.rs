//! Blocking client variant.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::session::Session;
use crate::config::RpcConfig;
use crate::context::{blocking_strategy, BlockingStrategy, ExecutionMode};
use crate::error::Result;
use crate::protocol::Params;

/// Client for ordinary blocking code.
///
/// Drives the shared request core on the session's current-thread runtime,
/// which only runs while a call is in progress. No threads are spawned.
/// Cloning is cheap; clones and other blocking clients built on the same
/// session share its connection and runtime.
///
/// # Example
///
/// ```ignore
/// use evrmore_rpc::{BlockingClient, RpcConfig};
///
/// let client = BlockingClient::new(RpcConfig::builder().resolve()?)?;
/// println!("height {}", client.getblockcount()?);
/// client.close();
/// ```
#[derive(Debug, Clone)]
pub struct BlockingClient {
    session: Arc<Session>,
}

impl BlockingClient {
    /// Create a client with its own session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `config` has no credentials, or
    /// `Error::Io` if the runtime cannot be built.
    pub fn new(config: RpcConfig) -> Result<Self> {
        Self::from_session(Session::shared(config)?)
    }

    /// Wrap an existing session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the session's runtime cannot be built.
    pub fn from_session(session: Arc<Session>) -> Result<Self> {
        session.blocking_runtime()?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Invoke any RPC method by name, blocking until the response arrives.
    ///
    /// # Errors
    ///
    /// Same as [`AsyncClient::call`](super::AsyncClient::call), plus
    /// `Error::Context` when called from inside a current-thread runtime.
    pub fn call(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        self.session.claim(ExecutionMode::Blocking)?;
        let params = params.into();
        self.block_on(self.session.call(method, params))?
    }

    /// Invoke a method and decode its result into `T`.
    pub fn call_as<T: DeserializeOwned>(&self, method: &str, params: impl Into<Params>) -> Result<T> {
        let value = self.call(method, params)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send several calls in one batch. Results keep the order of `calls`.
    pub fn call_batch<I, M, P>(&self, calls: I) -> Result<Vec<Result<Value>>>
    where
        I: IntoIterator<Item = (M, P)>,
        M: Into<String>,
        P: Into<Params>,
    {
        self.session.claim(ExecutionMode::Blocking)?;
        let calls = calls
            .into_iter()
            .map(|(m, p)| (m.into(), p.into()))
            .collect();
        self.block_on(self.session.call_batch(calls))?
    }

    /// Release the session's connection. Safe to call repeatedly and from
    /// any context.
    pub fn close(&self) {
        let closed = match blocking_strategy() {
            Ok(_) => self.block_on(self.session.close()).is_ok(),
            Err(_) => false,
        };
        if !closed {
            self.session.transport().close_now();
        }
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let runtime = self.session.blocking_runtime()?;

        match blocking_strategy()? {
            BlockingStrategy::Direct => Ok(runtime.block_on(future)),
            BlockingStrategy::BlockInPlace => {
                Ok(tokio::task::block_in_place(|| runtime.block_on(future)))
            }
        }
    }
}
