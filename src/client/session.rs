//! Shared request/response core.
//!
//! A [`Session`] owns the transport, the request id counter and the mode
//! cell. Both client variants dispatch through it. A session used from
//! blocking code also owns the current-thread runtime that drives its
//! connection, so every blocking client on the session shares one reactor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use crate::config::{read_cookie_async, RpcConfig};
use crate::context::{ExecutionMode, ModeCell};
use crate::error::{Error, Result};
use crate::protocol::{Params, RpcRequest, RpcResponse};
use crate::transport::HttpTransport;

/// One long-lived client session.
#[derive(Debug)]
pub struct Session {
    transport: HttpTransport,
    /// Monotonically increasing request ID counter.
    next_id: AtomicU64,
    mode: ModeCell,
    /// Runtime for blocking callers, built on first use.
    runtime: OnceLock<Runtime>,
    runtime_init: Mutex<()>,
}

impl Session {
    /// Create a session. No connection is opened until the first call.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the config has no credentials.
    pub fn new(config: RpcConfig) -> Result<Self> {
        if config.credentials.is_none() {
            return Err(Error::Configuration(
                "No RPC credentials available: set rpcuser/rpcpassword, EVR_RPC_USER/EVR_RPC_PASSWORD, or run the daemon with a cookie file"
                    .to_string(),
            ));
        }

        Ok(Self {
            transport: HttpTransport::new(&config)?,
            next_id: AtomicU64::new(1),
            mode: ModeCell::new(),
            runtime: OnceLock::new(),
            runtime_init: Mutex::new(()),
        })
    }

    /// Create a session behind an `Arc`, ready to hand to a client variant.
    pub fn shared(config: RpcConfig) -> Result<Arc<Self>> {
        Self::new(config).map(Arc::new)
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// The execution mode, once the first call has fixed it.
    pub fn mode(&self) -> Option<ExecutionMode> {
        self.mode.get()
    }

    pub(crate) fn claim(&self, mode: ExecutionMode) -> Result<ExecutionMode> {
        self.mode.claim(mode)
    }

    /// The runtime blocking clients drive this session on.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the runtime cannot be built.
    pub(crate) fn blocking_runtime(&self) -> Result<&Runtime> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }

        let _guard = match self.runtime_init.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(self.runtime.get_or_init(|| runtime))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Invoke `method` with `params`. The method name is sent verbatim.
    pub(crate) async fn call(&self, method: &str, params: Params) -> Result<Value> {
        let id = self.next_id();
        let request = RpcRequest::new(method, params, id);
        debug!(method, id, "RPC call");

        let body = self.send(&request).await?;
        let response: RpcResponse = serde_json::from_value(body)
            .map_err(|e| Error::Protocol(format!("Failed to parse response: {}", e)))?;

        response.into_result(id)
    }

    /// Send several calls as one JSON-RPC batch.
    ///
    /// Results come back in the order of `calls`; responses are matched by
    /// id, whatever order the daemon returns them in. Each entry carries its
    /// own RPC error, if any.
    pub(crate) async fn call_batch(
        &self,
        calls: Vec<(String, Params)>,
    ) -> Result<Vec<Result<Value>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<RpcRequest> = calls
            .into_iter()
            .map(|(method, params)| RpcRequest::new(method, params, self.next_id()))
            .collect();
        debug!(count = requests.len(), "RPC batch");

        let body = self.send(&requests).await?;
        if !body.is_array() {
            // A whole-batch rejection comes back as a single response.
            let single: RpcResponse = serde_json::from_value(body)
                .map_err(|e| Error::Protocol(format!("Failed to parse batch response: {}", e)))?;
            return match single.error {
                Some(err) => Err(err.into()),
                None => Err(Error::Protocol(
                    "Batch request answered with a single result".to_string(),
                )),
            };
        }
        let responses: Vec<RpcResponse> = serde_json::from_value(body)
            .map_err(|e| Error::Protocol(format!("Failed to parse batch response: {}", e)))?;

        let mut by_id: HashMap<u64, RpcResponse> = HashMap::with_capacity(responses.len());
        for response in responses {
            match response.id_u64() {
                Some(id) => {
                    by_id.insert(id, response);
                }
                None => debug!("Dropping batch response without a numeric id"),
            }
        }

        Ok(requests
            .iter()
            .map(|req| match by_id.remove(&req.id) {
                Some(response) => response.into_result(req.id),
                None => Err(Error::Protocol(format!(
                    "No response for request id {} ({})",
                    req.id, req.method
                ))),
            })
            .collect())
    }

    /// Send through the transport, refreshing cookie credentials once if
    /// the daemon rejects them.
    async fn send<T: serde::Serialize + ?Sized>(&self, body: &T) -> Result<Value> {
        match self.transport.send(body).await {
            Err(Error::Authentication { status }) => {
                if self.refresh_cookie().await? {
                    self.transport.send(body).await
                } else {
                    Err(Error::Authentication { status })
                }
            }
            other => other,
        }
    }

    /// Re-read the cookie file. Returns whether the secret changed.
    async fn refresh_cookie(&self) -> Result<bool> {
        let Some(current) = self.transport.credentials() else {
            return Ok(false);
        };
        let Some(path) = current.cookie_path() else {
            return Ok(false);
        };

        match read_cookie_async(path).await? {
            Some(fresh) if fresh.password != current.password => {
                info!("Cookie file {} changed, retrying with new secret", path.display());
                self.transport.set_credentials(fresh);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release the connection. Idempotent.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The connection task lives on the runtime, so drop it first.
        self.transport.close_now();
        if let Some(runtime) = self.runtime.take() {
            // Dropping a runtime inside another runtime panics.
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialSource, Credentials};

    #[test]
    fn test_session_requires_credentials() {
        let mut config = RpcConfig::new("http://127.0.0.1:8819", "u", "p").unwrap();
        config.credentials = None;
        assert!(matches!(Session::new(config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_request_ids_increase() {
        let config = RpcConfig::new("http://127.0.0.1:8819", "u", "p").unwrap();
        let session = Session::new(config).unwrap();
        let first = session.next_id();
        let second = session.next_id();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_refresh_cookie_detects_new_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cookie");
        std::fs::write(&path, "__cookie__:old").unwrap();

        let mut config = RpcConfig::new("http://127.0.0.1:8819", "u", "p").unwrap();
        config.credentials = Some(Credentials::new(
            "__cookie__",
            "old",
            CredentialSource::Cookie(path.clone()),
        ));
        let session = Session::new(config).unwrap();

        assert!(!session.refresh_cookie().await.unwrap());

        std::fs::write(&path, "__cookie__:new").unwrap();
        assert!(session.refresh_cookie().await.unwrap());
        assert_eq!(session.transport().credentials().unwrap().password, "new");
    }

    #[tokio::test]
    async fn test_refresh_ignores_non_cookie_credentials() {
        let config = RpcConfig::new("http://127.0.0.1:8819", "u", "p").unwrap();
        let session = Session::new(config).unwrap();
        assert!(!session.refresh_cookie().await.unwrap());
    }

    #[test]
    fn test_blocking_runtime_is_built_once() {
        let config = RpcConfig::new("http://127.0.0.1:8819", "u", "p").unwrap();
        let session = Session::new(config).unwrap();
        let first = session.blocking_runtime().unwrap() as *const Runtime;
        let second = session.blocking_runtime().unwrap() as *const Runtime;
        assert_eq!(first, second);
    }
}
