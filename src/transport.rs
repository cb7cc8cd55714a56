//! HTTP transport to the daemon.
//!
//! One [`HttpTransport`] per session owns at most one keep-alive HTTP/1.1
//! connection, driven by hyper's connection-level client. It is opened
//! lazily on the first exchange and reused for every later call until it is
//! closed, times out, or fails.
//!
//! # Serialization
//!
//! The daemon answers one request at a time per connection, so exchanges
//! are serialized on the slot mutex: send the request, read the whole
//! response, release. The connection is taken out of the slot for the
//! duration of an exchange and only put back once the body has been read.
//! A cancelled, failed or timed-out exchange drops the connection with the
//! future, and the next call reconnects.
//!
//! # Stale connections
//!
//! The daemon closes idle keep-alive connections. A request is moved to a
//! fresh connection only when hyper hands it back unsent: the idle
//! connection was already closed, or closed before the request was
//! written. Once any part of a request may have reached the daemon, a
//! failure is returned as `Error::Transport` and retrying is the caller's
//! decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

use crate::config::{Credentials, RpcConfig};
use crate::error::{Error, Result};

/// Maximum response body size (100MB) to prevent OOM from malicious/buggy servers.
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// One open keep-alive connection.
struct Connection {
    sender: SendRequest<Full<Bytes>>,
    /// Task driving the socket. Aborted when the connection is dropped.
    driver: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Keep-alive HTTP connection to one daemon endpoint.
pub struct HttpTransport {
    url: Url,
    /// `host:port`, used to connect and as the `Host` header.
    authority: String,
    /// Request target including any query.
    path: String,
    credentials: RwLock<Option<Credentials>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    /// The connection, `None` until first use or after teardown.
    slot: Mutex<Option<Connection>>,
    /// How many connections have been opened.
    opened: AtomicU64,
}

impl HttpTransport {
    /// Create a transport. Nothing is opened until the first exchange.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the URL has no host.
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let url = config.url.clone();
        let host = url
            .host_str()
            .ok_or_else(|| Error::Configuration(format!("RPC URL {} has no host", url)))?;
        let port = url
            .port_or_known_default()
            .unwrap_or(config.network.default_rpc_port());
        let authority = format!("{}:{}", host, port);
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            url,
            authority,
            path,
            credentials: RwLock::new(config.credentials.clone()),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            slot: Mutex::new(None),
            opened: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of connections opened over the transport's lifetime.
    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Whether a connection is currently held.
    ///
    /// Reports `true` while an exchange is in flight.
    pub fn is_open(&self) -> bool {
        match self.slot.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(_) => true,
        }
    }

    /// Current credentials.
    pub fn credentials(&self) -> Option<Credentials> {
        match self.credentials.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap the credentials used for subsequent exchanges.
    pub(crate) fn set_credentials(&self, credentials: Credentials) {
        match self.credentials.write() {
            Ok(mut guard) => *guard = Some(credentials),
            Err(poisoned) => *poisoned.into_inner() = Some(credentials),
        }
    }

    /// Send one JSON body and return the decoded JSON response body.
    ///
    /// Non-2xx responses that carry a JSON body are returned as-is: the
    /// daemon reports RPC errors with HTTP 500 or 404.
    ///
    /// # Errors
    ///
    /// - `Error::Authentication` on HTTP 401/403
    /// - `Error::Timeout` when no response arrives in time
    /// - `Error::Transport` when the connection fails or drops
    /// - `Error::Protocol` when the response is not JSON or too large
    pub async fn send<T: Serialize + ?Sized>(&self, body: &T) -> Result<Value> {
        let payload = serde_json::to_vec(body)?;

        let mut slot = self.slot.lock().await;
        match timeout(self.request_timeout, self.exchange(&mut slot, payload)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Request to {} timed out, connection dropped", self.url);
                Err(Error::Timeout(self.request_timeout))
            }
        }
    }

    /// Release the connection. Safe to call any number of times.
    ///
    /// Returns whether a connection was open.
    pub async fn close(&self) -> bool {
        let was_open = self.slot.lock().await.take().is_some();
        if was_open {
            info!("Closed RPC connection to {}", self.url);
        }
        was_open
    }

    /// Non-waiting variant of [`close`](Self::close) for contexts that
    /// cannot await. Leaves an in-flight exchange alone.
    pub fn close_now(&self) -> bool {
        match self.slot.try_lock() {
            Ok(mut slot) => {
                let was_open = slot.take().is_some();
                if was_open {
                    info!("Closed RPC connection to {}", self.url);
                }
                was_open
            }
            Err(_) => false,
        }
    }

    async fn exchange(&self, slot: &mut Option<Connection>, payload: Vec<u8>) -> Result<Value> {
        let (mut conn, reused) = match slot.take() {
            Some(mut conn) => match conn.sender.ready().await {
                Ok(()) => (conn, true),
                Err(e) => {
                    debug!("Idle connection to {} was closed ({}), reconnecting", self.url, e);
                    (self.open().await?, false)
                }
            },
            None => (self.open().await?, false),
        };

        let request = self.build_request(payload)?;
        let response = match conn.sender.try_send_request(request).await {
            Ok(response) => response,
            Err(mut err) => match err.take_message() {
                // Handed back unsent, so the daemon never saw it.
                Some(request) if reused => {
                    debug!(
                        "Connection to {} closed before the request was sent ({}), reconnecting",
                        self.url,
                        err.error()
                    );
                    conn = self.open().await?;
                    conn.sender
                        .send_request(request)
                        .await
                        .map_err(|e| Error::Transport(e.into()))?
                }
                _ => return Err(Error::Transport(err.into_error().into())),
            },
        };

        let status = response.status().as_u16();
        let body = Limited::new(response.into_body(), MAX_RESPONSE_SIZE)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    Error::Protocol(format!(
                        "Response body exceeds maximum {} bytes",
                        MAX_RESPONSE_SIZE
                    ))
                } else {
                    Error::Transport(e)
                }
            })?
            .to_bytes();

        *slot = Some(conn);
        self.decode(status, &body)
    }

    async fn open(&self) -> Result<Connection> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.authority))
            .await
            .map_err(|_| Error::Timeout(self.connect_timeout))?
            .map_err(|e| Error::Transport(e.into()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Transport(e.into()))?;

        let (sender, connection) = http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Transport(e.into()))?;

        let url = self.url.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Connection to {} ended: {}", url, e);
            }
        });

        let count = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Opened RPC connection to {} (#{})", self.url, count);

        Ok(Connection { sender, driver })
    }

    fn build_request(&self, payload: Vec<u8>) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.path.as_str())
            .header(HOST, self.authority.as_str())
            .header(CONTENT_TYPE, "application/json");
        if let Some(creds) = self.credentials() {
            builder = builder.header(AUTHORIZATION, basic_auth(&creds));
        }

        builder
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| Error::Protocol(format!("Invalid request: {}", e)))
    }

    fn decode(&self, status: u16, body: &[u8]) -> Result<Value> {
        if status == 401 || status == 403 {
            return Err(Error::Authentication { status });
        }

        serde_json::from_slice(body).map_err(|e| {
            if (200..300).contains(&status) {
                Error::Protocol(format!("Failed to parse response: {}", e))
            } else {
                Error::Protocol(format!("HTTP {} with non-JSON body", status))
            }
        })
    }
}

/// `Authorization` header value for HTTP basic auth.
fn basic_auth(creds: &Credentials) -> String {
    let token = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", creds.username, creds.password));
    format!("Basic {}", token)
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url.as_str())
            .field("connections_opened", &self.connections_opened())
            .finish_non_exhaustive()
    }
}
