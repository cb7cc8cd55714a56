//! In-process fake daemon for integration tests.
//!
//! Speaks just enough HTTP/1.1 to stand in for evrmored: keep-alive
//! connections, `Content-Length` request bodies, and a JSON reply chosen by
//! a handler closure. Runs on its own thread with its own current-thread
//! runtime, so blocking clients can be tested from plain `#[test]`s.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use evrmore_rpc::RpcConfig;

/// A request as seen by the daemon.
#[derive(Debug, Clone)]
pub struct Request {
    pub body: Value,
    pub authorization: Option<String>,
}

impl Request {
    /// The `method` of a single request.
    pub fn method(&self) -> &str {
        self.body["method"].as_str().unwrap_or_default()
    }
}

/// What the daemon does with a request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// 200 with this JSON body.
    Json(Value),
    /// Given status with this JSON body.
    Status(u16, Value),
    /// Given status, empty body.
    Empty(u16),
    /// Wait, then answer 200 with this body.
    Delayed(Duration, Value),
    /// Answer 200, then close the connection without `Connection: close`.
    JsonThenClose(Value),
    /// Write these bytes verbatim, then close.
    Raw(Vec<u8>),
    /// Close without answering.
    Hangup,
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// Running fake daemon. Shuts down on drop.
pub struct FakeDaemon {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Request>>>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FakeDaemon {
    /// Start a daemon answering every request with `handler`.
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind failed");
        std_listener.set_nonblocking(true).expect("set_nonblocking failed");
        let addr = std_listener.local_addr().expect("local_addr failed");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let thread = {
            let accepted = accepted.clone();
            let requests = requests.clone();
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("daemon runtime");
                runtime.block_on(async move {
                    let listener = TcpListener::from_std(std_listener).expect("from_std failed");
                    loop {
                        tokio::select! {
                            _ = &mut shutdown_rx => break,
                            accepted_conn = listener.accept() => {
                                let Ok((stream, _)) = accepted_conn else { continue };
                                accepted.fetch_add(1, Ordering::SeqCst);
                                tokio::spawn(serve(stream, handler.clone(), requests.clone()));
                            }
                        }
                    }
                });
            })
        };

        Self {
            addr,
            accepted,
            requests,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    /// A daemon that answers every call with `result`.
    pub fn answering(result: Value) -> Self {
        Self::start(move |req| Reply::Json(rpc_result(&req.body, result.clone())))
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Config pointing at this daemon with explicit credentials.
    pub fn config(&self) -> RpcConfig {
        RpcConfig::new(&self.url(), "evruser", "evrpass").expect("valid config")
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// Method names in arrival order.
    pub fn methods(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| r.method().to_string())
            .collect()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A successful response to `request`, echoing its id.
pub fn rpc_result(request: &Value, result: Value) -> Value {
    json!({"result": result, "error": null, "id": request["id"]})
}

/// An error response to `request`, echoing its id.
pub fn rpc_error(request: &Value, code: i64, message: &str) -> Value {
    json!({"result": null, "error": {"code": code, "message": message}, "id": request["id"]})
}

/// Serve requests on one connection until the client goes away.
async fn serve(stream: TcpStream, handler: Handler, requests: Arc<Mutex<Vec<Request>>>) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    while let Some(request) = read_request(&mut reader).await {
        requests.lock().unwrap().push(request.clone());

        let (status, body, close) = match handler(&request) {
            Reply::Json(body) => (200, Some(body), false),
            Reply::Status(status, body) => (status, Some(body), false),
            Reply::Empty(status) => (status, None, false),
            Reply::Delayed(delay, body) => {
                tokio::time::sleep(delay).await;
                (200, Some(body), false)
            }
            Reply::JsonThenClose(body) => (200, Some(body), true),
            Reply::Raw(bytes) => {
                let _ = writer.write_all(&bytes).await;
                return;
            }
            Reply::Hangup => return,
        };

        let payload = body.map(|b| b.to_string()).unwrap_or_default();
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            status,
            reason(status),
            payload.len(),
            payload
        );
        if writer.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        if close {
            return;
        }
    }
}

/// Read one request, or `None` once the connection is closed.
async fn read_request<R>(reader: &mut R) -> Option<Request>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.ok()? == 0 {
        return None;
    }

    let mut content_length = 0usize;
    let mut authorization = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse().ok()?;
            } else if key.trim().eq_ignore_ascii_case("Authorization") {
                authorization = Some(value.trim().to_string());
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.ok()?;
    Some(Request {
        body: serde_json::from_slice(&body).ok()?,
        authorization,
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// `Authorization` value a client should send for `user:password`.
pub fn basic_auth(user: &str, password: &str) -> String {
    use base64::Engine;
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password))
    )
}
