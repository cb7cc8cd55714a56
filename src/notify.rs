//! ZMQ notification decoding.
//!
//! The daemon publishes multipart messages on its `zmqpub*` endpoints:
//!
//! ```text
//! [ topic ][ body ][ sequence: u32 little-endian ]
//! ```
//!
//! A [`Subscriber`] connects a SUB socket to one endpoint, passes every
//! message through [`RawNotification::from_frames`] and a [`Decoder`], and
//! dispatches the result to the handlers registered for its topic. The
//! decoder can also be used on its own with frames from any other socket.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::client::RpcCaller;
use crate::protocol::Params;

/// Notification topics published by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    HashBlock,
    HashTx,
    RawBlock,
    RawTx,
    Sequence,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::HashBlock,
        Topic::HashTx,
        Topic::RawBlock,
        Topic::RawTx,
        Topic::Sequence,
    ];

    /// Wire name, also the suffix of the `zmqpub*` config key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::HashBlock => "hashblock",
            Topic::HashTx => "hashtx",
            Topic::RawBlock => "rawblock",
            Topic::RawTx => "rawtx",
            Topic::Sequence => "sequence",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| NotifyError::UnknownTopic(s.to_string()))
    }
}

/// Notification decoding errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Expected 3 frames, got {0}")]
    FrameCount(usize),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Malformed {topic} body: {reason}")]
    MalformedBody { topic: Topic, reason: String },

    /// Resolving the notification through RPC failed.
    #[error("RPC lookup failed: {0}")]
    Rpc(#[from] crate::error::Error),

    #[error("ZMQ error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Subscriber is already running")]
    AlreadyRunning,
}

/// A multipart message as received from the subscriber socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub topic: Topic,
    pub body: Vec<u8>,
    pub sequence: u32,
}

impl RawNotification {
    /// Parse the three frames of a published message.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError` for a wrong frame count, an unknown topic, or a
    /// sequence frame that is not 4 bytes.
    pub fn from_frames<F: AsRef<[u8]>>(frames: &[F]) -> Result<Self, NotifyError> {
        let [topic, body, seq] = frames else {
            return Err(NotifyError::FrameCount(frames.len()));
        };

        let topic_str = String::from_utf8_lossy(topic.as_ref());
        let topic: Topic = topic_str.parse()?;

        let seq_bytes: [u8; 4] =
            seq.as_ref()
                .try_into()
                .map_err(|_| NotifyError::MalformedBody {
                    topic,
                    reason: format!("sequence frame is {} bytes", seq.as_ref().len()),
                })?;

        Ok(Self {
            topic,
            body: body.as_ref().to_vec(),
            sequence: u32::from_le_bytes(seq_bytes),
        })
    }

    /// Body as a 32-byte hash in hex.
    fn hash_hex(&self) -> Result<String, NotifyError> {
        if self.body.len() != 32 {
            return Err(NotifyError::MalformedBody {
                topic: self.topic,
                reason: format!("expected 32-byte hash, got {} bytes", self.body.len()),
            });
        }
        Ok(hex::encode(&self.body))
    }
}

/// An asset movement found in a decoded transaction output.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetTransfer {
    pub name: String,
    pub amount: f64,
    /// Script type, e.g. `transfer_asset` or `new_asset`.
    pub kind: String,
    pub vout: u64,
}

/// A decoded notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    BlockHash { hash: String, sequence: u32 },
    TxHash { txid: String, sequence: u32 },
    RawBlock { hex: String, sequence: u32 },
    RawTx { hex: String, sequence: u32 },
    /// Sequence topic: hash plus a one-letter event label.
    Sequence { hash: String, label: char, sequence: u32 },
    /// Block resolved through RPC.
    Block {
        hash: String,
        height: Option<u64>,
        block: Value,
        sequence: u32,
    },
    /// Transaction resolved through RPC.
    Tx {
        txid: String,
        tx: Value,
        assets: Vec<AssetTransfer>,
        sequence: u32,
    },
}

impl Notification {
    pub fn sequence(&self) -> u32 {
        match self {
            Notification::BlockHash { sequence, .. }
            | Notification::TxHash { sequence, .. }
            | Notification::RawBlock { sequence, .. }
            | Notification::RawTx { sequence, .. }
            | Notification::Sequence { sequence, .. }
            | Notification::Block { sequence, .. }
            | Notification::Tx { sequence, .. } => *sequence,
        }
    }
}

/// Collect asset transfers from a decoded transaction's outputs.
pub fn asset_transfers(tx: &Value) -> Vec<AssetTransfer> {
    let Some(vouts) = tx.get("vout").and_then(Value::as_array) else {
        return Vec::new();
    };

    vouts
        .iter()
        .enumerate()
        .filter_map(|(idx, vout)| {
            let script = vout.get("scriptPubKey")?;
            let asset = script.get("asset")?;
            Some(AssetTransfer {
                name: asset.get("name")?.as_str()?.to_string(),
                amount: asset.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
                kind: script
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                vout: vout.get("n").and_then(Value::as_u64).unwrap_or(idx as u64),
            })
        })
        .collect()
}

/// Turns raw notifications into decoded ones.
///
/// With `resolve` enabled, block and transaction topics are looked up
/// through the RPC caller; otherwise only the payload is decoded locally.
pub struct Decoder<C> {
    rpc: C,
    resolve: bool,
}

impl<C: RpcCaller> Decoder<C> {
    /// A decoder that resolves hashes and raw bodies through `rpc`.
    pub fn new(rpc: C) -> Self {
        Self { rpc, resolve: true }
    }

    /// A decoder that never calls the daemon.
    pub fn local(rpc: C) -> Self {
        Self { rpc, resolve: false }
    }

    pub fn resolves(&self) -> bool {
        self.resolve
    }

    /// Decode one notification.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::MalformedBody` for short bodies and
    /// `NotifyError::Rpc` when a lookup fails.
    pub async fn decode(&self, raw: &RawNotification) -> Result<Notification, NotifyError> {
        let sequence = raw.sequence;
        match raw.topic {
            Topic::HashBlock => {
                let hash = raw.hash_hex()?;
                if !self.resolve {
                    return Ok(Notification::BlockHash { hash, sequence });
                }
                let block = self.lookup("getblock", vec![json!(hash), json!(1)]).await?;
                Ok(block_notification(hash, block, sequence))
            }
            Topic::HashTx => {
                let txid = raw.hash_hex()?;
                if !self.resolve {
                    return Ok(Notification::TxHash { txid, sequence });
                }
                let tx = self
                    .lookup("getrawtransaction", vec![json!(txid), json!(true)])
                    .await?;
                Ok(tx_notification(txid, tx, sequence))
            }
            Topic::RawBlock => {
                let hex = hex::encode(&raw.body);
                if !self.resolve {
                    return Ok(Notification::RawBlock { hex, sequence });
                }
                let block = self.lookup("decodeblock", vec![json!(hex)]).await?;
                let hash = block
                    .get("hash")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(block_notification(hash, block, sequence))
            }
            Topic::RawTx => {
                let hex = hex::encode(&raw.body);
                if !self.resolve {
                    return Ok(Notification::RawTx { hex, sequence });
                }
                let tx = self.lookup("decoderawtransaction", vec![json!(hex)]).await?;
                let txid = tx
                    .get("txid")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(tx_notification(txid, tx, sequence))
            }
            Topic::Sequence => {
                if raw.body.len() < 33 {
                    return Err(NotifyError::MalformedBody {
                        topic: raw.topic,
                        reason: format!("expected at least 33 bytes, got {}", raw.body.len()),
                    });
                }
                Ok(Notification::Sequence {
                    hash: hex::encode(&raw.body[..32]),
                    label: raw.body[32] as char,
                    sequence,
                })
            }
        }
    }

    async fn lookup(&self, method: &str, params: Vec<Value>) -> Result<Value, NotifyError> {
        debug!(method, "Resolving notification");
        Ok(self.rpc.invoke(method, Params::Positional(params)).await?)
    }
}

fn block_notification(hash: String, block: Value, sequence: u32) -> Notification {
    Notification::Block {
        hash,
        height: block.get("height").and_then(Value::as_u64),
        block,
        sequence,
    }
}

fn tx_notification(txid: String, tx: Value, sequence: u32) -> Notification {
    Notification::Tx {
        assets: asset_transfers(&tx),
        txid,
        tx,
        sequence,
    }
}

/// Callback invoked for each decoded notification.
pub type Handler = Arc<dyn Fn(Notification) + Send + Sync>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives notifications from one `zmqpub*` endpoint.
///
/// Register handlers with [`on`](Self::on), then [`start`](Self::start) the
/// receive loop. Only topics with at least one handler are subscribed.
/// Messages that fail to parse or decode are logged and skipped.
pub struct Subscriber<C> {
    endpoint: String,
    decoder: Arc<Decoder<C>>,
    handlers: HashMap<Topic, Vec<Handler>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<C: RpcCaller + 'static> Subscriber<C> {
    /// `endpoint` is a ZMQ address such as `tcp://127.0.0.1:28332`.
    pub fn new(endpoint: impl Into<String>, decoder: Decoder<C>) -> Self {
        Self {
            endpoint: endpoint.into(),
            decoder: Arc::new(decoder),
            handlers: HashMap::new(),
            stop: None,
            task: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register `handler` for `topic`. Handlers added after
    /// [`start`](Self::start) take effect on the next start.
    pub fn on<F>(&mut self, topic: Topic, handler: F) -> &mut Self
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.handlers.entry(topic).or_default().push(Arc::new(handler));
        self
    }

    pub fn topics(&self) -> Vec<Topic> {
        Topic::ALL
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Connect, subscribe, and spawn the receive loop on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::AlreadyRunning` if started twice,
    /// `NotifyError::ConnectTimeout` if the endpoint does not answer, or
    /// `NotifyError::Zmq` for socket errors.
    pub async fn start(&mut self) -> Result<(), NotifyError> {
        if self.is_running() {
            return Err(NotifyError::AlreadyRunning);
        }

        let mut socket = SubSocket::new();
        tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(&self.endpoint))
            .await
            .map_err(|_| NotifyError::ConnectTimeout(self.endpoint.clone()))??;

        let topics = self.topics();
        for topic in &topics {
            socket.subscribe(topic.as_str()).await?;
        }
        info!(endpoint = %self.endpoint, ?topics, "Subscribed to notifications");

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(receive_loop(
            socket,
            self.decoder.clone(),
            self.handlers.clone(),
            stop_rx,
        ));
        self.stop = Some(stop_tx);
        self.task = Some(task);
        Ok(())
    }

    /// Stop the receive loop and close the socket. Does nothing if the
    /// subscriber is not running.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Notification loop ended abnormally: {}", e);
            }
        }
    }
}

impl<C> Drop for Subscriber<C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<C> fmt::Debug for Subscriber<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("endpoint", &self.endpoint)
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .field("running", &self.task.is_some())
            .finish()
    }
}

async fn receive_loop<C: RpcCaller>(
    mut socket: SubSocket,
    decoder: Arc<Decoder<C>>,
    handlers: HashMap<Topic, Vec<Handler>>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = &mut stop => break,
            message = socket.recv() => message,
        };

        let frames = match message {
            Ok(message) => message.into_vec(),
            Err(e) => {
                warn!("Notification receive failed: {}", e);
                break;
            }
        };

        let raw = match RawNotification::from_frames(&frames) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Dropping notification: {}", e);
                continue;
            }
        };

        let Some(targets) = handlers.get(&raw.topic) else {
            continue;
        };

        match decoder.decode(&raw).await {
            Ok(notification) => {
                for handler in targets {
                    handler(notification.clone());
                }
            }
            Err(e) => warn!(topic = %raw.topic, sequence = raw.sequence, "Decode failed: {}", e),
        }
    }

    for e in socket.close().await {
        debug!("Error closing subscriber socket: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    /// Records calls and answers from a fixed script.
    struct MockRpc {
        calls: Arc<Mutex<Vec<String>>>,
        answer: Value,
    }

    impl MockRpc {
        fn new(answer: Value) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                answer,
            }
        }
    }

    #[async_trait]
    impl RpcCaller for MockRpc {
        async fn invoke(&self, method: &str, params: Params) -> Result<Value> {
            let params = serde_json::to_string(&params).unwrap();
            self.calls.lock().unwrap().push(format!("{}({})", method, params));
            Ok(self.answer.clone())
        }
    }

    fn hash_frames(topic: &str, byte: u8, seq: u32) -> Vec<Vec<u8>> {
        vec![topic.as_bytes().to_vec(), vec![byte; 32], seq.to_le_bytes().to_vec()]
    }

    #[test]
    fn test_from_frames_parses_sequence() {
        let raw = RawNotification::from_frames(&hash_frames("hashblock", 0xab, 42)).unwrap();
        assert_eq!(raw.topic, Topic::HashBlock);
        assert_eq!(raw.sequence, 42);
        assert_eq!(raw.body.len(), 32);
    }

    #[test]
    fn test_from_frames_rejects_bad_input() {
        let two: Vec<Vec<u8>> = vec![b"hashtx".to_vec(), vec![0; 32]];
        assert!(matches!(
            RawNotification::from_frames(&two),
            Err(NotifyError::FrameCount(2))
        ));

        let unknown = hash_frames("rawthing", 0, 1);
        assert!(matches!(
            RawNotification::from_frames(&unknown),
            Err(NotifyError::UnknownTopic(_))
        ));

        let short_seq: Vec<Vec<u8>> = vec![b"hashtx".to_vec(), vec![0; 32], vec![1, 2]];
        assert!(matches!(
            RawNotification::from_frames(&short_seq),
            Err(NotifyError::MalformedBody { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_decoder_does_not_call_rpc() {
        let mock = Arc::new(MockRpc::new(Value::Null));
        let decoder = Decoder::local(mock.clone());
        let raw = RawNotification::from_frames(&hash_frames("hashtx", 0x01, 7)).unwrap();

        let decoded = decoder.decode(&raw).await.unwrap();

        assert_eq!(
            decoded,
            Notification::TxHash {
                txid: "01".repeat(32),
                sequence: 7
            }
        );
        assert!(mock.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_block_hash_resolved_through_rpc() {
        let mock = Arc::new(MockRpc::new(json!({"hash": "ab", "height": 1316459, "tx": []})));
        let decoder = Decoder::new(mock.clone());
        let raw = RawNotification::from_frames(&hash_frames("hashblock", 0xab, 3)).unwrap();

        let decoded = decoder.decode(&raw).await.unwrap();

        match decoded {
            Notification::Block { hash, height, .. } => {
                assert_eq!(hash, "ab".repeat(32));
                assert_eq!(height, Some(1316459));
            }
            other => panic!("Expected Block, got {:?}", other),
        }
        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("getblock(["));
    }

    #[tokio::test]
    async fn test_tx_assets_extracted() {
        let tx = json!({
            "txid": "ff",
            "vin": [],
            "vout": [
                {"n": 0, "value": 1.0, "scriptPubKey": {"type": "pubkeyhash"}},
                {"n": 1, "value": 0.0, "scriptPubKey": {
                    "type": "transfer_asset",
                    "asset": {"name": "MANTICORE", "amount": 25.0}
                }}
            ]
        });
        let mock = Arc::new(MockRpc::new(tx));
        let decoder = Decoder::new(mock.clone());
        let raw = RawNotification {
            topic: Topic::RawTx,
            body: vec![0x02, 0x00],
            sequence: 9,
        };

        let decoded = decoder.decode(&raw).await.unwrap();

        match decoded {
            Notification::Tx { txid, assets, .. } => {
                assert_eq!(txid, "ff");
                assert_eq!(
                    assets,
                    vec![AssetTransfer {
                        name: "MANTICORE".into(),
                        amount: 25.0,
                        kind: "transfer_asset".into(),
                        vout: 1,
                    }]
                );
            }
            other => panic!("Expected Tx, got {:?}", other),
        }
        assert_eq!(
            mock.calls.lock().unwrap()[0],
            r#"decoderawtransaction(["0200"])"#
        );
    }

    #[tokio::test]
    async fn test_sequence_topic_label() {
        let mut body = vec![0x11; 32];
        body.push(b'C');
        let raw = RawNotification {
            topic: Topic::Sequence,
            body,
            sequence: 5,
        };
        let decoder = Decoder::new(MockRpc::new(Value::Null));

        let decoded = decoder.decode(&raw).await.unwrap();
        assert_eq!(
            decoded,
            Notification::Sequence {
                hash: "11".repeat(32),
                label: 'C',
                sequence: 5
            }
        );
        assert_eq!(decoded.sequence(), 5);
    }

    #[test]
    fn test_topic_round_trip_names() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
    }

    #[tokio::test]
    async fn test_subscriber_dispatches_by_topic() {
        use bytes::Bytes;
        use zeromq::{PubSocket, SocketSend, ZmqMessage};

        let mut publisher = PubSocket::new();
        let endpoint = publisher.bind("tcp://127.0.0.1:0").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut subscriber = Subscriber::new(endpoint.to_string(), Decoder::local(MockRpc::new(Value::Null)));
        subscriber.on(Topic::HashBlock, move |n| {
            let _ = tx.send(n);
        });
        assert_eq!(subscriber.topics(), vec![Topic::HashBlock]);

        subscriber.start().await.unwrap();
        assert!(subscriber.is_running());
        assert!(matches!(subscriber.start().await, Err(NotifyError::AlreadyRunning)));

        // PUB drops messages until the subscription has propagated.
        let received = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                for (topic, seq) in [("hashtx", 1u32), ("hashblock", 2u32)] {
                    let frames = vec![
                        Bytes::from(topic),
                        Bytes::from(vec![0xcd; 32]),
                        Bytes::from(seq.to_le_bytes().to_vec()),
                    ];
                    publisher.send(ZmqMessage::try_from(frames).unwrap()).await.unwrap();
                }
                if let Ok(Some(n)) =
                    tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
                {
                    break n;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(
            received,
            Notification::BlockHash {
                hash: "cd".repeat(32),
                sequence: 2
            }
        );

        subscriber.stop().await;
        assert!(!subscriber.is_running());
        subscriber.stop().await;
    }
}
