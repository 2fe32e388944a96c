//! Client side: a `Peer` that forwards each call over one WebSocket.
//!
//! Calls are multiplexed on a single connection and correlated by id. A
//! transport failure drops the connection; the call is retried on a fresh
//! one after the configured backoff, up to the retry limit. Errors the
//! server answers with are returned as-is and never retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::Backoff;
use super::message::{Call, MAX_MESSAGE_BYTES, Response};
use super::peer::Peer;
use super::server::BROKER_PATH;
use crate::domain::{ExecutionState, Filter, LogArtifact, Task, TaskId, WaitOutcome};
use crate::error::PeerError;

/// Requests buffered per connection before callers wait on the writer.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the broker, e.g. `ws://localhost:8000/ws/broker`.
    pub endpoint: String,

    /// How many times a call is retried after a transport failure.
    pub retry_limit: u32,

    pub backoff: Backoff,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("ws://localhost:8000{BROKER_PATH}"),
            retry_limit: u32::MAX,
            backoff: Backoff::default(),
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// One live WebSocket with its reader and writer tasks.
struct Connection {
    outgoing: mpsc::Sender<String>,
    pending: Pending,
    closed: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    async fn open(endpoint: &str) -> Result<Self, PeerError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_MESSAGE_BYTES);
        ws_config.max_frame_size = Some(MAX_MESSAGE_BYTES);
        let (ws, _) = connect_async_with_config(endpoint, Some(ws_config), false)
            .await
            .map_err(|e| PeerError::Transport(format!("connect {endpoint}: {e}")))?;
        debug!(%endpoint, "connected to broker");

        let (mut sink, mut stream) = ws.split();
        let (outgoing, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let writer = tokio::spawn({
            let closed = closed.clone();
            async move {
                while let Some(text) = rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "broker write failed");
                        break;
                    }
                }
                closed.cancel();
                let _ = sink.close().await;
            }
        });

        let reader = tokio::spawn({
            let pending = pending.clone();
            let closed = closed.clone();
            async move {
                while let Some(frame) = stream.next().await {
                    let resp = match frame {
                        Ok(Message::Text(text)) => serde_json::from_str::<Response>(text.as_str()),
                        Ok(Message::Binary(bytes)) => serde_json::from_slice::<Response>(&bytes),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "broker read failed");
                            break;
                        }
                    };
                    match resp {
                        Ok(resp) => {
                            if let Some(tx) = pending.lock().await.remove(&resp.id) {
                                let _ = tx.send(resp);
                            } else if let Some(err) = resp.error {
                                warn!(id = resp.id, error = %err, "broker reported an uncorrelated error");
                            }
                        }
                        Err(e) => warn!(error = %e, "undecodable response from broker"),
                    }
                }
                closed.cancel();
                // Fail every call still in flight.
                pending.lock().await.clear();
            }
        });

        Ok(Self {
            outgoing,
            pending,
            closed,
            reader,
            writer,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn round_trip(&self, id: u64, text: String) -> Result<Response, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing.send(text).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(PeerError::Transport("connection closed".into()));
        }

        tokio::select! {
            biased;
            resp = rx => resp.map_err(|_| PeerError::Transport("connection closed".into())),
            _ = self.closed.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(PeerError::Transport("connection closed".into()))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Remote peer reached over the broker WebSocket.
pub struct RpcClient {
    cfg: ClientConfig,
    next_id: AtomicU64,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl RpcClient {
    /// Create a client. The connection is dialled lazily on the first call.
    pub fn new(cfg: ClientConfig) -> Self {
        Self {
            cfg,
            next_id: AtomicU64::new(1),
            conn: Mutex::new(None),
        }
    }

    /// Drop the current connection, if any.
    pub async fn close(&self) {
        self.conn.lock().await.take();
    }

    async fn connection(&self) -> Result<Arc<Connection>, PeerError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref().filter(|c| !c.is_closed()) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(Connection::open(&self.cfg.endpoint).await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn discard(&self, broken: &Arc<Connection>) {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().is_some_and(|c| Arc::ptr_eq(c, broken)) {
            guard.take();
        }
    }

    async fn try_call(&self, call: Call) -> Result<Response, PeerError> {
        let conn = self.connection().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&call.into_request(id)?)?;

        let resp = conn.round_trip(id, text).await;
        if resp.is_err() {
            self.discard(&conn).await;
        }
        resp
    }

    /// Issue `call`, retrying transport failures with backoff.
    pub async fn call(&self, call: Call) -> Result<Value, PeerError> {
        let method = call.method();
        let mut failures: u32 = 0;
        loop {
            let err = match self.try_call(call.clone()).await {
                Ok(resp) => {
                    return resp.into_result().map_err(|e| PeerError::Remote {
                        code: e.code,
                        message: e.message,
                    });
                }
                Err(e) if e.is_transport() => e,
                Err(e) => return Err(e),
            };

            failures = failures.saturating_add(1);
            if failures > self.cfg.retry_limit {
                return Err(PeerError::RetriesExhausted {
                    attempts: failures,
                    last: err.to_string(),
                });
            }
            let delay = self.cfg.backoff.delay(failures);
            warn!(%method, attempt = failures, ?delay, error = %err, "broker call failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Peer for RpcClient {
    async fn next(&self, filter: &Filter) -> Result<Option<Task>, PeerError> {
        let value = self.call(Call::Next(filter.clone())).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn wait(&self, id: &TaskId) -> Result<WaitOutcome, PeerError> {
        let value = self.call(Call::Wait(id.clone())).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn extend(&self, id: &TaskId) -> Result<(), PeerError> {
        self.call(Call::Extend(id.clone())).await.map(drop)
    }

    async fn init(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
        self.call(Call::Init(id.clone(), state)).await.map(drop)
    }

    async fn update(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
        self.call(Call::Update(id.clone(), state)).await.map(drop)
    }

    async fn upload(&self, id: &TaskId, file: LogArtifact) -> Result<(), PeerError> {
        self.call(Call::Upload(id.clone(), file)).await.map(drop)
    }

    async fn done(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
        self.call(Call::Done(id.clone(), state)).await.map(drop)
    }
}
