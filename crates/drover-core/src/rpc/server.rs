//! Server side: WebSocket broker endpoint plus a small admin API.
//!
//! Routes:
//! - GET  /ws/broker              - agent connection (WebSocket upgrade)
//! - POST /api/tasks              - enqueue a task
//! - GET  /api/tasks/{id}         - reported status of a task
//! - POST /api/tasks/{id}/cancel  - cancel a task
//! - GET  /api/queue              - queue counts

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{Call, MAX_MESSAGE_BYTES, Request, Response, RpcError};
use super::peer::{Peer, QueuePeer, dispatch};
use crate::domain::{Labels, Task, TaskId};
use crate::error::{QueueError, StoreError};
use crate::ports::{StatusStore, TaskStatus};
use crate::queue::{QueueConfig, TaskQueue};

/// Path agents connect to.
pub const BROKER_PATH: &str = "/ws/broker";

/// Responses buffered per connection before request handlers wait on the writer.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub queue: QueueConfig,
    /// How often lapsed leases are swept outside of polls.
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            queue: QueueConfig::default(),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Shared handles for every route.
#[derive(Clone)]
pub struct ServerState {
    pub queue: Arc<dyn TaskQueue>,
    pub store: Arc<dyn StatusStore>,
}

impl ServerState {
    pub fn new(queue: Arc<dyn TaskQueue>, store: Arc<dyn StatusStore>) -> Self {
        Self { queue, store }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route(BROKER_PATH, get(broker))
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/{id}", get(task_status))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/queue", get(queue_info))
        .with_state(state)
}

/// Serve until `shutdown` resolves. Also runs the lease reaper.
pub async fn serve<F>(
    listener: TcpListener,
    state: ServerState,
    reap_interval: Duration,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stop = CancellationToken::new();
    let reaper = tokio::spawn(reap_loop(state.queue.clone(), reap_interval, stop.clone()));

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "broker listening");
    }
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    stop.cancel();
    let _ = reaper.await;
    result
}

async fn reap_loop(queue: Arc<dyn TaskQueue>, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match queue.reap_expired().await {
            Ok(0) => {}
            Ok(n) => info!(reaped = n, "requeued tasks with lapsed leases"),
            Err(e) => warn!(error = %e, "lease sweep failed"),
        }
    }
}

async fn broker(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let peer: Arc<dyn Peer> = Arc::new(QueuePeer::new(state.queue, state.store));
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .max_frame_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| serve_connection(socket, peer))
}

/// Answer calls on one agent connection until it closes.
///
/// Calls run concurrently so a held-open `wait` does not block the rest.
/// Calls still running when the connection drops are aborted.
pub async fn serve_connection(socket: WebSocket, peer: Arc<dyn Peer>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Response>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let text = match serde_json::to_string(&resp) {
                Ok(text) => text,
                Err(e) => {
                    warn!(id = resp.id, error = %e, "cannot encode response");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    debug!("agent connected");
    let mut calls = JoinSet::new();
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        };
        match frame {
            Message::Text(text) => accept(text.as_str().as_bytes(), &peer, &tx, &mut calls).await,
            Message::Binary(bytes) => accept(&bytes, &peer, &tx, &mut calls).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
        while calls.try_join_next().is_some() {}
    }

    calls.abort_all();
    drop(tx);
    let _ = writer.await;
    debug!("agent disconnected");
}

async fn accept(
    frame: &[u8],
    peer: &Arc<dyn Peer>,
    tx: &mpsc::Sender<Response>,
    calls: &mut JoinSet<()>,
) {
    let req: Request = match serde_json::from_slice(frame) {
        Ok(req) => req,
        Err(e) => {
            // No usable id; answer on id 0.
            let _ = tx.send(Response::err(0, RpcError::parse(e))).await;
            return;
        }
    };

    let id = req.id;
    let call = match Call::decode(&req.method, req.params) {
        Ok(call) => call,
        Err(e) => {
            debug!(id, method = %req.method, error = %e, "rejected call");
            let _ = tx.send(Response::err(id, e)).await;
            return;
        }
    };

    let peer = peer.clone();
    let tx = tx.clone();
    calls.spawn(async move {
        let method = call.method();
        let resp = match dispatch(peer.as_ref(), call).await {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                debug!(id, %method, error = %e, "call failed");
                Response::err(id, e.into())
            }
        };
        let _ = tx.send(resp).await;
    });
}

/// Admin API error, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no status recorded for task {0}")]
    NoStatus(TaskId),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let status = match &self {
            ApiError::Queue(QueueError::NotFound(_)) | ApiError::NoStatus(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Queue(QueueError::Duplicate(_)) => StatusCode::CONFLICT,
            ApiError::Queue(QueueError::NotLeased(_)) => StatusCode::CONFLICT,
            ApiError::Queue(QueueError::Unavailable(_)) | ApiError::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitTaskRequest {
    #[serde(default)]
    id: Option<TaskId>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    labels: Labels,
    /// Minutes; 0 means the agent default.
    #[serde(default)]
    timeout: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitTaskResponse {
    id: TaskId,
}

/// POST /api/tasks
async fn submit_task(
    State(state): State<ServerState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = req
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(TaskId::generate);

    let mut task = Task::new(id.clone(), req.data).with_timeout_minutes(req.timeout);
    task.labels = req.labels;
    state.queue.push(task).await?;
    info!(task_id = %id, "task enqueued");

    Ok((StatusCode::CREATED, Json(SubmitTaskResponse { id })))
}

/// GET /api/tasks/{id}
async fn task_status(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatus>, ApiError> {
    let id = TaskId::from(id);
    match state.store.get(&id).await? {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::NoStatus(id)),
    }
}

/// POST /api/tasks/{id}/cancel
async fn cancel_task(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = TaskId::from(id);
    state.queue.cancel(&id).await?;
    info!(task_id = %id, "task cancelled");
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/queue
async fn queue_info(State(state): State<ServerState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queue.info().await?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use rstest::rstest;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::domain::ExecutionState;
    use crate::impls::InMemoryStatusStore;
    use crate::queue::InMemoryQueue;

    fn app() -> (Router, Arc<InMemoryStatusStore>) {
        let store = Arc::new(InMemoryStatusStore::new());
        let state = ServerState::new(Arc::new(InMemoryQueue::default()), store.clone());
        (router(state), store)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let req = HttpRequest::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap();

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn pending(app: &Router) -> u64 {
        let (status, counts) = send(app, "GET", "/api/queue", None).await;
        assert_eq!(status, StatusCode::OK);
        counts["pending"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn submit_enqueues_and_rejects_duplicates() {
        let (app, _) = app();
        let task = json!({"id": "t1", "data": {"steps": []}, "labels": {"platform": "linux/amd64"}});

        let (status, body) = send(&app, "POST", "/api/tasks", Some(task.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "t1");
        assert_eq!(pending(&app).await, 1);

        let (status, body) = send(&app, "POST", "/api/tasks", Some(task)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("t1"));
        assert_eq!(pending(&app).await, 1);
    }

    #[tokio::test]
    async fn submit_without_id_generates_one() {
        let (app, _) = app();

        let (status, body) = send(&app, "POST", "/api/tasks", Some(json!({"data": {}}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(!body["id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_evicts_pending_task() {
        let (app, _) = app();

        let (status, _) = send(&app, "POST", "/api/tasks/ghost/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(&app, "POST", "/api/tasks", Some(json!({"id": "t1"}))).await;
        let (status, _) = send(&app, "POST", "/api/tasks/t1/cancel", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(pending(&app).await, 0);

        // Evicted, so a second cancel has nothing to find.
        let (status, _) = send(&app, "POST", "/api/tasks/t1/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_is_served_once_reported() {
        let (app, store) = app();

        let (status, body) = send(&app, "GET", "/api/tasks/t1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        store
            .init(&TaskId::from("t1"), ExecutionState::started_now())
            .await
            .unwrap();
        let (status, body) = send(&app, "GET", "/api/tasks/t1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["state"].is_object());
    }

    #[rstest]
    #[case(ApiError::Queue(QueueError::NotFound(TaskId::from("t1"))), StatusCode::NOT_FOUND)]
    #[case(ApiError::NoStatus(TaskId::from("t1")), StatusCode::NOT_FOUND)]
    #[case(ApiError::Queue(QueueError::Duplicate(TaskId::from("t1"))), StatusCode::CONFLICT)]
    #[case(ApiError::Queue(QueueError::Unavailable("down".into())), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ApiError::Store(StoreError::Unavailable("down".into())), StatusCode::SERVICE_UNAVAILABLE)]
    fn api_errors_map_to_http_status(#[case] err: ApiError, #[case] expected: StatusCode) {
        assert_eq!(err.into_response().status(), expected);
    }
}
