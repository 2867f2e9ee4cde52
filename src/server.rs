//! Relay HTTP and WebSocket server.
//!
//! # Endpoints
//!
//! | Method   | Path                     | Description                                   |
//! |----------|--------------------------|-----------------------------------------------|
//! | `GET`    | `/ws/import`             | Upload socket (see [`crate::protocol`])       |
//! | `GET`    | `/health`                | Health check (returns version)                |
//! | `GET`    | `/api/stages`            | Registered stages; `?kind=` filters           |
//! | `GET`    | `/api/files/{id}`        | Ingestion record for one file                 |
//! | `DELETE` | `/api/files/{id}`        | Cancel; `?remove=true` also drops the record  |
//! | `POST`   | `/api/files/{id}/retry`  | Re-run a finished file                        |
//! | `POST`   | `/api/snapshot`          | Latest status for `{"fileIDs": [...]}`        |
//! | `POST`   | `/api/reset`             | Drop every ingestion record                   |
//! | `GET`    | `/api/documents`         | Documents held by the `memory` sink           |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no ingestion record for file f1" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `already_running` (409).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser clients can
//! talk to the relay directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use ingest_relay_core::error::ReassemblyError;
use ingest_relay_core::models::{IngestionRecord, IngestionState, StageKind, StatusEvent};
use ingest_relay_core::stage::{StageInfo, StageRegistry};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{Notification, StatusBroadcaster};
use crate::config::Config;
use crate::intake::TransferIntake;
use crate::orchestrator::{Orchestrator, SubmitError};
use crate::protocol::{
    ClientControl, ClientFrame, DataBatch, ServerControl, ServerFrame, SnapshotEntry,
    StatusMessage,
};
use crate::stages::{self, sink::DocumentSummary, MemoryStore};

/// Everything the server's handlers share. Built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Arc<StageRegistry>,
    pub intake: Arc<TransferIntake>,
    pub orchestrator: Arc<Orchestrator>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub memory: Arc<MemoryStore>,
}

impl AppContext {
    /// Register the built-in stages and wire up the components.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let mut registry = StageRegistry::new();
        let builtins = stages::register_builtin_stages(&mut registry, &config)
            .await
            .context("registering built-in stages")?;
        Self::with_registry(config, registry, builtins.memory)
    }

    /// Wire up the components around an already populated registry.
    /// Embedders use this to add their own stages next to the built-ins.
    pub fn with_registry(
        config: Config,
        registry: StageRegistry,
        memory: Arc<MemoryStore>,
    ) -> anyhow::Result<Self> {
        stages::check_defaults(&registry, &config)?;
        let registry = Arc::new(registry);
        let broadcaster = Arc::new(StatusBroadcaster::new());
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            broadcaster.clone(),
            config.pipeline.to_pipeline_config(),
            config.pipeline.embed_batch_size,
        ));
        let intake = Arc::new(TransferIntake::new(config.transfer.session_max_age()));
        Ok(Self {
            config: Arc::new(config),
            registry,
            intake,
            orchestrator,
            broadcaster,
            memory,
        })
    }

    /// Handle one client frame. Returns the reply for this client, if any;
    /// status updates reach clients through the broadcaster instead.
    pub fn handle_frame(&self, text: &str) -> Option<ServerFrame> {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "unreadable client frame");
                return None;
            }
        };
        match frame {
            ClientFrame::Control(ClientControl::Ping) => Some(ServerFrame::Control(ServerControl::Pong)),
            ClientFrame::Control(ClientControl::Snapshot { file_ids }) => {
                Some(ServerFrame::Control(self.snapshot(&file_ids)))
            }
            ClientFrame::Control(ClientControl::Cancel { file_id }) => {
                self.cancel(&file_id);
                None
            }
            ClientFrame::Fragment(batch) => self.ingest_fragment(batch),
        }
    }

    fn ingest_fragment(&self, batch: DataBatch) -> Option<ServerFrame> {
        let transfer = match self.intake.accept(batch) {
            Ok(Some(transfer)) => transfer,
            Ok(None) => return None,
            Err(e) => {
                self.report_reassembly_error(&e);
                return None;
            }
        };
        match self.orchestrator.submit_transfer(transfer) {
            Ok(()) => None,
            Err(SubmitError::AlreadyRunning { file_id, state }) => {
                let message = SubmitError::AlreadyRunning {
                    file_id: file_id.clone(),
                    state,
                }
                .to_string();
                warn!(file_id = %file_id, "upload ignored: file is still being processed");
                Some(ServerFrame::Status(StatusMessage {
                    file_id,
                    status: state.wire_status().to_string(),
                    message,
                    took: 0.0,
                    stage: None,
                    timestamp: Utc::now(),
                }))
            }
            Err(e) => {
                warn!(error = %e, "submit failed");
                None
            }
        }
    }

    fn report_reassembly_error(&self, err: &ReassemblyError) {
        let Some(file_id) = err.transfer_id() else {
            warn!(error = %err, "fragment rejected");
            return;
        };
        warn!(file_id = %file_id, error = %err, "transfer discarded");
        self.broadcaster.publish(StatusEvent {
            file_id: file_id.to_string(),
            state: IngestionState::Error,
            stage_name: None,
            message: err.to_string(),
            elapsed_ms: 0,
            timestamp: Utc::now(),
        });
    }

    /// Drop expired transfers and tell their clients to start over.
    pub fn sweep_transfers(&self) -> Vec<String> {
        let expired = self.intake.sweep();
        for transfer_id in &expired {
            self.report_reassembly_error(&ReassemblyError::Expired {
                transfer_id: transfer_id.clone(),
            });
        }
        expired
    }

    /// Run [`sweep_transfers`](Self::sweep_transfers) every `interval`
    /// until the task is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ctx.sweep_transfers();
            }
        })
    }

    /// Cancel a transfer still being received, or a file in the pipeline.
    pub fn cancel(&self, file_id: &str) -> bool {
        if self.intake.cancel(file_id) {
            info!(file_id = %file_id, "partial transfer cancelled");
            self.broadcaster.publish(StatusEvent {
                file_id: file_id.to_string(),
                state: IngestionState::Error,
                stage_name: None,
                message: "cancelled".to_string(),
                elapsed_ms: 0,
                timestamp: Utc::now(),
            });
            return true;
        }
        self.orchestrator.cancel(file_id)
    }

    pub fn snapshot(&self, file_ids: &[String]) -> ServerControl {
        ServerControl::Snapshot {
            files: self
                .broadcaster
                .snapshot(file_ids)
                .into_iter()
                .map(SnapshotEntry::from)
                .collect(),
        }
    }
}

/// Starts the relay server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let ctx = AppContext::build(config).await?;

    for stage in ctx.registry.list_all() {
        info!(kind = %stage.kind, name = %stage.name, "stage available");
    }

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!("relay listening on http://{} (upload socket at /ws/import)", bind_addr);
    serve(listener, ctx).await
}

/// Serve `ctx` on an already bound listener, with the stale-transfer
/// sweeper running alongside.
pub async fn serve(listener: TcpListener, ctx: AppContext) -> anyhow::Result<()> {
    let sweeper = ctx.spawn_sweeper(ctx.config.transfer.sweep_interval());
    let result = axum::serve(listener, router(ctx)).await;
    sweeper.abort();
    result?;
    Ok(())
}

pub fn router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/import", get(handle_ws_upgrade))
        .route("/health", get(handle_health))
        .route("/api/stages", get(handle_list_stages))
        .route(
            "/api/files/{id}",
            get(handle_get_file).delete(handle_cancel_file),
        )
        .route("/api/files/{id}/retry", post(handle_retry_file))
        .route("/api/snapshot", post(handle_snapshot))
        .route("/api/reset", post(handle_reset))
        .route("/api/documents", get(handle_list_documents))
        .layer(cors)
        .with_state(ctx)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::NotFound(_) => not_found(err.to_string()),
            SubmitError::AlreadyRunning { .. } => AppError {
                status: StatusCode::CONFLICT,
                code: "already_running".to_string(),
                message: err.to_string(),
            },
        }
    }
}

// ============ GET /ws/import ============

async fn handle_ws_upgrade(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: AppContext) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let observer_id = format!("ws-{}", Uuid::new_v4());
    let forward = tx.clone();
    ctx.broadcaster.subscribe(&observer_id, move |notification| {
        let frame = match notification {
            Notification::Status(event) => ServerFrame::Status(StatusMessage::from(event)),
            Notification::Derived(derived) => ServerFrame::Derived(derived.clone()),
        };
        let _ = forward.send(frame.to_json());
    });
    info!(observer = %observer_id, "client connected");

    // Single writer: broadcast frames and direct replies share one queue.
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if let Some(reply) = ctx.handle_frame(text.as_str()) {
                    let _ = tx.send(reply.to_json());
                }
            }
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    if let Some(reply) = ctx.handle_frame(text) {
                        let _ = tx.send(reply.to_json());
                    }
                }
                Err(_) => debug!("ignoring non-UTF-8 binary frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    ctx.broadcaster.unsubscribe(&observer_id);
    send_task.abort();
    info!(observer = %observer_id, "client disconnected");
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/stages ============

#[derive(Deserialize)]
struct StagesQuery {
    kind: Option<String>,
}

#[derive(Serialize)]
struct StageListResponse {
    stages: Vec<StageInfo>,
}

async fn handle_list_stages(
    State(ctx): State<AppContext>,
    Query(query): Query<StagesQuery>,
) -> Result<Json<StageListResponse>, AppError> {
    let stages = match query.kind {
        Some(kind) => {
            let kind: StageKind = kind.parse().map_err(bad_request)?;
            ctx.registry.list_available(kind)
        }
        None => ctx.registry.list_all(),
    };
    Ok(Json(StageListResponse { stages }))
}

// ============ /api/files/{id} ============

async fn handle_get_file(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<IngestionRecord>, AppError> {
    ctx.orchestrator
        .record(&id)
        .map(Json)
        .ok_or_else(|| not_found(format!("no ingestion record for file {}", id)))
}

#[derive(Deserialize)]
struct CancelQuery {
    #[serde(default)]
    remove: bool,
}

#[derive(Serialize)]
struct CancelResponse {
    #[serde(rename = "fileID")]
    file_id: String,
    cancelled: bool,
    removed: bool,
}

async fn handle_cancel_file(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<CancelResponse>, AppError> {
    let known = ctx.intake.sessions().contains(&id) || ctx.orchestrator.get_state(&id).is_some();
    if !known {
        return Err(not_found(format!("no transfer or ingestion record for file {}", id)));
    }
    let cancelled = ctx.cancel(&id);
    let removed = query.remove && ctx.orchestrator.remove(&id).is_some();
    Ok(Json(CancelResponse {
        file_id: id,
        cancelled,
        removed,
    }))
}

async fn handle_retry_file(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    ctx.orchestrator.retry(&id)?;
    Ok(StatusCode::ACCEPTED)
}

// ============ POST /api/snapshot ============

#[derive(Deserialize)]
struct SnapshotRequest {
    #[serde(rename = "fileIDs")]
    file_ids: Vec<String>,
}

#[derive(Serialize)]
struct SnapshotResponse {
    files: Vec<SnapshotEntry>,
}

async fn handle_snapshot(
    State(ctx): State<AppContext>,
    Json(req): Json<SnapshotRequest>,
) -> Json<SnapshotResponse> {
    let files = ctx
        .broadcaster
        .snapshot(&req.file_ids)
        .into_iter()
        .map(SnapshotEntry::from)
        .collect();
    Json(SnapshotResponse { files })
}

// ============ POST /api/reset ============

#[derive(Serialize)]
struct ResetResponse {
    removed: usize,
}

async fn handle_reset(State(ctx): State<AppContext>) -> Json<ResetResponse> {
    Json(ResetResponse {
        removed: ctx.orchestrator.reset(),
    })
}

// ============ GET /api/documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentSummary>,
}

async fn handle_list_documents(State(ctx): State<AppContext>) -> Json<DocumentListResponse> {
    Json(DocumentListResponse {
        documents: ctx.memory.list(),
    })
}
