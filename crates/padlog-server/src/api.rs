use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::Method,
    routing::{get, post},
    Json, Router,
};
use padlog_shared::{ChannelId, ChannelMetadata, LogMessage, ShardRouter, UserKey};
use padlog_store::{CheckpointPos, Cursor, HistoryBound, HistoryRange, StoredMessage};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::error::ServerError;
use crate::pipeline::{Accepted, Pipeline, Submission};

/// Largest request body accepted (blob channels carry big payloads).
const MAX_BODY: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub router: ShardRouter,
    pub config: Arc<NodeConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/route/:key", get(route_key))
        .route("/channel/:id/message", post(post_message))
        .route("/channel/:id/history", get(history).post(history_or_create))
        .route("/channel/:id/history/full", get(full_history))
        .route("/channel/:id/history/range", get(history_range))
        .route("/channel/:id/index", get(index_summary))
        .route("/channel/:id/invalidate", post(invalidate))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    shard: String,
    shard_count: u32,
    cached_channels: usize,
}

#[derive(Serialize)]
struct RouteResponse {
    key: String,
    shard: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest {
    #[serde(default)]
    seq: i64,
    #[serde(default)]
    sender: Option<String>,
    payload: String,
    #[serde(default)]
    author_key: Option<String>,
    #[serde(default)]
    pre_validated: bool,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum MessageResponse {
    Stored { offset: u64, hash: String, time: Option<i64> },
    Duplicate,
    Presence,
}

#[derive(Serialize)]
struct HistoryResponse {
    messages: Vec<StoredMessage>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct HistoryRequest {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    metadata: Option<ChannelMetadata>,
}

#[derive(Deserialize)]
struct RangeQuery {
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    checkpoints: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexSummary {
    checkpoints: Vec<CheckpointPos>,
    hash_count: usize,
    total_size: u64,
    line_count: u64,
    unconventional: bool,
    skipped_lines: u64,
    last_checkpoint_id: Option<String>,
}

/// Parse a channel id and make sure this node owns it.
fn owned_channel(state: &AppState, raw: &str) -> Result<ChannelId, ServerError> {
    let channel = ChannelId::parse(raw)?;
    state.pipeline.check_owner(&channel)?;
    Ok(channel)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        shard: state.pipeline.local_shard().to_string(),
        shard_count: state.config.shard_count,
        cached_channels: state.pipeline.store().registry().len(),
    })
}

async fn route_key(State(state): State<AppState>, Path(key): Path<String>) -> Json<RouteResponse> {
    let shard = state.router.route_bytes(key.as_bytes()).to_string();
    Json(RouteResponse { key, shard })
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, ServerError> {
    let channel = ChannelId::parse(&id)?;

    let mut message = LogMessage::new(req.sender, channel.as_str(), req.payload);
    message.seq = req.seq;
    let submission = Submission {
        channel,
        message,
        author_key: req.author_key.map(UserKey),
        pre_validated: req.pre_validated,
    };

    let response = match state.pipeline.submit(submission).await? {
        Accepted::Stored(ack) => MessageResponse::Stored {
            offset: ack.offset,
            hash: ack.message.hash().to_string(),
            time: ack.message.time,
        },
        Accepted::Duplicate => MessageResponse::Duplicate,
        Accepted::Presence(_) => MessageResponse::Presence,
    };
    Ok(Json(response))
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ServerError> {
    let channel = owned_channel(&state, &id)?;
    let cursor = Cursor::from_query(query.cursor.as_deref());

    let messages = state.pipeline.store().get_history(&channel, &cursor).await?;
    debug!(channel = %channel, count = messages.len(), "History served");
    Ok(Json(HistoryResponse { messages }))
}

async fn history_or_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<HistoryRequest>,
) -> Result<Json<HistoryResponse>, ServerError> {
    let channel = owned_channel(&state, &id)?;
    let cursor = Cursor::from_query(req.cursor.as_deref());
    let store = state.pipeline.store();

    let messages = match req.metadata {
        Some(mut metadata) => {
            metadata.channel = channel.as_str().to_string();
            if metadata.created.is_none() {
                metadata.created = Some(chrono::Utc::now().timestamp_millis());
            }
            store.get_history_or_create(&channel, &cursor, &metadata).await?
        }
        None => store.get_history(&channel, &cursor).await?,
    };
    Ok(Json(HistoryResponse { messages }))
}

async fn full_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, ServerError> {
    let channel = owned_channel(&state, &id)?;
    let messages = state.pipeline.store().get_full_history(&channel).await?;
    Ok(Json(HistoryResponse { messages }))
}

async fn history_range(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<HistoryResponse>, ServerError> {
    let channel = owned_channel(&state, &id)?;
    let bound = match (query.limit, query.checkpoints) {
        (Some(_), Some(_)) => {
            return Err(ServerError::BadRequest(
                "Use either limit or checkpoints, not both".into(),
            ));
        }
        (Some(n), None) => Some(HistoryBound::Messages(n)),
        (None, Some(n)) => Some(HistoryBound::Checkpoints(n)),
        (None, None) => None,
    };
    let range = HistoryRange {
        from: query.from.filter(|h| !h.is_empty()),
        to: query.to.filter(|h| !h.is_empty()),
        bound,
    };

    let messages = state.pipeline.store().get_history_range(&channel, &range).await?;
    Ok(Json(HistoryResponse { messages }))
}

async fn index_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IndexSummary>, ServerError> {
    let channel = owned_channel(&state, &id)?;
    let index = state.pipeline.store().get_index(&channel).await?;

    Ok(Json(IndexSummary {
        hash_count: index.hash_count(),
        checkpoints: index.checkpoints,
        total_size: index.total_size,
        line_count: index.line_count,
        unconventional: index.unconventional,
        skipped_lines: index.skipped_lines,
        last_checkpoint_id: index.last_checkpoint_id,
    }))
}

async fn invalidate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let channel = owned_channel(&state, &id)?;
    state.pipeline.store().invalidate(&channel);

    info!(channel = %channel, "Channel cache invalidated via API");
    Ok(Json(serde_json::json!({ "invalidated": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
