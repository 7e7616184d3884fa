//! REST front end.
//!
//! A thin axum adapter over [`Services`]; every handler parses its input,
//! calls one pipeline operation and serializes the result.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Liveness and version |
//! | `POST`   | `/api/describe` | Describe an uploaded image (multipart `file`) |
//! | `POST`   | `/api/rag/upload` | Ingest an uploaded document (multipart `file`) |
//! | `POST`   | `/api/rag/text` | Ingest raw text (`{"text", "source_id"?}`) |
//! | `POST`   | `/api/rag/query` | Answer `?question=` (optional `top_k`, `include_sources`) |
//! | `DELETE` | `/api/rag/clear` | Empty the knowledge base |
//! | `GET`    | `/api/rag/stats` | Models, index size and retrieval settings |
//! | `DELETE` | `/api/cache/clear` | Clear `?cache_type=all\|images\|rag` |
//! | `GET`    | `/api/cache/stats` | Key counts and hit/miss counters |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unsupported_format", "stage": "extract", "message": "..." } }
//! ```
//!
//! `unsupported_format`, `empty_document` and `bad_request` are 400,
//! `too_large` is 413,
//! `backend_unavailable` and `cache_unavailable` are 503, `backend_error`
//! is 502, anything else is 500. `stage` is omitted for errors raised
//! before a pipeline runs.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cache::{CacheScope, CacheStats};
use crate::error::PipelineError;
use crate::models::{Description, Document, QueryAnswer};
use crate::query::QueryOptions;
use crate::service::{RagStats, Services};

/// Build the router over shared services.
pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let max_upload = services.config.server.max_upload_bytes;

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/describe", post(handle_describe))
        .route("/api/rag/upload", post(handle_upload))
        .route("/api/rag/text", post(handle_add_text))
        .route("/api/rag/query", post(handle_query))
        .route("/api/rag/clear", delete(handle_rag_clear))
        .route("/api/rag/stats", get(handle_rag_stats))
        .route("/api/cache/clear", delete(handle_cache_clear))
        .route("/api/cache/stats", get(handle_cache_stats))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(services)
}

/// Serve until Ctrl-C, then persist the index.
pub async fn run_server(services: Arc<Services>) -> anyhow::Result<()> {
    let bind_addr = services.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, router(services.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    services.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    stage: Option<String>,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                stage: self.stage,
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
        stage: None,
        message: message.into(),
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "unsupported_format" | "empty_document" | "bad_request" => StatusCode::BAD_REQUEST,
        "too_large" => StatusCode::PAYLOAD_TOO_LARGE,
        "backend_unavailable" | "cache_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "backend_error" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let code = err.error.code();
        let status = status_for(code);
        if status.is_server_error() {
            error!(stage = %err.stage, error = %err, "request failed");
        } else {
            warn!(stage = %err.stage, error = %err, "request rejected");
        }
        AppError {
            status,
            code: code.to_string(),
            stage: Some(err.stage.to_string()),
            message: err.error.to_string(),
        }
    }
}

// ============ Uploads ============

struct Upload {
    filename: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

/// Pull the `file` part out of a multipart body.
async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("cannot read upload: {}", e)))?;
        return Ok(Upload {
            filename,
            content_type,
            bytes: bytes.to_vec(),
        });
    }
    Err(bad_request("multipart field 'file' is required"))
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

// ============ POST /api/describe ============

async fn handle_describe(
    State(services): State<Arc<Services>>,
    multipart: Multipart,
) -> Result<Json<Description>, AppError> {
    let upload = read_upload(multipart).await?;
    let is_image = upload
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("image/"));
    if !is_image {
        return Err(bad_request("File must be an image"));
    }
    let description = services.vision.describe(&upload.bytes).await?;
    info!(file = %upload.filename, cached = description.cached, "described upload");
    Ok(Json(description))
}

// ============ POST /api/rag/upload ============

#[derive(Serialize)]
struct UploadResponse {
    message: String,
    filename: String,
    chunks: usize,
}

async fn handle_upload(
    State(services): State<Arc<Services>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let upload = read_upload(multipart).await?;
    let report = services
        .ingestor
        .ingest(Document::from_filename(&upload.filename, upload.bytes))
        .await?;
    Ok(Json(UploadResponse {
        message: "Document added to knowledge base".to_string(),
        filename: report.source_id,
        chunks: report.chunk_count,
    }))
}

// ============ POST /api/rag/text ============

#[derive(Deserialize)]
struct AddTextRequest {
    text: String,
    source_id: Option<String>,
}

async fn handle_add_text(
    State(services): State<Arc<Services>>,
    Json(req): Json<AddTextRequest>,
) -> Result<Json<UploadResponse>, AppError> {
    let report = services
        .ingestor
        .ingest(Document::from_text(&req.text, req.source_id.as_deref()))
        .await?;
    Ok(Json(UploadResponse {
        message: "Text added to knowledge base".to_string(),
        filename: report.source_id,
        chunks: report.chunk_count,
    }))
}

// ============ POST /api/rag/query ============

#[derive(Deserialize)]
struct QueryParams {
    question: Option<String>,
    top_k: Option<usize>,
    #[serde(default)]
    include_sources: bool,
}

async fn handle_query(
    State(services): State<Arc<Services>>,
    Query(params): Query<QueryParams>,
) -> Result<Json<QueryAnswer>, AppError> {
    let question = params
        .question
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| bad_request("question must not be empty"))?;
    let options = QueryOptions {
        top_k: params.top_k,
        include_sources: params.include_sources,
    };
    let answer = services.query.answer_with(&question, options).await?;
    Ok(Json(answer))
}

// ============ /api/rag/clear, /api/rag/stats ============

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

async fn handle_rag_clear(State(services): State<Arc<Services>>) -> Result<Json<MessageResponse>, AppError> {
    let removed = services.clear_knowledge_base().await?;
    Ok(Json(MessageResponse {
        message: format!("Knowledge base cleared ({} chunks removed)", removed),
    }))
}

async fn handle_rag_stats(State(services): State<Arc<Services>>) -> Json<RagStats> {
    Json(services.rag_stats().await)
}

// ============ /api/cache/clear, /api/cache/stats ============

#[derive(Deserialize)]
struct CacheClearParams {
    cache_type: Option<String>,
}

#[derive(Serialize)]
struct CacheClearResponse {
    message: String,
    cache_type: String,
}

async fn handle_cache_clear(
    State(services): State<Arc<Services>>,
    Query(params): Query<CacheClearParams>,
) -> Result<Json<CacheClearResponse>, AppError> {
    let scope: CacheScope = params
        .cache_type
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(bad_request)?;
    let message = if services.cache.clear(scope).await {
        format!("Cleared {} cache", scope)
    } else {
        "Cache is disabled; nothing was cleared".to_string()
    };
    Ok(Json(CacheClearResponse {
        message,
        cache_type: scope.to_string(),
    }))
}

async fn handle_cache_stats(State(services): State<Arc<Services>>) -> Json<CacheStats> {
    Json(services.cache.stats().await)
}
