//! HTTP server.
//!
//! Thin JSON glue over [`App`]: every handler validates its input, calls
//! one library operation and maps [`RagError`] onto an HTTP status.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Status, version, whether the provider credential is present |
//! | `POST` | `/answer` | Answer a question from a category |
//! | `POST` | `/ingest` | Ingest already-extracted text into a category |
//! | `GET`  | `/progress-stream?id=` | Server-sent ingestion progress |
//! | `POST` | `/delete` | Remove a document and its chunks |
//! | `GET`  | `/vector/list?category=` | Sources indexed in a category |
//! | `GET`  | `/docs?category=` | Retained documents in a category |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `dimension_mismatch` (409),
//! `extraction_failed` (422), `configuration` (503), `provider_error` (502),
//! `io_error` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};
use uuid::Uuid;

use crate::answer::{AnswerOutcome, AnswerRequest};
use crate::app::App;
use crate::config::{self, Config};
use crate::error::RagError;
use crate::index_manager::run_blocking;
use crate::ingest::{IngestReport, IngestRequest, RemoveReport};
use crate::progress::ProgressLog;

/// Interval between progress-log snapshots on `/progress-stream`.
const PROGRESS_POLL: Duration = Duration::from_millis(500);

type AppState = Arc<App>;

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = Arc::new(App::from_config(config)?);
    let bind_addr = config.server.bind.clone();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(
        bind = %bind_addr,
        embedding = config.embedding.is_enabled(),
        completion = config.completion.is_enabled(),
        usage_reporting = app.usage.is_enabled(),
        "server listening"
    );
    println!("docqa server listening on http://{}", bind_addr);

    axum::serve(listener, router(app)).await?;
    Ok(())
}

pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/answer", post(handle_answer))
        .route("/ingest", post(handle_ingest))
        .route("/progress-stream", get(handle_progress_stream))
        .route("/delete", post(handle_delete))
        .route("/vector/list", get(handle_vector_list))
        .route("/docs", get(handle_docs))
        .layer(cors)
        .with_state(app)
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

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::DimensionMismatch { .. } => StatusCode::CONFLICT,
            RagError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::Provider(_) => StatusCode::BAD_GATEWAY,
            RagError::Io(_) | RagError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Trimmed, non-empty value of a required field.
fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("{} must not be empty", field)))
}

#[derive(Deserialize)]
struct CategoryQuery {
    category: Option<String>,
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    api_key_present: bool,
    embedding_provider: String,
    completion_provider: String,
    embedding_enabled: bool,
    completion_enabled: bool,
    usage_reporting: bool,
}

async fn handle_health(State(app): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_key_present: config::api_key_present(),
        embedding_provider: app.config.embedding.provider.clone(),
        completion_provider: app.config.completion.provider.clone(),
        embedding_enabled: app.config.embedding.is_enabled(),
        completion_enabled: app.config.completion.is_enabled(),
        usage_reporting: app.usage.is_enabled(),
    })
}

// ============ POST /answer ============

#[derive(Deserialize)]
struct AnswerBody {
    question: Option<String>,
    category: Option<String>,
    user_id: Option<String>,
    thread_id: Option<String>,
    top_k: Option<usize>,
    region: Option<String>,
}

async fn handle_answer(
    State(app): State<AppState>,
    Json(body): Json<AnswerBody>,
) -> Result<Json<AnswerOutcome>, AppError> {
    let req = AnswerRequest {
        question: required(body.question, "question")?,
        category: required(body.category, "category")?,
        user_id: body.user_id.unwrap_or_else(|| "default".to_string()),
        thread_id: body.thread_id.unwrap_or_else(|| "default".to_string()),
        top_k: body.top_k.unwrap_or(app.config.retrieval.top_k).max(1),
        region_filter: body.region.filter(|r| !r.trim().is_empty()),
    };
    let outcome = app.answers.answer(&req).await?;
    Ok(Json(outcome))
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestBody {
    source: Option<String>,
    category: Option<String>,
    text: Option<String>,
    region: Option<String>,
    uploaded_by: Option<String>,
    progress_id: Option<String>,
}

#[derive(Serialize)]
struct IngestResponse {
    progress_id: String,
    #[serde(flatten)]
    report: IngestReport,
}

async fn handle_ingest(
    State(app): State<AppState>,
    Json(body): Json<IngestBody>,
) -> Result<Json<IngestResponse>, AppError> {
    let req = IngestRequest {
        source: required(body.source, "source")?,
        category: required(body.category, "category")?,
        region: body.region,
        uploaded_by: body.uploaded_by.unwrap_or_else(|| "system".to_string()),
    };
    let text = body.text.unwrap_or_default();
    let progress_id = body
        .progress_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let reporter = Arc::new(app.progress.reporter(progress_id.clone()));
    let result = app.ingestor.ingest_text(&req, &text, reporter).await;
    app.progress.schedule_cleanup(
        progress_id.clone(),
        Duration::from_secs(app.config.progress.cleanup_delay_secs),
    );

    Ok(Json(IngestResponse {
        progress_id,
        report: result?,
    }))
}

// ============ GET /progress-stream ============

#[derive(Deserialize)]
struct ProgressQuery {
    id: Option<String>,
}

async fn handle_progress_stream(
    State(app): State<AppState>,
    Query(query): Query<ProgressQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let id = required(query.id, "id")?;
    debug!(progress_id = %id, "progress stream opened");
    Ok(Sse::new(progress_events(Arc::clone(&app.progress), id)).keep_alive(KeepAlive::default()))
}

struct Cursor {
    log: Arc<ProgressLog>,
    id: String,
    next: usize,
    seen: bool,
    finished: bool,
    first: bool,
}

/// True for the last message an ingestion writes.
fn is_terminal(message: &str) -> bool {
    message == "Done" || message.starts_with("Failed:")
}

/// Poll the log every [`PROGRESS_POLL`] and emit new messages in order. The
/// stream ends after a terminal message, or when an entry it has seen is
/// cleaned up.
fn progress_events(
    log: Arc<ProgressLog>,
    id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let cursor = Cursor {
        log,
        id,
        next: 0,
        seen: false,
        finished: false,
        first: true,
    };
    stream::unfold(cursor, |mut cursor| async move {
        if cursor.finished {
            return None;
        }
        loop {
            if !cursor.first {
                tokio::time::sleep(PROGRESS_POLL).await;
            }
            cursor.first = false;

            let present = cursor.log.contains(&cursor.id);
            if !present && cursor.seen {
                return None;
            }
            cursor.seen |= present;

            let batch = cursor.log.since(&cursor.id, cursor.next);
            if batch.is_empty() {
                continue;
            }
            cursor.next += batch.len();
            cursor.finished = batch.iter().any(|m| is_terminal(m));
            let events: Vec<Result<Event, Infallible>> = batch
                .into_iter()
                .map(|m| Ok(Event::default().data(m)))
                .collect();
            return Some((stream::iter(events), cursor));
        }
    })
    .flatten()
}

// ============ POST /delete ============

#[derive(Deserialize)]
struct DeleteBody {
    source: Option<String>,
    category: Option<String>,
}

async fn handle_delete(
    State(app): State<AppState>,
    Json(body): Json<DeleteBody>,
) -> Result<Json<RemoveReport>, AppError> {
    let source = required(body.source, "source")?;
    let category = required(body.category, "category")?;
    let report = app.ingestor.remove_document(&category, &source).await?;
    Ok(Json(report))
}

// ============ GET /vector/list ============

#[derive(Serialize)]
struct SourcesResponse {
    category: String,
    sources: Vec<String>,
}

async fn handle_vector_list(
    State(app): State<AppState>,
    Query(query): Query<CategoryQuery>,
) -> Result<Json<SourcesResponse>, AppError> {
    let category = required(query.category, "category")?;
    let manager = app.index.clone();
    let cat = category.clone();
    let sources = run_blocking(move || manager.list_sources(&cat)).await?;
    Ok(Json(SourcesResponse { category, sources }))
}

// ============ GET /docs ============

#[derive(Serialize)]
struct DocsResponse {
    category: String,
    documents: Vec<String>,
}

async fn handle_docs(
    State(app): State<AppState>,
    Query(query): Query<CategoryQuery>,
) -> Result<Json<DocsResponse>, AppError> {
    let category = required(query.category, "category")?;
    let documents = app.ingestor.list_documents(&category)?;
    Ok(Json(DocsResponse {
        category,
        documents,
    }))
}
