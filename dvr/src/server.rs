//! HTTP server of the DVR.
//!
//! Routes:
//!   GET /dvr/status                → aggregated status (registry, storage, queue)
//!   GET /dvr/source/declare        → legacy feed server self-registration
//!   GET /dvr/storage/top           → years with recordings
//!   GET /dvr/storage/yearly        → months with recordings
//!   GET /dvr/storage/monthly       → days with recordings
//!   GET /dvr/storage/daily         → recordings of one day
//!   GET /dvr/storage/download      → zip of (part of) one day
//!   GET /dvr/storage/videos/...    → the archive files
//!   anything else                  → static web pages

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{debug, info};

use crate::calendar::{self, DateQuery, QueryError, VIDEO_URI};
use crate::events::EventSink;
use crate::registry::Registry;
use crate::status::{self, StatusDocument, StorageStatus};
use crate::storage::Storage;
use crate::transfer::TransferQueue;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub host: String,
    pub registry: Arc<Mutex<Registry>>,
    pub queue: Arc<Mutex<TransferQueue>>,
    pub storage: Arc<Storage>,
    pub events: Arc<dyn EventSink>,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, format!("HTTP Error {}: {self}", status.as_u16())).into_response()
    }
}

pub fn router(state: AppState, public_dir: PathBuf) -> Router {
    let videos = ServeDir::new(state.storage.root());
    Router::new()
        .route("/dvr/status", get(dvr_status))
        .route("/dvr/source/declare", get(declare))
        .route("/dvr/storage/top", get(top))
        .route("/dvr/storage/yearly", get(yearly))
        .route("/dvr/storage/monthly", get(monthly))
        .route("/dvr/storage/daily", get(daily))
        .route("/dvr/storage/download", get(download))
        .nest_service(VIDEO_URI, videos)
        .fallback_service(ServeDir::new(public_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET]),
        )
        .with_state(state)
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(
    state: AppState,
    listen_addr: &str,
    public_dir: PathBuf,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let app = router(state, public_dir);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("DVR HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn dvr_status(State(state): State<AppState>) -> Json<StatusDocument> {
    // statvfs blocks, so measure before taking the locks.
    let storage = state.storage.clone();
    let measured = tokio::task::spawn_blocking(move || StorageStatus::measure(&storage))
        .await
        .ok()
        .flatten();

    let registry = state.registry.lock().await;
    let queue = state.queue.lock().await;
    Json(status::snapshot(
        &state.host,
        &registry,
        measured,
        &queue,
        Utc::now(),
    ))
}

fn json_listing<T: serde::Serialize>(value: &T) -> Result<Response, QueryError> {
    let text = calendar::to_json(value)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], text).into_response())
}

async fn top(State(state): State<AppState>) -> Result<Response, QueryError> {
    json_listing(&calendar::years(state.storage.root())?)
}

async fn yearly(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Result<Response, QueryError> {
    json_listing(&calendar::yearly(state.storage.root(), &query)?)
}

async fn monthly(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Result<Response, QueryError> {
    json_listing(&calendar::monthly(state.storage.root(), &query)?)
}

async fn daily(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Result<Response, QueryError> {
    json_listing(&calendar::daily(state.storage.root(), &query)?)
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Result<Response, QueryError> {
    let name = calendar::archive_name(&query)?;
    let root = state.storage.root().to_path_buf();
    let path = tokio::task::spawn_blocking(move || {
        calendar::archive(&root, &query, &std::env::temp_dir())
    })
    .await
    .map_err(|e| QueryError::Internal(e.to_string()))??;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| QueryError::Internal(e.to_string()))?;
    // The open file stays readable; the name disappears right away.
    let _ = tokio::fs::remove_file(&path).await;
    debug!("Sending archive {name}");

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Query string of the legacy declaration.
#[derive(Debug, Default, Deserialize)]
pub struct Declaration {
    pub name: Option<String>,
    pub admin: Option<String>,
    pub url: Option<String>,
    pub available: Option<String>,
    pub devices: Option<String>,
}

async fn declare(
    State(state): State<AppState>,
    Query(declaration): Query<Declaration>,
) -> Result<StatusCode, QueryError> {
    let mut registry = state.registry.lock().await;
    apply_declaration(&mut registry, state.events.as_ref(), &declaration, Utc::now())?;
    Ok(StatusCode::OK)
}

/// Old feed servers periodically declare themselves instead of being
/// discovered.  They do not report a version token.
pub fn apply_declaration(
    registry: &mut Registry,
    events: &dyn EventSink,
    declaration: &Declaration,
    now: DateTime<Utc>,
) -> Result<(), QueryError> {
    let (Some(name), Some(url), Some(available)) = (
        declaration.name.as_deref(),
        declaration.url.as_deref(),
        declaration.available.as_deref(),
    ) else {
        return Err(QueryError::MissingParameters);
    };
    let admin = declaration.admin.as_deref().unwrap_or(url);
    let admin_url = format!("http://{admin}/");
    if registry.record_server_seen(name, 0, &admin_url, available, now) {
        events.event("CCTV", name, "ADDED", &format!("ADMIN {admin_url}"));
    }

    let devices = declaration.devices.as_deref().unwrap_or_default();
    for device in devices.split(['+', ' ']).filter(|d| !d.is_empty()) {
        let feed = format!("{name}:{device}");
        let stream = format!("http://{url}/{device}/stream");
        if registry.register_camera(&feed, Some(name), &stream, now) {
            events.event("FEED", &feed, "ADDED", &format!("STREAM {stream}"));
        }
    }
    Ok(())
}
