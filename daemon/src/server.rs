//! HTTP control surface for the indexing daemon.
//!
//! JSON in, JSON out, plus one `text/event-stream` endpoint that frames
//! the job's event bus. CORS is permissive: this daemon binds localhost
//! and serves the desktop shell.

use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

use slidemanager_core::{sse_frame, IndexOptions, JobManager};

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
}

pub fn router(manager: Arc<JobManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/index", post(create_index_job))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/pause", post(pause_job))
        .route("/jobs/:id/resume", post(resume_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/events", get(job_events))
        .layer(CorsLayer::permissive())
        .with_state(AppState { manager })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    library_root: String,
    #[serde(default)]
    options: IndexOptions,
}

async fn create_index_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = state
        .manager
        .create_index_job(FsPath::new(&request.library_root), request.options)
        .await?;
    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

async fn list_jobs(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let jobs = state.manager.list_jobs().await?;
    Ok(Json(serde_json::json!({ "jobs": jobs })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<slidemanager_core::JobStatusReport>, ApiError> {
    let report = state
        .manager
        .job_status(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job '{id}' not found")))?;
    Ok(Json(report))
}

async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.pause_job(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.resume_job(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.cancel_job(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Server-sent events: a `hello` frame first, then every bus event as
/// `data: <json>\n\n`. A consumer that lags skips the oldest events and
/// keeps receiving the newest.
async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.manager.job_exists(&id).await? {
        return Err(ApiError::not_found(format!("job '{id}' not found")));
    }
    let receiver = state.manager.subscribe(&id);

    let hello = format!(
        "data: {}\n\n",
        serde_json::json!({ "type": "hello", "job_id": id })
    );
    let events = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(envelope) => Some(Ok::<_, Infallible>(sse_frame(&envelope))),
            // Dropped-oldest gap; the stream continues with newer events.
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        }
    });
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(hello) }).chain(events);

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(e.to_string()))
}
