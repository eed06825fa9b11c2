use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::daemon::AppState;
use crate::daemon::dispatcher::Action;
use crate::daemon::lifecycle::{self, StopOutcome};
use crate::db::{Job, JobStatus, JobStore};

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let mut rx = state.events.subscribe();
    let (tx, mpsc_rx) = mpsc::channel::<Result<axum::body::Bytes, std::io::Error>>(64);

    let events = state.events.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = rx.recv() => {
                    if result.is_err() {
                        break;
                    }
                    let chunk = axum::body::Bytes::from("data: update\n\n");
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                _ = events.shutdown_notified() => {
                    break;
                }
            }
        }
    });

    let stream = ReceiverStream::new(mpsc_rx);
    let body = Body::from_stream(stream);

    (
        StatusCode::OK,
        [
            ("content-type", "text/event-stream"),
            ("cache-control", "no-cache"),
        ],
        body,
    )
}

fn open_reader(state: &AppState) -> anyhow::Result<JobStore> {
    JobStore::open_readonly(&state.db_path)
}

fn internal_error(e: anyhow::Error) -> axum::response::Response {
    tracing::error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": e.to_string()})),
    )
        .into_response()
}

#[derive(serde::Deserialize)]
pub struct DownloadRequest {
    pub url: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    pub format: Option<String>,
    #[serde(default)]
    pub extra_params: serde_json::Value,
    #[serde(default)]
    pub force_generic_extractor: bool,
}

pub async fn create_download(
    State(state): State<AppState>,
    Json(body): Json<DownloadRequest>,
) -> impl IntoResponse {
    let mut urls = body.urls;
    if let Some(url) = body.url {
        urls.push(url);
    }

    if urls.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "'url' and 'urls' parameters omitted"
            })),
        )
            .into_response();
    }

    let extra_params = if body.extra_params.is_null() {
        json!({})
    } else {
        body.extra_params
    };

    let job = Job::new_download(
        body.format.as_deref().unwrap_or(""),
        urls.clone(),
        extra_params,
        body.force_generic_extractor,
    );

    tracing::info!(name = %job.name, "download request accepted");
    let _ = state.actions.send(Action::Insert(job));
    state.events.notify();

    (StatusCode::ACCEPTED, Json(json!({"success": true, "urls": urls}))).into_response()
}

#[derive(Default, serde::Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(default)]
    pub show_logs: bool,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        Some(s) => match JobStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"success": false, "error": format!("unknown status: {s}")})),
                )
                    .into_response();
            }
        },
        None => None,
    };

    let result = open_reader(&state)
        .and_then(|store| store.list(state.config.max_log_entries(), status, query.show_logs));

    match result {
        Ok(jobs) => (StatusCode::OK, Json(json!(jobs))).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match open_reader(&state).and_then(|store| store.get(id)) {
        Ok(Some(job)) => (StatusCode::OK, Json(json!(job))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "job not found"})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn stop_job(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    let job = match open_reader(&state).and_then(|store| store.get(id)) {
        Ok(Some(job)) => job,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": "job not found"})),
            )
                .into_response();
        }
        Err(e) => return internal_error(e),
    };

    match lifecycle::stop_job(&job, state.signaler.as_ref(), &state.actions) {
        Ok(StopOutcome::Aborted) | Ok(StopOutcome::Signaled) => {
            state.events.notify();
            (StatusCode::OK, Json(json!({"success": true}))).into_response()
        }
        Ok(StopOutcome::Noop) => {
            (StatusCode::OK, Json(json!({"success": false}))).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn retry_job(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    let job = match open_reader(&state).and_then(|store| store.get(id)) {
        Ok(Some(job)) => job,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": "job not found"})),
            )
                .into_response();
        }
        Err(e) => return internal_error(e),
    };

    let clone = lifecycle::retry_job(&job, &state.actions);
    state.events.notify();

    (
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "urls": clone.urls})),
    )
        .into_response()
}

pub async fn delete_job(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    let _ = state.actions.send(Action::DeleteForce { id });
    state.events.notify();
    tracing::debug!(id, "forced delete queued");
    (StatusCode::ACCEPTED, Json(json!({"success": true})))
}

pub async fn clean_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let _ = state.actions.send(Action::CleanLogs);
    state.events.notify();
    (StatusCode::ACCEPTED, Json(json!({"success": true})))
}

pub async fn purge_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let _ = state.actions.send(Action::PurgeLogs);
    state.events.notify();
    (StatusCode::ACCEPTED, Json(json!({"success": true})))
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let counts = open_reader(&state).and_then(|store| {
        let mut counts = serde_json::Map::new();
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Aborted,
        ] {
            counts.insert(
                status.as_str().to_lowercase(),
                json!(store.count_by_status(status)?),
            );
        }
        Ok(counts)
    });

    match counts {
        Ok(counts) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "stats": {
                    "queue": state.queue.depth(),
                    "jobs": counts,
                }
            })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}
