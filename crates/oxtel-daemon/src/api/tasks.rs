//! Task handlers: CRUD, lifecycle transitions, manifest export, and the
//! SSE watch stream.

use crate::api::{error_response, kind_error_response, success_response};
use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use oxtel_common::types::TaskManifest;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

fn parse_task_id(trace_id: &str, raw: &str) -> Result<Uuid, Response> {
    raw.parse().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "bad_request",
            &format!("invalid task id: {raw}"),
        )
    })
}

pub async fn create_task(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Json(manifest): Json<TaskManifest>,
) -> Response {
    match state.scheduler.create(manifest).await {
        Ok(info) => success_response(StatusCode::CREATED, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn list_tasks(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    success_response(StatusCode::OK, &trace_id, state.scheduler.list())
}

pub async fn get_task(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_task_id(&trace_id, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.scheduler.get(id) {
        Ok(info) => success_response(StatusCode::OK, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn export_task(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_task_id(&trace_id, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.scheduler.manifest(id) {
        Ok(manifest) => success_response(StatusCode::OK, &trace_id, manifest),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn start_task(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_task_id(&trace_id, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.scheduler.start(id) {
        Ok(info) => success_response(StatusCode::OK, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn stop_task(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_task_id(&trace_id, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.scheduler.stop(id) {
        Ok(info) => success_response(StatusCode::OK, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn enable_task(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_task_id(&trace_id, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.scheduler.enable(id) {
        Ok(info) => success_response(StatusCode::OK, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn remove_task(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_task_id(&trace_id, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.scheduler.remove(id) {
        Ok(info) => success_response(StatusCode::OK, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

/// SSE stream of a task's lifecycle and fire events.
pub async fn watch_task(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_task_id(&trace_id, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let receiver = match state.scheduler.watch(id) {
        Ok(receiver) => receiver,
        Err(e) => return kind_error_response(&trace_id, e.kind(), &e.to_string()),
    };

    let stream = BroadcastStream::new(receiver).filter_map(|event| {
        let event = event.ok()?;
        SseEvent::default().json_data(&event).ok().map(Ok::<_, std::convert::Infallible>)
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
