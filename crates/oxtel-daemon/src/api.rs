pub mod metrics;
pub mod plugins;
pub mod tasks;
pub mod tribe;

use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use oxtel_common::error::ErrorKind;
use serde::Serialize;
use serde_json::Value;

/// Uniform response envelope.
#[derive(Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
    pub data: Option<T>,
}

pub fn success_response<T>(status: StatusCode, trace_id: &str, data: T) -> Response
where
    T: Serialize,
{
    (
        status,
        Json(ApiResponse {
            err_code: 0,
            err_msg: "success".to_string(),
            trace_id: trace_id.to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

pub fn success_empty_response(status: StatusCode, trace_id: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: 0,
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "unauthorized" => 1002,
        "not_found" => 1004,
        "conflict" => 1005,
        "policy_error" => 1006,
        "resource_exhausted" => 1007,
        "integrity_error" => 1008,
        "plugin_error" => 1101,
        "tribe_disabled" => 1102,
        "internal_error" => 1500,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

/// Map the shared error taxonomy onto HTTP statuses.
pub fn kind_to_http(kind: ErrorKind) -> (StatusCode, &'static str) {
    match kind {
        ErrorKind::Validation => (StatusCode::BAD_REQUEST, "bad_request"),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        ErrorKind::Conflict => (StatusCode::CONFLICT, "conflict"),
        ErrorKind::Policy => (StatusCode::BAD_REQUEST, "policy_error"),
        ErrorKind::Resource => (StatusCode::SERVICE_UNAVAILABLE, "resource_exhausted"),
        ErrorKind::Integrity => (StatusCode::INTERNAL_SERVER_ERROR, "integrity_error"),
        ErrorKind::PluginRuntime => (StatusCode::INTERNAL_SERVER_ERROR, "plugin_error"),
        ErrorKind::Transport | ErrorKind::Fatal => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

pub fn kind_error_response(trace_id: &str, kind: ErrorKind, msg: &str) -> Response {
    let (status, code) = kind_to_http(kind);
    error_response(status, trace_id, code, msg)
}

#[derive(Serialize)]
struct HealthResponse {
    version: String,
    uptime_secs: i64,
    plugins_loaded: usize,
    tasks: usize,
    tribe_enabled: bool,
}

pub async fn health(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let uptime = (Utc::now() - state.start_time).num_seconds();
    success_response(
        StatusCode::OK,
        &trace_id,
        HealthResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: uptime,
            plugins_loaded: state.catalog.list().len(),
            tasks: state.scheduler.list().len(),
            tribe_enabled: state.tribe.is_some(),
        },
    )
}
