//! Metric catalog handlers. `ns` accepts `/a`, `/a/` and `/a/*`
//! interchangeably; `ver=0` or no `ver` means the highest version.

use crate::api::{error_response, kind_error_response, success_response};
use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct MetricQuery {
    #[serde(default)]
    pub ns: Option<String>,
    #[serde(default)]
    pub ver: Option<u32>,
}

pub async fn list_metrics(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Query(query): Query<MetricQuery>,
) -> Response {
    let version = query.ver.unwrap_or(0);
    match state.catalog.metrics.list(query.ns.as_deref(), version) {
        Ok(metrics) => success_response(StatusCode::OK, &trace_id, metrics),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn get_metric(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Query(query): Query<MetricQuery>,
) -> Response {
    let Some(ns) = query.ns.as_deref() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "bad_request",
            "missing ns query parameter",
        );
    };
    let version = query.ver.unwrap_or(0);
    let meta = match state.catalog.metrics.get(ns, version) {
        Ok(meta) => meta,
        Err(e) => return kind_error_response(&trace_id, e.kind(), &e.to_string()),
    };

    // attach the owning plugin's config-policy rules table
    let mut info = meta.info();
    if let Ok(owner) = state.catalog.get_info(&meta.owner) {
        info.policy = owner.config_policy;
    }
    success_response(StatusCode::OK, &trace_id, info)
}
