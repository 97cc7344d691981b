//! Tribe handlers. Every route answers 404 when tribe is disabled.

use crate::api::{error_response, kind_error_response, success_response};
use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use oxtel_tribe::Tribe;
use serde::Deserialize;
use std::sync::Arc;

fn tribe_or_404(state: &AppState, trace_id: &str) -> Result<Arc<Tribe>, Response> {
    state.tribe.clone().ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            trace_id,
            "tribe_disabled",
            "tribe is not enabled on this node",
        )
    })
}

#[derive(Debug, Deserialize)]
pub struct AgreementBody {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MembershipBody {
    /// Defaults to this node.
    #[serde(default)]
    pub member: Option<String>,
}

pub async fn list_agreements(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    let tribe = match tribe_or_404(&state, &trace_id) {
        Ok(tribe) => tribe,
        Err(response) => return response,
    };
    success_response(StatusCode::OK, &trace_id, tribe.agreements())
}

pub async fn add_agreement(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Json(body): Json<AgreementBody>,
) -> Response {
    let tribe = match tribe_or_404(&state, &trace_id) {
        Ok(tribe) => tribe,
        Err(response) => return response,
    };
    if body.name.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "bad_request",
            "agreement name is required",
        );
    }
    match tribe.add_agreement(&body.name) {
        Ok(()) => success_response(StatusCode::CREATED, &trace_id, tribe.agreements()),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn remove_agreement(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let tribe = match tribe_or_404(&state, &trace_id) {
        Ok(tribe) => tribe,
        Err(response) => return response,
    };
    match tribe.remove_agreement(&name) {
        Ok(()) => success_response(StatusCode::OK, &trace_id, tribe.agreements()),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn join_agreement(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<MembershipBody>>,
) -> Response {
    let tribe = match tribe_or_404(&state, &trace_id) {
        Ok(tribe) => tribe,
        Err(response) => return response,
    };
    let member = body
        .and_then(|Json(b)| b.member)
        .unwrap_or_else(|| tribe.node_name().to_string());
    match tribe.join_agreement(&name, &member) {
        Ok(()) => success_response(StatusCode::OK, &trace_id, tribe.agreement(&name).ok()),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn leave_agreement(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<MembershipBody>>,
) -> Response {
    let tribe = match tribe_or_404(&state, &trace_id) {
        Ok(tribe) => tribe,
        Err(response) => return response,
    };
    let member = body
        .and_then(|Json(b)| b.member)
        .unwrap_or_else(|| tribe.node_name().to_string());
    match tribe.leave_agreement(&name, &member) {
        Ok(()) => success_response(StatusCode::OK, &trace_id, tribe.agreement(&name).ok()),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn list_members(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    let tribe = match tribe_or_404(&state, &trace_id) {
        Ok(tribe) => tribe,
        Err(response) => return response,
    };
    success_response(StatusCode::OK, &trace_id, tribe.members())
}
