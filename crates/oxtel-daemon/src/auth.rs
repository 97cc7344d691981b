//! HTTP basic authentication for the control plane. A fixed username and
//! a password resolved from config, a password file, or the environment.

use crate::api::error_response;
use crate::logging::TraceId;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

fn unauthorized(trace_id: &str, msg: &str) -> Response {
    let mut response = error_response(StatusCode::UNAUTHORIZED, trace_id, "unauthorized", msg);
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Basic realm=\"oxtel\""),
    );
    response
}

pub async fn basic_auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !state.auth.enabled {
        return next.run(req).await;
    }

    let trace_id = req
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default();

    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(encoded) = header_value.and_then(|h| h.strip_prefix("Basic ")) else {
        return unauthorized(&trace_id, "missing authorization header");
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return unauthorized(&trace_id, "invalid authorization header");
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized(&trace_id, "invalid authorization header");
    };
    let Some((username, password)) = credentials.split_once(':') else {
        return unauthorized(&trace_id, "invalid authorization header");
    };

    if username != state.auth.username || password != state.auth.password {
        return unauthorized(&trace_id, "invalid credentials");
    }

    next.run(req).await
}
