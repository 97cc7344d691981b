#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use oxtel_common::event::EventBus;
use oxtel_common::types::TrustLevel;
use oxtel_control::artifact::ArtifactStore;
use oxtel_control::{CatalogConfig, PluginCatalog};
use oxtel_daemon::app;
use oxtel_daemon::config::DaemonConfig;
use oxtel_daemon::state::{AppState, AuthSettings};
use oxtel_plugin::signing::SignatureVerifier;
use oxtel_scheduler::{Scheduler, SchedulerConfig};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const TEST_USER: &str = "oxtel";
pub const TEST_PASSWORD: &str = "changeme";

pub struct TestContext {
    pub temp_dir: TempDir,
    pub state: AppState,
    pub app: axum::Router,
}

pub async fn build_test_context(auth_enabled: bool) -> TestContext {
    oxtel_common::id::init(1);

    let temp_dir = tempfile::tempdir().expect("tempdir");
    let artifacts =
        ArtifactStore::new(Some(temp_dir.path().join("plugins"))).expect("artifact store");
    let events = Arc::new(EventBus::new());
    let verifier = SignatureVerifier::new(TrustLevel::Disabled);

    let catalog = PluginCatalog::new(CatalogConfig::default(), verifier, events.clone(), artifacts);
    let scheduler = Scheduler::new(SchedulerConfig::default(), catalog.clone(), events);
    catalog.set_task_reaper(scheduler.clone());

    let state = AppState {
        catalog,
        scheduler,
        tribe: None,
        auth: Arc::new(AuthSettings {
            enabled: auth_enabled,
            username: TEST_USER.to_string(),
            password: TEST_PASSWORD.to_string(),
        }),
        start_time: Utc::now(),
        config: Arc::new(DaemonConfig::default()),
    };

    let app = app::build_http_app(state.clone());
    TestContext {
        temp_dir,
        state,
        app,
    }
}

pub fn basic_auth_header() -> String {
    format!(
        "Basic {}",
        BASE64.encode(format!("{TEST_USER}:{TEST_PASSWORD}"))
    )
}

pub async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    auth: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value, Option<String>) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header("Authorization", auth);
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request should build");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should be handled");
    let status = response.status();
    let trace_id = response
        .headers()
        .get("x-trace-id")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, json, trace_id)
}

/// A handmade multipart request for the plugin upload endpoints.
pub async fn send_multipart(
    app: &axum::Router,
    uri: &str,
    parts: &[(&str, &[u8])],
    compression: Option<&str>,
) -> (StatusCode, Value) {
    const BOUNDARY: &str = "oxtel-test-boundary";
    let mut body = Vec::new();
    for (filename, data) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(compression) = compression {
        builder = builder.header("Plugin-Compression", compression);
    }
    let request = builder.body(Body::from(body)).expect("request should build");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should be handled");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Locate the mock plugin binary built alongside the workspace. Returns
/// None when this test run did not build it (e.g. single-package runs).
pub fn mock_plugin_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let debug_dir = exe.parent()?.parent()?;
    let candidate = debug_dir.join("oxtel-mock-plugin");
    candidate.exists().then_some(candidate)
}
