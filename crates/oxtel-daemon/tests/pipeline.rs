//! Full pipeline exercise with real plugin subprocesses: load a mock
//! collector and publisher, run a windowed task through the REST API,
//! and verify records land in the publisher's file. Skipped when the
//! mock plugin binary was not built in this test run.

mod common;

use axum::http::StatusCode;
use common::{build_test_context, mock_plugin_binary, send};
use serde_json::json;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn windowed_task_publishes_collected_metrics_to_file() {
    let Some(mock) = mock_plugin_binary() else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };
    let bytes = std::fs::read(&mock).expect("read mock plugin");

    let ctx = build_test_context(false).await;

    ctx.state
        .catalog
        .load("collector-mock", &bytes, None)
        .await
        .expect("collector loads");
    ctx.state
        .catalog
        .load("oxtel-mock-plugin-publisher", &bytes, None)
        .await
        .expect("publisher loads");

    let (status, body, _) = send(&ctx.app, "GET", "/v1/metrics?ns=/intel/mock", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let namespaces: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["namespace"].as_str())
        .collect();
    assert!(namespaces.contains(&"/intel/mock/foo"));

    let out_file = ctx.temp_dir.path().join("published.jsonl");
    let manifest = json!({
        "name": "mock-to-file",
        "schedule": { "interval_ms": 200, "duration_ms": 2000 },
        "workflow": {
            "collect": {
                "metrics": { "/intel/mock/foo": 1 },
                "publish": [ {
                    "plugin_name": "file",
                    "config": { "file": out_file.to_string_lossy() }
                } ]
            }
        }
    });
    let (status, body, _) = send(&ctx.app, "POST", "/v1/tasks", None, Some(manifest)).await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
    let task_id = body["data"]["id"].as_str().unwrap().to_string();
    assert!(matches!(
        body["data"]["state"].as_str().unwrap(),
        "spinning" | "running"
    ));

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let (status, body, _) =
        send(&ctx.app, "GET", &format!("/v1/tasks/{task_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "ended");
    let hits = body["data"]["hit_count"].as_u64().unwrap();
    assert!((8..=12).contains(&hits), "unexpected hit count {hits}");

    let published = std::fs::read_to_string(&out_file).expect("publisher wrote the file");
    let lines: Vec<&str> = published.lines().filter(|l| !l.is_empty()).collect();
    assert!(
        lines.len() >= 5,
        "expected several published records, got {}",
        lines.len()
    );
    // each record is the JSON metric batch the collector produced
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    let metrics = first.as_array().unwrap();
    assert_eq!(metrics[0]["namespace"], "/intel/mock/foo");
    assert_eq!(metrics[0]["version"], 1);

    // teardown: no subprocess survives the unloads
    ctx.state.scheduler.shutdown().await;
    ctx.state.catalog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn swap_replaces_the_catalog_entry() {
    let Some(mock) = mock_plugin_binary() else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };
    let bytes = std::fs::read(&mock).expect("read mock plugin");

    let ctx = build_test_context(false).await;
    ctx.state
        .catalog
        .load("collector-mock", &bytes, None)
        .await
        .expect("v1 loads");

    let old = oxtel_common::types::PluginId::new(
        oxtel_common::types::PluginType::Collector,
        "mock",
        1,
    );
    let (loaded, unloaded) = ctx
        .state
        .catalog
        .swap(&old, "collector-mock-v2", &bytes, None)
        .await
        .expect("swap succeeds");
    assert_eq!(loaded.id.version, 2);
    assert_eq!(unloaded.id.version, 1);

    let listed = ctx.state.catalog.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id.version, 2);

    // metrics re-resolved to the new highest version
    let (status, body, _) =
        send(&ctx.app, "GET", "/v1/metrics?ns=/intel/mock/foo", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["version"], 2);

    ctx.state.catalog.shutdown().await;
}
