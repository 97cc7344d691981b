//! Catalog behavior against real mock plugin subprocesses: load/unload
//! round trips, duplicate detection, collection through the manager
//! trait, cache behavior, pool capping, and config-policy enforcement.
//! Skipped when the mock plugin binary was not built in this test run.

use oxtel_common::event::EventBus;
use oxtel_common::manage::MetricManager;
use oxtel_common::policy::{ConfigMap, ConfigValue};
use oxtel_common::types::{CollectRequest, Payload, PluginId, PluginType, TrustLevel};
use oxtel_control::artifact::ArtifactStore;
use oxtel_control::{CatalogConfig, ControlError, PluginCatalog};
use oxtel_plugin::signing::SignatureVerifier;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn mock_plugin_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let debug_dir = exe.parent()?.parent()?;
    let candidate = debug_dir.join("oxtel-mock-plugin");
    candidate.exists().then_some(candidate)
}

struct Harness {
    catalog: Arc<PluginCatalog>,
    bytes: Vec<u8>,
    _tmp: tempfile::TempDir,
}

fn harness(cfg: CatalogConfig) -> Option<Harness> {
    let mock = mock_plugin_binary()?;
    let bytes = std::fs::read(mock).expect("read mock plugin");
    let tmp = tempfile::tempdir().expect("tempdir");
    let artifacts = ArtifactStore::new(Some(tmp.path().join("plugins"))).expect("store");
    let catalog = PluginCatalog::new(
        cfg,
        SignatureVerifier::new(TrustLevel::Disabled),
        Arc::new(EventBus::new()),
        artifacts,
    );
    Some(Harness {
        catalog,
        bytes,
        _tmp: tmp,
    })
}

fn collector_id() -> PluginId {
    PluginId::new(PluginType::Collector, "mock", 1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_then_unload_restores_the_empty_catalog() {
    let Some(h) = harness(CatalogConfig::default()) else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };

    assert!(h.catalog.list().is_empty());
    assert!(h.catalog.metrics.is_empty());

    let info = h
        .catalog
        .load("collector-mock", &h.bytes, None)
        .await
        .expect("load succeeds");
    assert_eq!(info.id, collector_id());
    assert!(!info.signed);
    assert_eq!(h.catalog.list().len(), 1);
    assert_eq!(h.catalog.metrics.list(None, 0).unwrap().len(), 3);

    let unloaded = h.catalog.unload(&collector_id()).await.expect("unload");
    assert_eq!(unloaded.id, collector_id());

    assert!(h.catalog.list().is_empty());
    assert!(h.catalog.metrics.is_empty());
    assert_eq!(h.catalog.running_instances(&collector_id()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_load_is_a_conflict() {
    let Some(h) = harness(CatalogConfig::default()) else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };

    h.catalog
        .load("collector-mock", &h.bytes, None)
        .await
        .expect("first load");
    let err = h
        .catalog
        .load("collector-mock", &h.bytes, None)
        .await
        .expect_err("second load of the same triple fails");
    assert!(matches!(err, ControlError::AlreadyLoaded { .. }));
    assert_eq!(err.to_string(), "plugin is already loaded");
    assert_eq!(h.catalog.list().len(), 1);

    h.catalog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unversioned_references_resolve_to_the_highest_version() {
    let Some(h) = harness(CatalogConfig::default()) else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };

    h.catalog
        .load("collector-mock", &h.bytes, None)
        .await
        .expect("v1");
    h.catalog
        .load("collector-mock-v2", &h.bytes, None)
        .await
        .expect("v2");

    let latest = PluginId::latest(PluginType::Collector, "mock");
    assert_eq!(h.catalog.resolve(&latest).unwrap().version, 2);

    // unversioned unload takes down the highest version only
    let unloaded = h.catalog.unload(&latest).await.expect("unload");
    assert_eq!(unloaded.id.version, 2);
    assert_eq!(h.catalog.resolve(&latest).unwrap().version, 1);

    h.catalog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collect_hits_cache_within_ttl() {
    let Some(h) = harness(CatalogConfig {
        cache_ttl: Duration::from_secs(5),
        ..CatalogConfig::default()
    }) else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };
    h.catalog
        .load("collector-mock", &h.bytes, None)
        .await
        .expect("load");

    let requests = vec![CollectRequest {
        namespace: "/intel/mock/foo".to_string(),
        version: 0,
    }];
    let first = h
        .catalog
        .collect_metrics(&requests, &ConfigMap::new())
        .await
        .expect("first collect");
    let second = h
        .catalog
        .collect_metrics(&requests, &ConfigMap::new())
        .await
        .expect("second collect");

    // the mock emits a fresh counter value per underlying invocation, so
    // identical data proves the second call never reached the plugin
    assert_eq!(first[0].data, second[0].data);

    h.catalog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_ttl_disables_the_cache() {
    let Some(h) = harness(CatalogConfig {
        cache_ttl: Duration::ZERO,
        ..CatalogConfig::default()
    }) else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };
    h.catalog
        .load("collector-mock", &h.bytes, None)
        .await
        .expect("load");

    let requests = vec![CollectRequest {
        namespace: "/intel/mock/foo".to_string(),
        version: 0,
    }];
    let first = h
        .catalog
        .collect_metrics(&requests, &ConfigMap::new())
        .await
        .expect("first collect");
    let second = h
        .catalog
        .collect_metrics(&requests, &ConfigMap::new())
        .await
        .expect("second collect");
    assert_ne!(first[0].data, second[0].data);

    h.catalog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_never_exceeds_max_running_instances() {
    let mut cfg = CatalogConfig {
        cache_ttl: Duration::ZERO,
        ..CatalogConfig::default()
    };
    cfg.pool.max_running = 2;
    let Some(h) = harness(cfg) else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };
    h.catalog
        .load("collector-mock", &h.bytes, None)
        .await
        .expect("load");

    let mut handles = Vec::new();
    for i in 0..8 {
        let catalog = h.catalog.clone();
        handles.push(tokio::spawn(async move {
            let requests = vec![CollectRequest {
                namespace: format!("/intel/mock/host{i}/baz"),
                version: 0,
            }];
            catalog.collect_metrics(&requests, &ConfigMap::new()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("collect succeeds");
    }
    assert!(h.catalog.running_instances(&collector_id()) <= 2);

    h.catalog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trust_enabled_rejects_unsigned_and_admits_signed_uploads() {
    use base64::Engine as _;
    use std::io::Write as _;

    let Some(mock) = mock_plugin_binary() else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };
    let bytes = std::fs::read(mock).expect("read mock plugin");

    let key = b"cluster-signing-key";
    let tmp = tempfile::tempdir().expect("tempdir");
    let keyring_path = tmp.path().join("keyring");
    let mut keyring = std::fs::File::create(&keyring_path).expect("keyring file");
    writeln!(
        keyring,
        "{}",
        base64::engine::general_purpose::STANDARD.encode(key)
    )
    .unwrap();
    drop(keyring);

    let mut verifier = SignatureVerifier::new(TrustLevel::Enabled);
    verifier.add_keyring_file(&keyring_path).expect("keyring loads");

    let store_root = tmp.path().join("plugins");
    let artifacts = ArtifactStore::new(Some(store_root.clone())).expect("store");
    let catalog = PluginCatalog::new(
        CatalogConfig::default(),
        verifier,
        Arc::new(EventBus::new()),
        artifacts,
    );

    // unsigned: rejected, nothing left on disk
    let err = catalog
        .load("collector-mock", &bytes, None)
        .await
        .expect_err("unsigned upload is rejected");
    assert_eq!(err.kind(), oxtel_common::error::ErrorKind::Integrity);
    assert!(catalog.list().is_empty());
    let leftovers = std::fs::read_dir(&store_root)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "failed load leaves no artifact behind");

    // signed with a keyring key: admitted and recorded as signed
    let signature = oxtel_plugin::signing::sign(&bytes, key).expect("sign");
    let info = catalog
        .load("collector-mock", &bytes, Some(&signature))
        .await
        .expect("signed upload loads");
    assert!(info.signed);

    catalog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publisher_config_policy_is_enforced() {
    let Some(h) = harness(CatalogConfig::default()) else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };
    h.catalog
        .load("oxtel-mock-plugin-publisher", &h.bytes, None)
        .await
        .expect("publisher loads");

    let publisher = PluginId::latest(PluginType::Publisher, "file");
    let payload = Payload {
        content_type: "application/json".to_string(),
        body: b"[]".to_vec(),
    };

    // missing required "file" key fails at policy application, before
    // the plugin is ever called
    let err = h
        .catalog
        .publish(&publisher, payload.clone(), &ConfigMap::new())
        .await
        .expect_err("missing required key");
    assert_eq!(err.kind(), oxtel_common::error::ErrorKind::Policy);

    let out = h._tmp.path().join("out.jsonl");
    let mut config = ConfigMap::new();
    config.insert(
        "file".to_string(),
        ConfigValue::Str(out.to_string_lossy().into_owned()),
    );
    h.catalog
        .publish(&publisher, payload, &config)
        .await
        .expect("publish succeeds");
    assert!(out.exists());

    h.catalog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processor_passthru_round_trips_payloads() {
    let Some(h) = harness(CatalogConfig::default()) else {
        eprintln!("mock plugin binary not built; skipping");
        return;
    };
    h.catalog
        .load("oxtel-mock-plugin-processor", &h.bytes, None)
        .await
        .expect("processor loads");

    let processor = PluginId::latest(PluginType::Processor, "passthru");
    let payload = Payload {
        content_type: "application/json".to_string(),
        body: br#"[{"namespace":"/intel/mock/foo"}]"#.to_vec(),
    };
    let out = h
        .catalog
        .process(&processor, payload.clone(), &ConfigMap::new())
        .await
        .expect("process succeeds");
    assert_eq!(out.body, payload.body);

    // a processor reference is not a publisher
    let err = h
        .catalog
        .publish(&processor, payload, &ConfigMap::new())
        .await
        .expect_err("publish through a processor");
    assert_eq!(err.kind(), oxtel_common::error::ErrorKind::Validation);

    h.catalog.shutdown().await;
}
