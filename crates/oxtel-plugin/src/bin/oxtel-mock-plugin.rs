//! Mock plugin used by the runner and daemon test suites. One binary
//! covers all three roles; the role is taken from the executable's file
//! name (copy it as `...-processor` / `...-publisher` to change it, add a
//! `-v2` suffix to bump the advertised version).
//!
//! Collector `mock` advertises `/intel/mock/foo`, `/intel/mock/bar` and
//! the dynamic `/intel/mock/[host]/baz`. Processor `passthru` echoes
//! payloads. Publisher `file` appends payload bytes to the path given in
//! its required `file` config key, sleeping `block_ms` first when set.

use oxtel_common::policy::{ConfigMap, ConfigPolicy, ConfigValue, PolicyRule, ValueType};
use oxtel_common::types::{
    CollectRequest, Metric, MetricType, Namespace, Payload, PluginType,
};
use oxtel_plugin::codec::{self, WireCodec};
use oxtel_plugin::proto::{
    FaultKind, Handshake, RpcCall, RpcFault, RpcOutcome, RpcReply, RpcRequest, RpcResponse,
    CONTENT_TYPE_JSON, CONTENT_TYPE_MSGPACK, TOKEN_ENV,
};
use std::io::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::net::{TcpListener, TcpStream};

static SAMPLE: AtomicI64 = AtomicI64::new(1000);

struct Identity {
    plugin_type: PluginType,
    name: &'static str,
    version: u32,
}

fn identity_from_exe() -> Identity {
    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let plugin_type = if exe.contains("processor") {
        PluginType::Processor
    } else if exe.contains("publisher") {
        PluginType::Publisher
    } else {
        PluginType::Collector
    };
    let name = match plugin_type {
        PluginType::Collector => "mock",
        PluginType::Processor => "passthru",
        PluginType::Publisher => "file",
    };
    let version = if exe.contains("-v2") { 2 } else { 1 };
    Identity {
        plugin_type,
        name,
        version,
    }
}

fn advertised_metrics(version: u32) -> Vec<MetricType> {
    ["/intel/mock/foo", "/intel/mock/bar", "/intel/mock/[host]/baz"]
        .iter()
        .map(|ns| MetricType {
            namespace: Namespace::parse(ns).expect("static namespace"),
            version,
            unit: Some("count".to_string()),
            description: Some(format!("mock sample at {ns}")),
        })
        .collect()
}

fn config_policy(plugin_type: PluginType) -> ConfigPolicy {
    let mut policy = ConfigPolicy::new();
    if plugin_type == PluginType::Publisher {
        policy.add_rule(PolicyRule {
            key: "file".to_string(),
            value_type: ValueType::Str,
            default: None,
            required: true,
            minimum: None,
            maximum: None,
        });
        policy.add_rule(PolicyRule {
            key: "block_ms".to_string(),
            value_type: ValueType::Int,
            default: Some(ConfigValue::Int(0)),
            required: false,
            minimum: Some(ConfigValue::Int(0)),
            maximum: None,
        });
    }
    policy
}

fn collect(identity: &Identity, requests: &[CollectRequest]) -> Result<Vec<Metric>, RpcFault> {
    let advertised = advertised_metrics(identity.version);
    let mut out = Vec::with_capacity(requests.len());
    for req in requests {
        let ns = Namespace::parse(&req.namespace).map_err(|e| RpcFault {
            kind: FaultKind::Plugin,
            message: e,
        })?;
        let known = advertised
            .iter()
            .any(|m| m.namespace == ns || m.namespace.matches(&ns));
        if !known {
            return Err(RpcFault {
                kind: FaultKind::Plugin,
                message: format!("unknown metric {}", req.namespace),
            });
        }
        out.push(Metric {
            namespace: req.namespace.clone(),
            version: identity.version,
            data: serde_json::json!(SAMPLE.fetch_add(1, Ordering::Relaxed)),
            tags: Default::default(),
            unit: Some("count".to_string()),
            timestamp: chrono::Utc::now(),
        });
    }
    Ok(out)
}

async fn publish(payload: &Payload, config: &ConfigMap) -> Result<(), RpcFault> {
    if let Some(ConfigValue::Int(ms)) = config.get("block_ms") {
        if *ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(*ms as u64)).await;
        }
    }
    let Some(ConfigValue::Str(path)) = config.get("file") else {
        return Err(RpcFault {
            kind: FaultKind::Policy,
            message: "missing required config key \"file\"".to_string(),
        });
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| RpcFault {
            kind: FaultKind::Plugin,
            message: format!("open {path}: {e}"),
        })?;
    file.write_all(&payload.body).map_err(|e| RpcFault {
        kind: FaultKind::Plugin,
        message: e.to_string(),
    })?;
    file.write_all(b"\n").map_err(|e| RpcFault {
        kind: FaultKind::Plugin,
        message: e.to_string(),
    })?;
    Ok(())
}

async fn handle_call(identity: &Identity, call: RpcCall) -> (RpcOutcome, bool) {
    match call {
        RpcCall::Ping => (RpcOutcome::Ok(RpcReply::Pong), false),
        RpcCall::Kill => (RpcOutcome::Ok(RpcReply::Killed), true),
        RpcCall::GetConfigPolicy => (
            RpcOutcome::Ok(RpcReply::ConfigPolicy(config_policy(identity.plugin_type))),
            false,
        ),
        RpcCall::GetMetricTypes { .. } => (
            RpcOutcome::Ok(RpcReply::MetricTypes(advertised_metrics(identity.version))),
            false,
        ),
        RpcCall::CollectMetrics { requests, .. } => match collect(identity, &requests) {
            Ok(metrics) => (RpcOutcome::Ok(RpcReply::Metrics(metrics)), false),
            Err(fault) => (RpcOutcome::Err(fault), false),
        },
        RpcCall::Process { payload, .. } => {
            (RpcOutcome::Ok(RpcReply::Processed(payload)), false)
        }
        RpcCall::Publish { payload, config } => match publish(&payload, &config).await {
            Ok(()) => (RpcOutcome::Ok(RpcReply::Published), false),
            Err(fault) => (RpcOutcome::Err(fault), false),
        },
    }
}

fn decode_request(frame: &[u8]) -> Option<(RpcRequest, WireCodec)> {
    if let Ok(req) = WireCodec::Msgpack.decode::<RpcRequest>(frame) {
        return Some((req, WireCodec::Msgpack));
    }
    if let Ok(req) = WireCodec::Json.decode::<RpcRequest>(frame) {
        return Some((req, WireCodec::Json));
    }
    None
}

async fn serve(identity: &Identity, stream: TcpStream) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = match codec::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => return false,
        };
        let Some((request, wire)) = decode_request(&frame) else {
            return false;
        };
        let (outcome, shutdown) = handle_call(identity, request.call).await;
        let response = RpcResponse {
            id: request.id,
            outcome,
        };
        let encoded = match wire.encode(&response) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        if codec::write_frame(&mut writer, &encoded).await.is_err() {
            return false;
        }
        if shutdown {
            return true;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let identity = identity_from_exe();
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    let token = std::env::var(TOKEN_ENV).unwrap_or_default();

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");

    let handshake = Handshake {
        listen_address: addr.to_string(),
        plugin_type: identity.plugin_type,
        name: identity.name.to_string(),
        version: identity.version,
        token,
        content_types: vec![
            CONTENT_TYPE_MSGPACK.to_string(),
            CONTENT_TYPE_JSON.to_string(),
        ],
        pubkey: None,
    };
    let line = serde_json::to_string(&handshake).expect("handshake encodes");
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{line}").expect("write handshake");
    stdout.flush().expect("flush handshake");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => break,
        };
        if serve(&identity, stream).await {
            break;
        }
    }
}
