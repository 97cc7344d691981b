//! Wire shapes shared by the runner and plugin processes.
//!
//! A plugin advertises itself with a single JSON line on stdout, then
//! serves length-prefixed request/response frames on the TCP address it
//! announced. Frame payloads are encoded with the negotiated content
//! type; MessagePack is preferred, JSON is the portable fallback.

use oxtel_common::policy::{ConfigMap, ConfigPolicy};
use oxtel_common::types::{CollectRequest, Metric, MetricType, Payload, PluginType};
use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Env var carrying the shared token into the plugin subprocess.
pub const TOKEN_ENV: &str = "OXTEL_PLUGIN_TOKEN";

/// The single-line JSON handshake a plugin prints on stdout after binding
/// its listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub listen_address: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub name: String,
    pub version: u32,
    pub token: String,
    #[serde(default)]
    pub content_types: Vec<String>,
    #[serde(default)]
    pub pubkey: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub call: RpcCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcCall {
    Ping,
    Kill,
    GetConfigPolicy,
    GetMetricTypes {
        config: ConfigMap,
    },
    CollectMetrics {
        requests: Vec<CollectRequest>,
        config: ConfigMap,
    },
    Process {
        payload: Payload,
        config: ConfigMap,
    },
    Publish {
        payload: Payload,
        config: ConfigMap,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub outcome: RpcOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcOutcome {
    Ok(RpcReply),
    Err(RpcFault),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Pong,
    Killed,
    ConfigPolicy(ConfigPolicy),
    MetricTypes(Vec<MetricType>),
    Metrics(Vec<Metric>),
    Processed(Payload),
    Published,
}

/// An error produced by plugin code, as opposed to a transport failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFault {
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    /// The supplied config violated the plugin's expectations.
    Policy,
    /// The plugin's own logic failed.
    Plugin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_parses_minimal_line() {
        let line = r#"{"listen_address":"127.0.0.1:9999","type":"collector","name":"mock","version":1,"token":"abc","content_types":["application/msgpack"]}"#;
        let hs: Handshake = serde_json::from_str(line).unwrap();
        assert_eq!(hs.plugin_type, PluginType::Collector);
        assert_eq!(hs.version, 1);
        assert!(hs.pubkey.is_none());
    }

    #[test]
    fn rpc_round_trips_in_both_codecs() {
        let req = RpcRequest {
            id: 7,
            call: RpcCall::CollectMetrics {
                requests: vec![CollectRequest {
                    namespace: "/intel/mock/foo".to_string(),
                    version: 0,
                }],
                config: ConfigMap::new(),
            },
        };

        let json = serde_json::to_vec(&req).unwrap();
        let back: RpcRequest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.id, 7);

        let mp = rmp_serde::to_vec_named(&req).unwrap();
        let back: RpcRequest = rmp_serde::from_slice(&mp).unwrap();
        assert_eq!(back.id, 7);
        match back.call {
            RpcCall::CollectMetrics { requests, .. } => {
                assert_eq!(requests[0].namespace, "/intel/mock/foo");
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }
}
