use crate::policy::{ConfigMap, PolicyTableEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Role a plugin takes in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Collector,
    Processor,
    Publisher,
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginType::Collector => write!(f, "collector"),
            PluginType::Processor => write!(f, "processor"),
            PluginType::Publisher => write!(f, "publisher"),
        }
    }
}

impl std::str::FromStr for PluginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "collector" => Ok(PluginType::Collector),
            "processor" => Ok(PluginType::Processor),
            "publisher" => Ok(PluginType::Publisher),
            _ => Err(format!("unknown plugin type: {s}")),
        }
    }
}

/// The unique identity of a loaded plugin. `version` is a positive
/// integer; a version of `0` in a *reference* means "highest loaded".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PluginId {
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub name: String,
    pub version: u32,
}

impl PluginId {
    pub fn new(plugin_type: PluginType, name: impl Into<String>, version: u32) -> Self {
        Self {
            plugin_type,
            name: name.into(),
            version,
        }
    }

    /// A reference with an unspecified version, resolved by the catalog
    /// to the highest loaded version.
    pub fn latest(plugin_type: PluginType, name: impl Into<String>) -> Self {
        Self::new(plugin_type, name, 0)
    }
}

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.plugin_type, self.name, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Loaded,
    Unloaded,
}

/// Health of a single running plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceHealth {
    Ready,
    Busy,
    Unhealthy,
    Terminated,
}

/// Policy for unsigned or badly-signed plugin uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Disabled,
    Enabled,
    Warning,
}

impl std::str::FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "disabled" => Ok(TrustLevel::Disabled),
            "1" | "enabled" => Ok(TrustLevel::Enabled),
            "2" | "warning" => Ok(TrustLevel::Warning),
            _ => Err(format!("trust level was invalid (needs: 0-2): {s}")),
        }
    }
}

/// One element of a metric namespace. Dynamic elements are placeholders
/// (`[host]`) substituted with concrete values at collection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum NamespaceElement {
    Static { value: String },
    Dynamic { name: String, description: String },
}

/// A parsed slash-separated metric namespace, e.g. `/intel/mock/[host]/baz`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace(pub Vec<NamespaceElement>);

impl Namespace {
    /// Parse `/a/b/[c]/d`. Bracketed segments become dynamic elements.
    /// Empty segments and an empty path are rejected.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim().trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(format!("bad namespace: {raw:?}"));
        }
        let mut elements = Vec::new();
        for seg in trimmed.split('/') {
            if seg.is_empty() {
                return Err(format!("bad namespace (empty element): {raw:?}"));
            }
            if let Some(name) = seg.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                if name.is_empty() {
                    return Err(format!("bad namespace (empty dynamic element): {raw:?}"));
                }
                elements.push(NamespaceElement::Dynamic {
                    name: name.to_string(),
                    description: String::new(),
                });
            } else {
                elements.push(NamespaceElement::Static {
                    value: seg.to_string(),
                });
            }
        }
        Ok(Namespace(elements))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_dynamic(&self) -> bool {
        self.0
            .iter()
            .any(|e| matches!(e, NamespaceElement::Dynamic { .. }))
    }

    /// `(index, name, description)` of every dynamic element.
    pub fn dynamic_elements(&self) -> Vec<(usize, String, String)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                NamespaceElement::Dynamic { name, description } => {
                    Some((i, name.clone(), description.clone()))
                }
                NamespaceElement::Static { .. } => None,
            })
            .collect()
    }

    /// Whether a fully-static requested namespace is an instance of this
    /// (possibly dynamic) declared namespace: same length, every static
    /// element equal, dynamic positions free.
    pub fn matches(&self, concrete: &Namespace) -> bool {
        if self.len() != concrete.len() {
            return false;
        }
        self.0.iter().zip(concrete.0.iter()).all(|(decl, req)| {
            match (decl, req) {
                (NamespaceElement::Dynamic { .. }, NamespaceElement::Static { .. }) => true,
                (
                    NamespaceElement::Static { value: a },
                    NamespaceElement::Static { value: b },
                ) => a == b,
                _ => false,
            }
        })
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for element in &self.0 {
            match element {
                NamespaceElement::Static { value } => write!(f, "/{value}")?,
                NamespaceElement::Dynamic { name, .. } => write!(f, "/[{name}]")?,
            }
        }
        Ok(())
    }
}

/// A single collected sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub namespace: String,
    pub version: u32,
    pub data: serde_json::Value,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A metric type advertised by a collector at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricType {
    pub namespace: Namespace,
    pub version: u32,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A `(namespace, version)` pair requested from a collector. Version `0`
/// resolves to the highest advertised version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectRequest {
    pub namespace: String,
    #[serde(default)]
    pub version: u32,
}

/// An opaque payload flowing between processors and publishers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Spinning,
    Running,
    Stopped,
    Ended,
    Disabled,
    Error,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Spinning => "spinning",
            TaskState::Running => "running",
            TaskState::Stopped => "stopped",
            TaskState::Ended => "ended",
            TaskState::Disabled => "disabled",
            TaskState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Wire shape of a task schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub interval_ms: u64,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Wire shape of a task submission: a schedule plus the raw workflow
/// manifest, validated by the scheduler before admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    #[serde(default)]
    pub name: Option<String>,
    pub schedule: ScheduleSpec,
    pub workflow: serde_json::Value,
    #[serde(default)]
    pub no_start: bool,
}

/// Summary of a task, as returned by listings and carried in events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub name: Option<String>,
    pub state: TaskState,
    pub schedule: ScheduleSpec,
    pub hit_count: u64,
    pub miss_count: u64,
    pub failure_count: u64,
    pub last_fire: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Catalog record exposed over the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedPluginInfo {
    #[serde(flatten)]
    pub id: PluginId,
    pub signed: bool,
    pub status: PluginStatus,
    pub loaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_policy: Option<Vec<PolicyTableEntry>>,
}

/// Running-instance record exposed when listing with details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailablePluginInfo {
    #[serde(flatten)]
    pub id: PluginId,
    pub instance_id: String,
    pub health: InstanceHealth,
    pub hit_count: u64,
    pub last_hit: Option<DateTime<Utc>>,
}

/// Listing entry for the metric catalog, including the `[name]` rendering
/// of dynamic elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricInfo {
    pub namespace: String,
    pub version: u32,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub last_advertised: DateTime<Utc>,
    #[serde(default)]
    pub dynamic_elements: Vec<DynamicElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Vec<PolicyTableEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicElement {
    pub name: String,
    pub index: usize,
    pub description: String,
}

/// The config carried by a collect node, keyed by namespace prefix; the
/// config handed to a plugin is the merge of every prefix matching the
/// requested metric.
pub type MetricConfig = ConfigMap;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_type_round_trips() {
        for t in [PluginType::Collector, PluginType::Processor, PluginType::Publisher] {
            let s = t.to_string();
            assert_eq!(s.parse::<PluginType>().unwrap(), t);
        }
        assert!("driver".parse::<PluginType>().is_err());
    }

    #[test]
    fn namespace_parses_static_and_dynamic() {
        let ns = Namespace::parse("/intel/mock/[host]/baz").unwrap();
        assert_eq!(ns.len(), 4);
        assert!(ns.is_dynamic());
        assert_eq!(ns.to_string(), "/intel/mock/[host]/baz");
        let dynamics = ns.dynamic_elements();
        assert_eq!(dynamics.len(), 1);
        assert_eq!(dynamics[0].0, 2);
        assert_eq!(dynamics[0].1, "host");
    }

    #[test]
    fn namespace_rejects_empty_and_blank_elements() {
        assert!(Namespace::parse("").is_err());
        assert!(Namespace::parse("/").is_err());
        assert!(Namespace::parse("/a//b").is_err());
        assert!(Namespace::parse("/a/[]/b").is_err());
    }

    #[test]
    fn dynamic_namespace_matches_concrete_instances() {
        let decl = Namespace::parse("/intel/mock/[host]/baz").unwrap();
        let good = Namespace::parse("/intel/mock/web-01/baz").unwrap();
        let short = Namespace::parse("/intel/mock/web-01").unwrap();
        let wrong = Namespace::parse("/intel/mock/web-01/qux").unwrap();
        assert!(decl.matches(&good));
        assert!(!decl.matches(&short));
        assert!(!decl.matches(&wrong));
        // a request may not leave the dynamic element unfilled
        assert!(!decl.matches(&decl));
    }

    #[test]
    fn trust_level_parses_numbers_and_names() {
        assert_eq!("0".parse::<TrustLevel>().unwrap(), TrustLevel::Disabled);
        assert_eq!("enabled".parse::<TrustLevel>().unwrap(), TrustLevel::Enabled);
        assert_eq!("2".parse::<TrustLevel>().unwrap(), TrustLevel::Warning);
        assert!("3".parse::<TrustLevel>().is_err());
    }
}
