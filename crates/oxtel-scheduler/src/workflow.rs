//! Workflow manifests: a tree rooted at a collect node, fanning out
//! through processors to publisher leaves. Parsed from the recursive
//! tagged JSON shape and validated so every branch terminates in a
//! publish leaf.

use crate::error::{Result, SchedulerError};
use oxtel_common::policy::ConfigMap;
use oxtel_common::types::{CollectRequest, PluginId, PluginType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub collect: CollectNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectNode {
    /// namespace -> requested version (0 = highest)
    pub metrics: BTreeMap<String, u32>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub process: Vec<ProcessNode>,
    #[serde(default)]
    pub publish: Vec<PublishNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessNode {
    pub plugin_name: String,
    #[serde(default)]
    pub plugin_version: u32,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub process: Vec<ProcessNode>,
    #[serde(default)]
    pub publish: Vec<PublishNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishNode {
    pub plugin_name: String,
    #[serde(default)]
    pub plugin_version: u32,
    #[serde(default)]
    pub config: ConfigMap,
}

impl Workflow {
    /// Parse and validate a raw manifest value.
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let workflow: Workflow = serde_json::from_value(value.clone())
            .map_err(|e| SchedulerError::BadWorkflow(e.to_string()))?;
        workflow.validate()?;
        Ok(workflow)
    }

    fn validate(&self) -> Result<()> {
        if self.collect.metrics.is_empty() {
            return Err(SchedulerError::BadWorkflow(
                "collect node requests no metrics".to_string(),
            ));
        }
        for (namespace, _) in &self.collect.metrics {
            if namespace.trim().is_empty() {
                return Err(SchedulerError::BadWorkflow(
                    "collect node requests an empty namespace".to_string(),
                ));
            }
        }
        if self.collect.process.is_empty() && self.collect.publish.is_empty() {
            return Err(SchedulerError::BadWorkflow(
                "workflow collects and discards: no publish leaf".to_string(),
            ));
        }
        for node in &self.collect.process {
            validate_process(node)?;
        }
        for leaf in &self.collect.publish {
            validate_publish(leaf)?;
        }
        Ok(())
    }

    /// The collect requests this workflow fires with.
    pub fn requests(&self) -> Vec<CollectRequest> {
        self.collect
            .metrics
            .iter()
            .map(|(namespace, version)| CollectRequest {
                namespace: namespace.clone(),
                version: *version,
            })
            .collect()
    }

    /// Every processor and publisher reference in the tree, with version
    /// `0` standing for "any loaded version".
    pub fn references(&self) -> Vec<PluginId> {
        let mut out = Vec::new();
        fn walk(nodes: &[ProcessNode], leaves: &[PublishNode], out: &mut Vec<PluginId>) {
            for node in nodes {
                out.push(PluginId::new(
                    PluginType::Processor,
                    node.plugin_name.clone(),
                    node.plugin_version,
                ));
                walk(&node.process, &node.publish, out);
            }
            for leaf in leaves {
                out.push(PluginId::new(
                    PluginType::Publisher,
                    leaf.plugin_name.clone(),
                    leaf.plugin_version,
                ));
            }
        }
        walk(&self.collect.process, &self.collect.publish, &mut out);
        out
    }

    /// Whether the workflow references the given plugin, treating a
    /// version of `0` on either side as a wildcard.
    pub fn references_plugin(&self, plugin: &PluginId) -> bool {
        self.references().iter().any(|r| {
            r.plugin_type == plugin.plugin_type
                && r.name == plugin.name
                && (r.version == 0 || plugin.version == 0 || r.version == plugin.version)
        })
    }
}

fn validate_process(node: &ProcessNode) -> Result<()> {
    if node.plugin_name.trim().is_empty() {
        return Err(SchedulerError::BadWorkflow(
            "process node is missing a plugin name".to_string(),
        ));
    }
    if node.process.is_empty() && node.publish.is_empty() {
        return Err(SchedulerError::BadWorkflow(format!(
            "process branch {:?} never reaches a publish leaf",
            node.plugin_name
        )));
    }
    for child in &node.process {
        validate_process(child)?;
    }
    for leaf in &node.publish {
        validate_publish(leaf)?;
    }
    Ok(())
}

fn validate_publish(leaf: &PublishNode) -> Result<()> {
    if leaf.plugin_name.trim().is_empty() {
        return Err(SchedulerError::BadWorkflow(
            "publish leaf is missing a plugin name".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn simple_manifest() -> serde_json::Value {
        json!({
            "collect": {
                "metrics": { "/intel/mock/foo": 1 },
                "publish": [ { "plugin_name": "file", "config": { "file": "/tmp/out" } } ]
            }
        })
    }

    #[test]
    fn parses_collect_publish_manifest() {
        let wf = Workflow::parse(&simple_manifest()).unwrap();
        assert_eq!(wf.requests().len(), 1);
        assert_eq!(wf.requests()[0].namespace, "/intel/mock/foo");
        let refs = wf.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].plugin_type, PluginType::Publisher);
    }

    #[test]
    fn nested_process_chain_parses() {
        let wf = Workflow::parse(&json!({
            "collect": {
                "metrics": { "/intel/mock/foo": 0, "/intel/mock/bar": 0 },
                "process": [ {
                    "plugin_name": "passthru",
                    "process": [ {
                        "plugin_name": "passthru",
                        "publish": [ { "plugin_name": "file" } ]
                    } ],
                    "publish": [ { "plugin_name": "file" } ]
                } ]
            }
        }))
        .unwrap();
        assert_eq!(wf.requests().len(), 2);
        // passthru twice, file twice
        assert_eq!(wf.references().len(), 4);
    }

    #[test]
    fn collect_without_any_publish_leaf_is_rejected() {
        let err = Workflow::parse(&json!({
            "collect": { "metrics": { "/intel/mock/foo": 0 } }
        }))
        .unwrap_err();
        assert!(matches!(err, SchedulerError::BadWorkflow(_)));
    }

    #[test]
    fn process_branch_without_leaf_is_rejected() {
        let err = Workflow::parse(&json!({
            "collect": {
                "metrics": { "/intel/mock/foo": 0 },
                "process": [ { "plugin_name": "passthru" } ]
            }
        }))
        .unwrap_err();
        assert!(matches!(err, SchedulerError::BadWorkflow(_)));
    }

    #[test]
    fn empty_metrics_rejected() {
        let err = Workflow::parse(&json!({
            "collect": { "metrics": {}, "publish": [ { "plugin_name": "file" } ] }
        }))
        .unwrap_err();
        assert!(matches!(err, SchedulerError::BadWorkflow(_)));
    }

    #[test]
    fn reference_matching_honours_version_wildcards() {
        let wf = Workflow::parse(&simple_manifest()).unwrap();
        let any = PluginId::latest(PluginType::Publisher, "file");
        let v3 = PluginId::new(PluginType::Publisher, "file", 3);
        let other = PluginId::new(PluginType::Publisher, "statsd", 1);
        assert!(wf.references_plugin(&any));
        assert!(wf.references_plugin(&v3));
        assert!(!wf.references_plugin(&other));
    }
}
