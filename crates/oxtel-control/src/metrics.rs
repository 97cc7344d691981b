//! The metric catalog: a namespace-keyed index of everything collectors
//! have advertised, with version fan-in, wildcard listing, and dynamic
//! (templated) namespace elements.

use crate::error::{ControlError, Result};
use chrono::{DateTime, Utc};
use oxtel_common::types::{
    DynamicElement, MetricInfo, MetricType, Namespace, NamespaceElement, PluginId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct MetricMeta {
    pub namespace: Namespace,
    pub version: u32,
    pub unit: Option<String>,
    pub description: Option<String>,
    pub owner: PluginId,
    pub last_advertised: DateTime<Utc>,
}

impl MetricMeta {
    pub fn info(&self) -> MetricInfo {
        MetricInfo {
            namespace: self.namespace.to_string(),
            version: self.version,
            unit: self.unit.clone(),
            description: self.description.clone(),
            last_advertised: self.last_advertised,
            dynamic_elements: self
                .namespace
                .dynamic_elements()
                .into_iter()
                .map(|(index, name, description)| DynamicElement {
                    name,
                    index,
                    description,
                })
                .collect(),
            policy: None,
        }
    }
}

/// A concrete collect request resolved against the catalog.
#[derive(Debug, Clone)]
pub struct ResolvedMetric {
    pub namespace: String,
    pub version: u32,
    pub owner: PluginId,
}

#[derive(Default)]
pub struct MetricCatalog {
    // rendered namespace -> version -> meta
    inner: RwLock<HashMap<String, BTreeMap<u32, MetricMeta>>>,
}

impl MetricCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a collector's advertised metric types into the catalog.
    pub fn advertise(&self, owner: &PluginId, types: &[MetricType]) {
        let now = Utc::now();
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        for t in types {
            let meta = MetricMeta {
                namespace: t.namespace.clone(),
                version: t.version,
                unit: t.unit.clone(),
                description: t.description.clone(),
                owner: owner.clone(),
                last_advertised: now,
            };
            guard
                .entry(t.namespace.to_string())
                .or_default()
                .insert(t.version, meta);
        }
    }

    /// Remove every metric advertised by the given plugin.
    pub fn retract(&self, owner: &PluginId) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        for versions in guard.values_mut() {
            versions.retain(|_, meta| meta.owner != *owner);
        }
        guard.retain(|_, versions| !versions.is_empty());
    }

    /// List the catalog. A query of `/a`, `/a/` or `/a/*` selects every
    /// namespace under `/a`; no query selects everything. Version `0`
    /// selects the highest version per namespace.
    pub fn list(&self, query: Option<&str>, version: u32) -> Result<Vec<MetricInfo>> {
        let prefix = match query {
            Some(q) => Some(parse_query_prefix(q)?),
            None => None,
        };
        let guard = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        for versions in guard.values() {
            let Some(sample) = versions.values().next() else {
                continue;
            };
            if let Some(prefix) = &prefix {
                if !prefix_matches(prefix, &sample.namespace) {
                    continue;
                }
            }
            if version == 0 {
                if let Some(meta) = versions.values().next_back() {
                    out.push(meta.info());
                }
            } else if let Some(meta) = versions.get(&version) {
                out.push(meta.info());
            }
        }
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.version.cmp(&b.version)));
        Ok(out)
    }

    /// Exact lookup of one metric, resolving dynamic namespaces against a
    /// concrete query. Version `0` resolves to the highest.
    pub fn get(&self, namespace: &str, version: u32) -> Result<MetricMeta> {
        let requested =
            Namespace::parse(namespace).map_err(ControlError::BadNamespace)?;
        let guard = self.inner.read().unwrap_or_else(|p| p.into_inner());

        let versions = guard.get(&requested.to_string()).or_else(|| {
            // no exact entry: look for a dynamic namespace this request
            // instantiates
            guard
                .iter()
                .find(|(_, versions)| {
                    versions
                        .values()
                        .next()
                        .is_some_and(|meta| meta.namespace.matches(&requested))
                })
                .map(|(_, versions)| versions)
        });

        let versions = versions.ok_or_else(|| ControlError::MetricNotFound {
            namespace: namespace.to_string(),
            version,
        })?;

        let meta = if version == 0 {
            versions.values().next_back()
        } else {
            versions.get(&version)
        };
        meta.cloned().ok_or_else(|| ControlError::MetricNotFound {
            namespace: namespace.to_string(),
            version,
        })
    }

    /// Resolve a collect request to its owning plugin. The requested
    /// namespace must be fully concrete: unfilled dynamic elements are a
    /// validation failure.
    pub fn resolve(&self, namespace: &str, version: u32) -> Result<ResolvedMetric> {
        let requested =
            Namespace::parse(namespace).map_err(ControlError::BadNamespace)?;
        if requested.is_dynamic() {
            return Err(ControlError::BadNamespace(format!(
                "{namespace} has unfilled dynamic elements"
            )));
        }
        let meta = self.get(namespace, version)?;
        Ok(ResolvedMetric {
            namespace: requested.to_string(),
            version: meta.version,
            owner: meta.owner,
        })
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.inner.read().unwrap_or_else(|p| p.into_inner());
        guard.is_empty()
    }
}

/// Normalize a listing query: trailing `/*` and trailing `/` both mean
/// "all descendants", as does a bare prefix.
fn parse_query_prefix(query: &str) -> Result<Namespace> {
    let trimmed = query.trim();
    let trimmed = trimmed.strip_suffix("/*").unwrap_or(trimmed);
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        // "/*" or "/" alone selects everything
        return Ok(Namespace(Vec::new()));
    }
    Namespace::parse(trimmed).map_err(ControlError::BadNamespace)
}

fn prefix_matches(prefix: &Namespace, candidate: &Namespace) -> bool {
    if prefix.len() > candidate.len() {
        return false;
    }
    prefix.0.iter().zip(candidate.0.iter()).all(|(p, c)| {
        match (p, c) {
            (NamespaceElement::Static { value: a }, NamespaceElement::Static { value: b }) => {
                a == b
            }
            // a dynamic element in the catalog entry matches any concrete
            // query segment at that position
            (NamespaceElement::Static { .. }, NamespaceElement::Dynamic { .. }) => true,
            _ => false,
        }
    })
}
