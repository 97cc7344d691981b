//! Cross-subsystem views. The catalog and the scheduler reference each
//! other at runtime (tasks drive plugins, unload stops dependent tasks);
//! these traits break that cycle so the daemon entrypoint can wire the two
//! without either crate depending on the other.

use crate::error::CoreResult;
use crate::policy::ConfigMap;
use crate::types::{CollectRequest, Metric, Payload, PluginId, TaskManifest};
use async_trait::async_trait;
use uuid::Uuid;

/// The view of the plugin catalog the scheduler executes workflows
/// against.
#[async_trait]
pub trait MetricManager: Send + Sync {
    /// Resolve the requests to advertised metrics, check the merged config
    /// against each metric's policy, and run the owning collector.
    async fn collect_metrics(
        &self,
        requests: &[CollectRequest],
        config: &ConfigMap,
    ) -> CoreResult<Vec<Metric>>;

    /// Run a processor over a payload. `plugin.version == 0` resolves to
    /// the highest loaded version.
    async fn process(
        &self,
        plugin: &PluginId,
        payload: Payload,
        config: &ConfigMap,
    ) -> CoreResult<Payload>;

    /// Run a publisher over a payload.
    async fn publish(
        &self,
        plugin: &PluginId,
        payload: Payload,
        config: &ConfigMap,
    ) -> CoreResult<()>;

    /// Validate that every requested namespace resolves to an advertised
    /// metric, without touching any plugin. Used at task admission.
    fn validate_requests(&self, requests: &[CollectRequest]) -> CoreResult<()>;
}

/// The view of the scheduler the catalog uses to stop work that
/// references a plugin being unloaded.
#[async_trait]
pub trait TaskReaper: Send + Sync {
    /// Stop every task whose workflow references the plugin. Returns the
    /// ids of the tasks that were stopped.
    async fn stop_tasks_for_plugin(&self, plugin: &PluginId) -> Vec<Uuid>;
}

/// Side effects tribe requests when a replicated delta is applied
/// locally. Implemented by the daemon over the catalog and scheduler
/// public APIs.
#[async_trait]
pub trait TribeDelegate: Send + Sync {
    /// Make the plugin loaded locally, fetching the artifact from the
    /// originating member's control plane when it is not already present.
    async fn load_plugin(&self, id: &PluginId, origin_rest: Option<&str>) -> CoreResult<()>;

    async fn unload_plugin(&self, id: &PluginId) -> CoreResult<()>;

    async fn create_task(&self, id: Uuid, manifest: &TaskManifest) -> CoreResult<()>;

    async fn start_task(&self, id: Uuid) -> CoreResult<()>;

    async fn stop_task(&self, id: Uuid) -> CoreResult<()>;

    async fn remove_task(&self, id: Uuid) -> CoreResult<()>;
}
