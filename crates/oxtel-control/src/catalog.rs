//! The plugin catalog: loaded-plugin records indexed by
//! `(type, name, version)`, the per-plugin instance pools, and the
//! execution surface the scheduler drives workflows through.

use crate::artifact::{Artifact, ArtifactStore};
use crate::cache::MetricCache;
use crate::error::{ControlError, Result};
use crate::metrics::MetricCatalog;
use crate::pool::{PoolConfig, PluginPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxtel_common::error::{CoreError, CoreResult};
use oxtel_common::event::{Event, EventBus};
use oxtel_common::manage::{MetricManager, TaskReaper};
use oxtel_common::policy::{ConfigMap, ConfigPolicy};
use oxtel_common::types::{
    AvailablePluginInfo, CollectRequest, LoadedPluginInfo, Metric, Payload, PluginId,
    PluginStatus, PluginType,
};
use oxtel_plugin::runner::PluginRunner;
use oxtel_plugin::signing::SignatureVerifier;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub pool: PoolConfig,
    /// TTL of the collect-result cache; zero disables it.
    pub cache_ttl: Duration,
    /// Deadline for data-path RPC calls (collect / process / publish).
    pub call_timeout: Duration,
    /// Cadence of the cache / idle-instance sweeper.
    pub sweep_interval: Duration,
    /// Directories scanned for plugins at startup.
    pub autoload_paths: Vec<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            cache_ttl: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            autoload_paths: Vec::new(),
        }
    }
}

struct LoadedPlugin {
    id: PluginId,
    artifact: Artifact,
    signed: bool,
    loaded_at: DateTime<Utc>,
    policy: ConfigPolicy,
    pool: PluginPool,
}

impl LoadedPlugin {
    fn info(&self, with_policy: bool) -> LoadedPluginInfo {
        LoadedPluginInfo {
            id: self.id.clone(),
            signed: self.signed,
            status: PluginStatus::Loaded,
            loaded_at: self.loaded_at,
            config_policy: with_policy.then(|| self.policy.as_table()),
        }
    }
}

#[derive(Default)]
struct Index {
    plugins: HashMap<PluginId, Arc<LoadedPlugin>>,
    // (type, name) -> sorted versions, for unversioned lookups
    versions: HashMap<(PluginType, String), Vec<u32>>,
}

impl Index {
    fn insert(&mut self, plugin: Arc<LoadedPlugin>) {
        let id = plugin.id.clone();
        let versions = self
            .versions
            .entry((id.plugin_type, id.name.clone()))
            .or_default();
        versions.push(id.version);
        versions.sort_unstable();
        self.plugins.insert(id, plugin);
    }

    fn remove(&mut self, id: &PluginId) -> Option<Arc<LoadedPlugin>> {
        let plugin = self.plugins.remove(id)?;
        let key = (id.plugin_type, id.name.clone());
        let now_empty = match self.versions.get_mut(&key) {
            Some(versions) => {
                versions.retain(|v| *v != id.version);
                versions.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.versions.remove(&key);
        }
        Some(plugin)
    }

    fn resolve(&self, reference: &PluginId) -> Option<PluginId> {
        if reference.version != 0 {
            return self
                .plugins
                .contains_key(reference)
                .then(|| reference.clone());
        }
        let key = (reference.plugin_type, reference.name.clone());
        let highest = *self.versions.get(&key)?.last()?;
        Some(PluginId::new(
            reference.plugin_type,
            reference.name.clone(),
            highest,
        ))
    }
}

pub struct PluginCatalog {
    cfg: CatalogConfig,
    index: RwLock<Index>,
    // serializes load / unload / swap; readers use the index lock only
    mutation: tokio::sync::Mutex<()>,
    pub metrics: MetricCatalog,
    pub cache: MetricCache,
    artifacts: ArtifactStore,
    verifier: SignatureVerifier,
    events: Arc<EventBus>,
    reaper: RwLock<Option<Arc<dyn TaskReaper>>>,
}

impl PluginCatalog {
    pub fn new(
        cfg: CatalogConfig,
        verifier: SignatureVerifier,
        events: Arc<EventBus>,
        artifacts: ArtifactStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: MetricCache::new(cfg.cache_ttl),
            cfg,
            index: RwLock::new(Index::default()),
            mutation: tokio::sync::Mutex::new(()),
            metrics: MetricCatalog::new(),
            artifacts,
            verifier,
            events,
            reaper: RwLock::new(None),
        })
    }

    /// Wire the scheduler's reaper view. Done once by the daemon
    /// entrypoint after both subsystems exist.
    pub fn set_task_reaper(&self, reaper: Arc<dyn TaskReaper>) {
        let mut guard = self.reaper.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(reaper);
    }

    /// Load an uploaded plugin binary: persist, verify, spawn, handshake,
    /// fetch metadata, and admit into the catalog.
    pub async fn load(
        &self,
        filename: &str,
        bytes: &[u8],
        signature: Option<&[u8]>,
    ) -> Result<LoadedPluginInfo> {
        let _guard = self.mutation.lock().await;
        self.load_locked(filename, bytes, signature).await
    }

    /// Spawn a runner and fetch its metadata, cleaning up the subprocess
    /// on any failure.
    async fn boot_runner(
        &self,
        path: &std::path::Path,
    ) -> Result<(Arc<PluginRunner>, ConfigPolicy, Vec<oxtel_common::types::MetricType>)> {
        let runner = PluginRunner::launch(path, self.cfg.pool.runner.clone()).await?;
        let policy = match runner.get_config_policy().await {
            Ok(policy) => policy,
            Err(e) => {
                runner.stop().await;
                return Err(e.into());
            }
        };
        let metric_types = if runner.meta().id.plugin_type == PluginType::Collector {
            match runner.get_metric_types(&ConfigMap::new()).await {
                Ok(types) => types,
                Err(e) => {
                    runner.stop().await;
                    return Err(e.into());
                }
            }
        } else {
            Vec::new()
        };
        Ok((runner, policy, metric_types))
    }

    async fn load_locked(
        &self,
        filename: &str,
        bytes: &[u8],
        signature: Option<&[u8]>,
    ) -> Result<LoadedPluginInfo> {
        let artifact = self.artifacts.store(filename, bytes)?;

        let signed = match self.verifier.check(bytes, signature) {
            Ok(signed) => signed,
            Err(e) => {
                self.artifacts.remove(&artifact.dir);
                return Err(e.into());
            }
        };

        // Handshake and metadata fetches are idempotent; transport
        // failures get a fresh subprocess, up to the retry cap.
        const LOAD_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        let (runner, policy, metric_types) = loop {
            attempt += 1;
            match self.boot_runner(&artifact.path).await {
                Ok(booted) => break booted,
                Err(e) if e.kind() == oxtel_common::error::ErrorKind::Transport
                    && attempt < LOAD_ATTEMPTS =>
                {
                    tracing::warn!(attempt, error = %e, "plugin boot failed, retrying");
                }
                Err(e) => {
                    self.artifacts.remove(&artifact.dir);
                    return Err(e);
                }
            }
        };
        let id = runner.meta().id.clone();

        let already_loaded = {
            let index = self.index.read().unwrap_or_else(|p| p.into_inner());
            index.plugins.contains_key(&id)
        };
        if already_loaded {
            runner.stop().await;
            self.artifacts.remove(&artifact.dir);
            return Err(ControlError::AlreadyLoaded { id });
        }

        let loaded = Arc::new(LoadedPlugin {
            id: id.clone(),
            pool: PluginPool::new(
                id.clone(),
                artifact.path.clone(),
                self.cfg.pool.clone(),
                runner,
            ),
            artifact,
            signed,
            loaded_at: Utc::now(),
            policy,
        });

        if !metric_types.is_empty() {
            self.metrics.advertise(&id, &metric_types);
        }
        let info = loaded.info(false);
        let checksum_hex = loaded.artifact.checksum_hex();
        {
            let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
            index.insert(loaded);
        }

        tracing::info!(
            plugin_name = %id.name,
            plugin_type = %id.plugin_type,
            plugin_version = id.version,
            signed,
            checksum = %checksum_hex,
            "plugin loaded"
        );
        self.events.publish(&Event::PluginLoaded { id, signed });
        Ok(info)
    }

    /// Unload a plugin: stop dependent tasks, retract its metrics, stop
    /// its pool, and delete its artifact.
    pub async fn unload(&self, reference: &PluginId) -> Result<LoadedPluginInfo> {
        let _guard = self.mutation.lock().await;
        self.unload_locked(reference).await
    }

    async fn unload_locked(&self, reference: &PluginId) -> Result<LoadedPluginInfo> {
        let id = self
            .resolve(reference)
            .ok_or_else(|| ControlError::PluginNotFound {
                id: reference.clone(),
            })?;

        let loaded = {
            let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
            index.remove(&id)
        }
        .ok_or_else(|| ControlError::PluginNotFound { id: id.clone() })?;

        self.metrics.retract(&id);
        self.cache.invalidate_plugin(&id);

        // With the metrics retracted, the reaper can also catch tasks that
        // reached this plugin through the metric catalog.
        let reaper = {
            let guard = self.reaper.read().unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        if let Some(reaper) = reaper {
            let stopped = reaper.stop_tasks_for_plugin(&id).await;
            if !stopped.is_empty() {
                tracing::info!(
                    plugin_name = %id.name,
                    tasks = stopped.len(),
                    "stopped tasks referencing plugin before unload"
                );
            }
        }

        loaded.pool.shutdown().await;
        self.artifacts.remove(&loaded.artifact.dir);

        tracing::info!(
            plugin_name = %id.name,
            plugin_type = %id.plugin_type,
            plugin_version = id.version,
            "plugin unloaded"
        );
        self.events.publish(&Event::PluginUnloaded { id: id.clone() });

        let mut info = loaded.info(false);
        info.status = PluginStatus::Unloaded;
        Ok(info)
    }

    /// Atomic replace: load the new binary, then unload the old version.
    /// A failed load leaves the old plugin in place; a missing old plugin
    /// rolls the new load back.
    pub async fn swap(
        &self,
        old: &PluginId,
        filename: &str,
        bytes: &[u8],
        signature: Option<&[u8]>,
    ) -> Result<(LoadedPluginInfo, LoadedPluginInfo)> {
        let _guard = self.mutation.lock().await;
        let new_info = self.load_locked(filename, bytes, signature).await?;
        match self.unload_locked(old).await {
            Ok(old_info) => Ok((new_info, old_info)),
            Err(e) => {
                let new_id = new_info.id.clone();
                if let Err(rollback) = self.unload_locked(&new_id).await {
                    tracing::error!(
                        plugin_name = %new_id.name,
                        error = %rollback,
                        "failed to roll back swap load"
                    );
                }
                Err(e)
            }
        }
    }

    pub fn resolve(&self, reference: &PluginId) -> Option<PluginId> {
        let index = self.index.read().unwrap_or_else(|p| p.into_inner());
        index.resolve(reference)
    }

    pub fn list(&self) -> Vec<LoadedPluginInfo> {
        let index = self.index.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<LoadedPluginInfo> =
            index.plugins.values().map(|p| p.info(false)).collect();
        out.sort_by(|a, b| {
            (a.id.plugin_type, &a.id.name, a.id.version)
                .cmp(&(b.id.plugin_type, &b.id.name, b.id.version))
        });
        out
    }

    pub fn available(&self) -> Vec<AvailablePluginInfo> {
        let pools: Vec<Arc<LoadedPlugin>> = {
            let index = self.index.read().unwrap_or_else(|p| p.into_inner());
            index.plugins.values().cloned().collect()
        };
        pools.iter().flat_map(|p| p.pool.instances()).collect()
    }

    /// Full record, with the config policy rules table, for the single
    /// plugin GET.
    pub fn get_info(&self, reference: &PluginId) -> Result<LoadedPluginInfo> {
        let record = self.record(reference)?;
        Ok(record.info(true))
    }

    /// The artifact bytes, for download and for tribe peers fetching the
    /// plugin.
    pub fn read_artifact(&self, reference: &PluginId) -> Result<Vec<u8>> {
        let record = self.record(reference)?;
        std::fs::read(&record.artifact.path).map_err(ControlError::Io)
    }

    pub fn running_instances(&self, id: &PluginId) -> usize {
        self.record(id).map(|r| r.pool.running()).unwrap_or(0)
    }

    fn record(&self, reference: &PluginId) -> Result<Arc<LoadedPlugin>> {
        let index = self.index.read().unwrap_or_else(|p| p.into_inner());
        let id = index
            .resolve(reference)
            .ok_or_else(|| ControlError::PluginNotFound {
                id: reference.clone(),
            })?;
        index
            .plugins
            .get(&id)
            .cloned()
            .ok_or(ControlError::PluginNotFound { id })
    }

    /// Scan the configured autoload directories, loading every regular
    /// file that is not a signature, pairing `<file>.asc` when present.
    /// Individual failures are logged, never fatal.
    pub async fn autoload(&self) {
        for dir in self.cfg.autoload_paths.clone() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(path = %dir.display(), error = %e, "autoload path unreadable");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() || path.extension().is_some_and(|e| e == "asc") {
                    continue;
                }
                let bytes = match std::fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "autoload read failed");
                        continue;
                    }
                };
                let signature = std::fs::read(path.with_extension("asc")).ok();
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "plugin".to_string());
                match self.load(&filename, &bytes, signature.as_deref()).await {
                    Ok(info) => {
                        tracing::info!(
                            plugin_name = %info.id.name,
                            plugin_version = info.id.version,
                            path = %path.display(),
                            "autoloaded plugin"
                        );
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "autoload failed");
                    }
                }
            }
        }
    }

    /// Periodic maintenance: cull expired cache entries and idle
    /// instances.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(catalog.cfg.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let swept = catalog.cache.sweep();
                if swept > 0 {
                    tracing::debug!(swept, "cache entries expired");
                }
                let pools: Vec<Arc<LoadedPlugin>> = {
                    let index = catalog.index.read().unwrap_or_else(|p| p.into_inner());
                    index.plugins.values().cloned().collect()
                };
                for plugin in pools {
                    let culled = plugin.pool.sweep().await;
                    if culled > 0 {
                        tracing::debug!(plugin = %plugin.id, culled, "idle instances culled");
                    }
                }
            }
        })
    }

    /// Unload everything and purge the artifact store. No plugin
    /// subprocess survives this call.
    pub async fn shutdown(&self) {
        let _guard = self.mutation.lock().await;
        let plugins: Vec<Arc<LoadedPlugin>> = {
            let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
            let ids: Vec<PluginId> = index.plugins.keys().cloned().collect();
            ids.iter().filter_map(|id| index.remove(id)).collect()
        };
        for plugin in plugins {
            self.metrics.retract(&plugin.id);
            plugin.pool.shutdown().await;
        }
        self.artifacts.purge();
        tracing::info!("plugin control stopped");
    }
}

#[async_trait]
impl MetricManager for PluginCatalog {
    async fn collect_metrics(
        &self,
        requests: &[CollectRequest],
        config: &ConfigMap,
    ) -> CoreResult<Vec<Metric>> {
        let mut out = Vec::new();
        // owner -> cache misses routed to that collector
        let mut misses: HashMap<PluginId, Vec<(String, u32)>> = HashMap::new();

        for request in requests {
            let resolved = self
                .metrics
                .resolve(&request.namespace, request.version)
                .map_err(CoreError::from)?;
            if let Some(cached) = self.cache.get(&resolved.namespace, resolved.version) {
                out.extend(cached);
            } else {
                misses
                    .entry(resolved.owner)
                    .or_default()
                    .push((resolved.namespace, resolved.version));
            }
        }

        for (owner, wanted) in misses {
            let record = self.record(&owner).map_err(CoreError::from)?;
            let merged = record.policy.apply(config)?;
            let rpc_requests: Vec<CollectRequest> = wanted
                .iter()
                .map(|(ns, ver)| CollectRequest {
                    namespace: ns.clone(),
                    version: *ver,
                })
                .collect();

            let checkout = record.pool.checkout().await.map_err(CoreError::from)?;
            let result = checkout
                .runner()
                .collect(&rpc_requests, &merged, self.cfg.call_timeout)
                .await;
            record.pool.checkin(checkout).await;

            let metrics = result.map_err(|e| {
                CoreError::from(ControlError::from(e))
                    .with_field("plugin_name", &owner.name)
                    .with_field("plugin_version", owner.version)
            })?;

            for (ns, ver) in &wanted {
                let subset: Vec<Metric> = metrics
                    .iter()
                    .filter(|m| m.namespace == *ns)
                    .cloned()
                    .collect();
                self.cache.put(ns, *ver, &owner, subset);
            }
            out.extend(metrics);
        }
        Ok(out)
    }

    async fn process(
        &self,
        plugin: &PluginId,
        payload: Payload,
        config: &ConfigMap,
    ) -> CoreResult<Payload> {
        let record = self.record(plugin).map_err(CoreError::from)?;
        if record.id.plugin_type != PluginType::Processor {
            return Err(CoreError::new(
                oxtel_common::error::ErrorKind::Validation,
                format!("{} is not a processor", record.id),
            ));
        }
        let merged = record.policy.apply(config)?;
        let checkout = record.pool.checkout().await.map_err(CoreError::from)?;
        let result = checkout
            .runner()
            .process(payload, &merged, self.cfg.call_timeout)
            .await;
        record.pool.checkin(checkout).await;
        result.map_err(|e| CoreError::from(ControlError::from(e)))
    }

    async fn publish(
        &self,
        plugin: &PluginId,
        payload: Payload,
        config: &ConfigMap,
    ) -> CoreResult<()> {
        let record = self.record(plugin).map_err(CoreError::from)?;
        if record.id.plugin_type != PluginType::Publisher {
            return Err(CoreError::new(
                oxtel_common::error::ErrorKind::Validation,
                format!("{} is not a publisher", record.id),
            ));
        }
        let merged = record.policy.apply(config)?;
        let checkout = record.pool.checkout().await.map_err(CoreError::from)?;
        let result = checkout
            .runner()
            .publish(payload, &merged, self.cfg.call_timeout)
            .await;
        record.pool.checkin(checkout).await;
        result.map_err(|e| CoreError::from(ControlError::from(e)))
    }

    fn validate_requests(&self, requests: &[CollectRequest]) -> CoreResult<()> {
        for request in requests {
            self.metrics
                .resolve(&request.namespace, request.version)
                .map_err(CoreError::from)?;
        }
        Ok(())
    }
}
