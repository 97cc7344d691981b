//! Wiring between tribe and the local subsystems: replicated deltas are
//! executed through the catalog and scheduler public APIs, fetching
//! plugin artifacts from the originating peer's control plane when they
//! are not present locally.

use crate::state::AuthSettings;
use async_trait::async_trait;
use oxtel_common::error::{CoreError, CoreResult, ErrorKind};
use oxtel_common::manage::TribeDelegate;
use oxtel_common::types::{PluginId, TaskManifest};
use oxtel_control::{artifact, PluginCatalog};
use oxtel_scheduler::Scheduler;
use std::sync::Arc;
use uuid::Uuid;

pub struct DaemonDelegate {
    catalog: Arc<PluginCatalog>,
    scheduler: Arc<Scheduler>,
    http: reqwest::Client,
    auth: Arc<AuthSettings>,
}

impl DaemonDelegate {
    pub fn new(
        catalog: Arc<PluginCatalog>,
        scheduler: Arc<Scheduler>,
        auth: Arc<AuthSettings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            scheduler,
            http: reqwest::Client::new(),
            auth,
        })
    }

    async fn fetch_artifact(&self, id: &PluginId, origin: &str) -> CoreResult<Vec<u8>> {
        let url = format!(
            "http://{origin}/v1/plugins/{}/{}/{}?download=1",
            id.plugin_type, id.name, id.version
        );
        let mut request = self.http.get(&url);
        if self.auth.enabled {
            request = request.basic_auth(&self.auth.username, Some(&self.auth.password));
        }
        let response = request.send().await.map_err(|e| {
            CoreError::new(ErrorKind::Transport, format!("fetch {url}: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(CoreError::new(
                ErrorKind::Transport,
                format!("fetch {url}: peer answered {}", response.status()),
            ));
        }
        let bytes = response.bytes().await.map_err(|e| {
            CoreError::new(ErrorKind::Transport, format!("fetch {url}: {e}"))
        })?;
        // the download endpoint serves gzip; tolerate peers that answer
        // with pre-inflated bytes
        match artifact::gunzip(&bytes) {
            Ok(inflated) => Ok(inflated),
            Err(_) => Ok(bytes.to_vec()),
        }
    }
}

/// Accept outcomes that mean "the cluster already converged here".
fn tolerate_idempotent(result: CoreResult<()>, tolerated: ErrorKind) -> CoreResult<()> {
    match result {
        Err(e) if e.kind() == tolerated => Ok(()),
        other => other,
    }
}

#[async_trait]
impl TribeDelegate for DaemonDelegate {
    async fn load_plugin(&self, id: &PluginId, origin_rest: Option<&str>) -> CoreResult<()> {
        if self.catalog.resolve(id).is_some() {
            return Ok(());
        }
        let Some(origin) = origin_rest else {
            return Err(CoreError::new(
                ErrorKind::NotFound,
                format!("no origin to fetch {id} from"),
            ));
        };
        let bytes = self.fetch_artifact(id, origin).await?;
        let filename = format!("{}-{}-v{}", id.plugin_type, id.name, id.version);
        self.catalog
            .load(&filename, &bytes, None)
            .await
            .map(drop)
            .map_err(CoreError::from)
    }

    async fn unload_plugin(&self, id: &PluginId) -> CoreResult<()> {
        tolerate_idempotent(
            self.catalog
                .unload(id)
                .await
                .map(drop)
                .map_err(CoreError::from),
            ErrorKind::NotFound,
        )
    }

    async fn create_task(&self, id: Uuid, manifest: &TaskManifest) -> CoreResult<()> {
        tolerate_idempotent(
            self.scheduler
                .create_with_id(id, manifest.clone())
                .await
                .map(drop)
                .map_err(CoreError::from),
            ErrorKind::Conflict,
        )
    }

    async fn start_task(&self, id: Uuid) -> CoreResult<()> {
        self.scheduler
            .start(id)
            .map(drop)
            .map_err(CoreError::from)
    }

    async fn stop_task(&self, id: Uuid) -> CoreResult<()> {
        self.scheduler.stop(id).map(drop).map_err(CoreError::from)
    }

    async fn remove_task(&self, id: Uuid) -> CoreResult<()> {
        tolerate_idempotent(
            self.scheduler.remove(id).map(drop).map_err(CoreError::from),
            ErrorKind::NotFound,
        )
    }
}
