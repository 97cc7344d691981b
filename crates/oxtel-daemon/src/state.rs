use crate::config::DaemonConfig;
use chrono::{DateTime, Utc};
use oxtel_control::PluginCatalog;
use oxtel_scheduler::Scheduler;
use oxtel_tribe::Tribe;
use std::sync::Arc;

/// Resolved control-plane credentials.
pub struct AuthSettings {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<PluginCatalog>,
    pub scheduler: Arc<Scheduler>,
    pub tribe: Option<Arc<Tribe>>,
    pub auth: Arc<AuthSettings>,
    pub start_time: DateTime<Utc>,
    pub config: Arc<DaemonConfig>,
}
