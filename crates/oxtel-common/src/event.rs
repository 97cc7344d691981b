use crate::types::{PluginId, TaskManifest};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Internal control-plane event, published by the catalog and scheduler
/// and consumed by tribe (and anything else registered).
#[derive(Debug, Clone)]
pub enum Event {
    PluginLoaded { id: PluginId, signed: bool },
    PluginUnloaded { id: PluginId },
    TaskCreated { id: Uuid, manifest: TaskManifest },
    TaskStarted { id: Uuid },
    TaskStopped { id: Uuid },
    TaskRemoved { id: Uuid },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::PluginLoaded { .. } => "plugin-loaded",
            Event::PluginUnloaded { .. } => "plugin-unloaded",
            Event::TaskCreated { .. } => "task-created",
            Event::TaskStarted { .. } => "task-started",
            Event::TaskStopped { .. } => "task-stopped",
            Event::TaskRemoved { .. } => "task-removed",
        }
    }
}

/// Handlers run on the publisher's thread; implementations must not block
/// and should offload real work onto their own queues.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

/// Runtime-registered publish-subscribe bus with synchronous delivery.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(String, Arc<dyn EventHandler>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: Arc<dyn EventHandler>) {
        let mut guard = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        guard.retain(|(n, _)| n != name);
        guard.push((name.to_string(), handler));
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut guard = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        let before = guard.len();
        guard.retain(|(n, _)| n != name);
        guard.len() < before
    }

    pub fn publish(&self, event: &Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let guard = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            guard.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            handler.handle_event(event);
        }
    }
}
