use oxtel_common::error::{CoreError, ErrorKind};
use oxtel_common::types::PluginId;
use oxtel_plugin::PluginError;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("plugin is already loaded")]
    AlreadyLoaded { id: PluginId },

    #[error("plugin not found")]
    PluginNotFound { id: PluginId },

    #[error("metric not found: {namespace} (version {version})")]
    MetricNotFound { namespace: String, version: u32 },

    #[error("bad namespace: {0}")]
    BadNamespace(String),

    #[error("checksum mismatch on requested plugin to load")]
    ChecksumMismatch,

    #[error("plugin pool exhausted")]
    PoolExhausted { id: PluginId },

    #[error("catalog is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("artifact store failure: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::AlreadyLoaded { .. } => ErrorKind::Conflict,
            ControlError::PluginNotFound { .. } | ControlError::MetricNotFound { .. } => {
                ErrorKind::NotFound
            }
            ControlError::BadNamespace(_) => ErrorKind::Validation,
            ControlError::ChecksumMismatch => ErrorKind::Integrity,
            ControlError::PoolExhausted { .. } | ControlError::ShuttingDown => ErrorKind::Resource,
            ControlError::Plugin(e) => e.kind(),
            ControlError::Core(e) => e.kind(),
            ControlError::Io(_) => ErrorKind::Resource,
        }
    }
}

impl From<ControlError> for CoreError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Core(core) => core,
            other => CoreError::new(other.kind(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
