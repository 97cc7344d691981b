use oxtel_common::error::{CoreError, ErrorKind};
use std::time::Duration;

/// Errors raised by the plugin runner. Classification matters: transport
/// failures mark the instance unhealthy, policy and plugin failures are
/// surfaced to the caller and leave the instance alive.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("rpc transport failure: {0}")]
    Transport(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("wire codec failure: {0}")]
    Codec(String),

    #[error("no supported content type among {0:?}")]
    ContentType(Vec<String>),

    #[error("config rejected by plugin: {0}")]
    Policy(String),

    #[error("plugin returned an error: {0}")]
    Plugin(String),

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("keyring: {0}")]
    Keyring(String),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::Handshake(_)
            | PluginError::Transport(_)
            | PluginError::Timeout(_)
            | PluginError::Codec(_)
            | PluginError::ContentType(_)
            | PluginError::Io(_) => ErrorKind::Transport,
            PluginError::Policy(_) => ErrorKind::Policy,
            PluginError::Plugin(_) => ErrorKind::PluginRuntime,
            PluginError::Signature(_) => ErrorKind::Integrity,
            PluginError::Keyring(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a fresh instance may transparently retry the call. Only
    /// idempotent metadata traffic qualifies; data-path calls never do.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport)
    }
}

impl From<PluginError> for CoreError {
    fn from(err: PluginError) -> Self {
        CoreError::new(err.kind(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
