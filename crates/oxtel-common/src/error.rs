use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coarse error classification shared by every subsystem. The REST layer
/// maps kinds to HTTP status codes; the scheduler uses them to decide
/// whether a failure counts against a task or against an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Caller input malformed (missing name, bad version, bad namespace,
    /// bad schedule).
    Validation,
    /// Plugin or task not present.
    NotFound,
    /// Duplicate load.
    Conflict,
    /// Config violates the declared config policy.
    Policy,
    /// The plugin returned an error from its own code.
    PluginRuntime,
    /// RPC failure with the plugin subprocess.
    Transport,
    /// Pool exhausted, queue full, stage timeout.
    Resource,
    /// Signature verification failed or checksum mismatch.
    Integrity,
    /// Daemon-level failure; abort with non-zero exit.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Policy => "policy",
            ErrorKind::PluginRuntime => "plugin-runtime",
            ErrorKind::Transport => "transport",
            ErrorKind::Resource => "resource",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// An error carried across subsystem seams, with contextual fields
/// (`plugin_name`, `task_id`, ...) attached for structured logging.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_error_carries_fields() {
        let err = CoreError::new(ErrorKind::NotFound, "plugin not found")
            .with_field("plugin_name", "mock")
            .with_field("plugin_version", 2);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.fields.get("plugin_version").map(String::as_str), Some("2"));
        assert_eq!(err.to_string(), "not-found: plugin not found");
    }
}
