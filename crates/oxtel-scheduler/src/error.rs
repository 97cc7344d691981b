use oxtel_common::error::{CoreError, ErrorKind};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("bad schedule: {0}")]
    BadSchedule(String),

    #[error("bad workflow: {0}")]
    BadWorkflow(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("task {id} cannot {action} while {state}")]
    InvalidTransition {
        id: Uuid,
        action: &'static str,
        state: oxtel_common::types::TaskState,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::BadSchedule(_)
            | SchedulerError::BadWorkflow(_)
            | SchedulerError::InvalidTransition { .. } => ErrorKind::Validation,
            SchedulerError::TaskNotFound(_) => ErrorKind::NotFound,
            SchedulerError::Core(e) => e.kind(),
        }
    }
}

impl From<SchedulerError> for CoreError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Core(core) => core,
            other => CoreError::new(other.kind(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
