use oxtel_common::error::{CoreError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum TribeError {
    #[error("agreement not found: {0}")]
    AgreementNotFound(String),

    #[error("agreement already exists: {0}")]
    AgreementExists(String),

    #[error("member not found: {0}")]
    MemberNotFound(String),

    #[error("tribe io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("undecodable datagram: {0}")]
    Decode(#[from] serde_json::Error),
}

impl TribeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TribeError::AgreementNotFound(_) | TribeError::MemberNotFound(_) => {
                ErrorKind::NotFound
            }
            TribeError::AgreementExists(_) => ErrorKind::Conflict,
            TribeError::Io(_) => ErrorKind::Fatal,
            TribeError::Decode(_) => ErrorKind::Transport,
        }
    }
}

impl From<TribeError> for CoreError {
    fn from(err: TribeError) -> Self {
        CoreError::new(err.kind(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TribeError>;
