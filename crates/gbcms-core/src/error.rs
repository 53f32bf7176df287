use crate::resource::{ErrorKind, ResourceError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{message}")]
    RequestFailed {
        status: Option<u16>,
        message: String,
    },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn request(message: impl Into<String>) -> Self {
        ClientError::RequestFailed {
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NotConnected => ErrorKind::NotConnected,
            ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::RequestFailed { .. } | ClientError::Decode(_) => ErrorKind::RequestFailed,
            ClientError::Validation(_) | ClientError::Config(_) => ErrorKind::Validation,
        }
    }

    /// Message shown next to a failed resource. Request failures keep the
    /// server's wording verbatim.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::RequestFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_resource_error(&self) -> ResourceError {
        ResourceError::new(self.kind(), self.user_message())
    }
}
