use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessagingError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("Storage unavailable: {0}")]
    TransientStore(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),
}

impl MessagingError {
    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

impl From<mongodb::error::Error> for MessagingError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::TransientStore(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for MessagingError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        Self::TransientStore(format!("Failed to encode document: {}", err))
    }
}
