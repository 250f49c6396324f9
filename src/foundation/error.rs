pub type ExportResult<T> = Result<T, ExportError>;

/// Failure categories of the export pipeline.
///
/// `TransientMedia` is absorbed by the frame renderer; every other kind reaches the orchestrator,
/// which turns it into a terminal run state.
#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("transient media error: {0}")]
    TransientMedia(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("export cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Copyable discriminant of [`ExportError`], recorded in outcomes and history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Configuration,
    Resource,
    TransientMedia,
    Backend,
    Cancelled,
    Other,
}

impl ExportError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientMedia(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Resource(_) => ErrorKind::Resource,
            Self::TransientMedia(_) => ErrorKind::TransientMedia,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
