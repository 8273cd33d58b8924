use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SkilletError {
    #[error("Core '{0}' is closed")]
    CoreClosed(String),

    #[error("Failed to open reader: {0}")]
    OpenFailed(String),

    #[error("Timed out after {waited_ms} ms waiting for a registered searcher")]
    WaitTimeout { waited_ms: u64 },

    #[error("No searcher available: {0}")]
    NoSearcher(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SkilletError>;

impl From<std::io::Error> for SkilletError {
    fn from(e: std::io::Error) -> Self {
        SkilletError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SkilletError {
    fn from(e: serde_json::Error) -> Self {
        SkilletError::Json(e.to_string())
    }
}
