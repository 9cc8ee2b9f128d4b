use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("Configuration problem: {0}")]
    ConfigError(String),

    #[error("Failed to access the completion provider: {0}")]
    ProviderError(String),

    #[error("Failed to send HTTP request: {0}")]
    HttpError(String),

    #[error("Failed to access local storage: {0}")]
    StorageError(String),

    #[error("Failed to query the remote summary source: {0}")]
    RemoteError(String),

    #[error("Failed to parse data: {0}")]
    ParseError(String),
}

impl From<reqwest::Error> for PanelError {
    fn from(error: reqwest::Error) -> Self {
        PanelError::HttpError(error.to_string())
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(error: serde_json::Error) -> Self {
        PanelError::ParseError(error.to_string())
    }
}

impl From<std::io::Error> for PanelError {
    fn from(error: std::io::Error) -> Self {
        PanelError::StorageError(error.to_string())
    }
}
