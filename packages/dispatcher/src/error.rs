use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),
}

pub type Result<T> = std::result::Result<T, DispatcherError>;
