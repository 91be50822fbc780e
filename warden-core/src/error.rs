use thiserror::Error;

pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Timer unavailable: {0}")]
    Timer(String),

    #[error("{0}")]
    Other(String),
}
