use thiserror::Error;

#[derive(Error, Debug)]
pub enum Bench360Error {
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Bench360Error>;
