use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmotagError {
    #[error("Required input not found: {0}")]
    MissingInput(String),

    #[error("Audio decoding failed: {0}")]
    Decode(String),

    #[error("Invalid rename: {0}")]
    InvalidRename(String),

    #[error("Destination already exists: {0}")]
    DestinationCollision(String),

    #[error("Recognition failed: {0}")]
    Recognition(String),

    #[error("Result log schema error: {0}")]
    Schema(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EmotagError {
    /// Whether this error means a required top-level input was absent.
    pub fn is_missing_input(&self) -> bool {
        matches!(self, EmotagError::MissingInput(_))
    }
}

pub type Result<T> = std::result::Result<T, EmotagError>;
