//! Error types for noisy-label training runs.

use thiserror::Error;

/// Main error type for the noisy-label training workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Configuration error, always fatal at run start
    #[error("Configuration error: {0}")]
    Config(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A checkpoint could not be applied; names the offending tensor
    #[error("Checkpoint load failed for tensor '{tensor}': {reason}")]
    CheckpointLoad { tensor: String, reason: String },

    /// A peer produced non-finite losses for too many consecutive steps
    #[error("Peer '{peer}' produced non-finite loss for {consecutive} consecutive steps")]
    NumericalInstability { peer: String, consecutive: usize },

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that must abort a run before any compute is allocated.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Dataset(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

/// Specialized Result type for noisy-label training operations.
pub type Result<T> = std::result::Result<T, Error>;
