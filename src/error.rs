//! Error types for the mmWave multi-task trainer

use thiserror::Error;

/// Main error type for trainer operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (unsupported choice or combination)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),

    /// Model construction or forward error
    #[error("Model error: {0}")]
    Model(String),

    /// Tensor shape mismatch
    #[error("Shape error: expected {expected}, got {actual}")]
    Shape {
        /// Expected shape description
        expected: String,
        /// Actual shape description
        actual: String,
    },

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for trainer operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a shape error from anything debug-printable
    pub fn shape(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        Self::Shape {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("unknown scenario 'O2'");
        assert_eq!(err.to_string(), "Configuration error: unknown scenario 'O2'");

        let err = Error::shape([64, 2, 9, 4, 32], [64, 2, 9, 3, 32]);
        assert_eq!(
            err.to_string(),
            "Shape error: expected [64, 2, 9, 4, 32], got [64, 2, 9, 3, 32]"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
