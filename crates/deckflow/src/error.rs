//! Error types for Deckflow.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is the
//! closed [`DeckflowError`] enum.
//!
//! # Error Handling Philosophy
//!
//! **System errors always bubble up unchanged:**
//! - `DeckflowError::Io` (from `std::io::Error`) - missing files, permission errors
//!
//! **Application errors are wrapped with context:**
//! - `Validation` - unusable input files or configuration
//! - `Extraction` - the external extractor failed for one task
//! - `Timeout` - a task exceeded its deadline
//! - `Worker` - a worker crashed or the pool was terminated under a task
//! - `Cache` - disk-tier failures (never escape `get`/`set`)
//! - `MissingDependency` - the extractor runtime is not installed
//!
//! # Example
//!
//! ```rust
//! use deckflow::{DeckflowError, Result};
//!
//! fn read_deck(path: &str) -> Result<Vec<u8>> {
//!     let bytes = std::fs::read(path)?;
//!     if bytes.is_empty() {
//!         return Err(DeckflowError::validation(format!("File is empty: {}", path)));
//!     }
//!     Ok(bytes)
//! }
//! ```
use thiserror::Error;

/// Result type alias using `DeckflowError`.
pub type Result<T> = std::result::Result<T, DeckflowError>;

/// Main error type for all Deckflow operations.
#[derive(Debug, Error)]
pub enum DeckflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Extraction error: {message}")]
    Extraction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Worker error: {message}")]
    Worker {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for DeckflowError {
    fn from(err: serde_json::Error) -> Self {
        DeckflowError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

macro_rules! error_constructor {
    ($name:ident, $variant:ident) => {
        pastey::paste! {
            #[doc = "Create a " $variant " error"]
            pub fn $name<S: Into<String>>(message: S) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: None,
                }
            }

            #[doc = "Create a " $variant " error with source"]
            pub fn [<$name _with_source>]<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
                message: S,
                source: E,
            ) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: Some(Box::new(source)),
                }
            }
        }
    };
}

impl DeckflowError {
    error_constructor!(validation, Validation);
    error_constructor!(extraction, Extraction);
    error_constructor!(cache, Cache);
    error_constructor!(serialization, Serialization);
    error_constructor!(worker, Worker);

    /// Short, stable name of the variant, used as the `kind` of recorded errors.
    pub fn kind(&self) -> &'static str {
        match self {
            DeckflowError::Io(_) => "io",
            DeckflowError::Validation { .. } => "validation",
            DeckflowError::Extraction { .. } => "extraction",
            DeckflowError::Cache { .. } => "cache",
            DeckflowError::Serialization { .. } => "serialization",
            DeckflowError::Worker { .. } => "worker",
            DeckflowError::Timeout { .. } => "timeout",
            DeckflowError::MissingDependency(_) => "missing_dependency",
            DeckflowError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DeckflowError = io_err.into();
        assert!(matches!(err, DeckflowError::Io(_)));
        assert!(err.to_string().contains("IO error"));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_validation_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad param");
        let err = DeckflowError::validation_with_source("invalid input", source);
        assert_eq!(err.to_string(), "Validation error: invalid input");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_extraction_error() {
        let err = DeckflowError::extraction("unit 3 failed");
        assert_eq!(err.to_string(), "Extraction error: unit 3 failed");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_worker_error() {
        let err = DeckflowError::worker("worker 2 crashed");
        assert_eq!(err.to_string(), "Worker error: worker 2 crashed");
        assert_eq!(err.kind(), "worker");
    }

    #[test]
    fn test_timeout_error() {
        let err = DeckflowError::Timeout {
            operation: "parse_unit_42".to_string(),
            timeout_ms: 1500,
        };
        assert_eq!(err.to_string(), "Timed out after 1500ms: parse_unit_42");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_missing_dependency_error() {
        let err = DeckflowError::MissingDependency("python3 not found".to_string());
        assert_eq!(err.to_string(), "Missing dependency: python3 not found");
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: DeckflowError = json_err.into();
        assert!(matches!(err, DeckflowError::Serialization { .. }));
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_io_error_bubbles_unchanged() {
        fn read_file() -> Result<String> {
            let content = std::fs::read_to_string("/nonexistent/deck.pptx")?;
            Ok(content)
        }

        assert!(matches!(read_file(), Err(DeckflowError::Io(_))));
    }
}
