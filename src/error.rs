// ABOUTME: Error taxonomy for the data layer (configuration, decode, internal, not-supported)
// ABOUTME: Every failed operation surfaces exactly one LayerError with its cause preserved

use std::fmt;
use thiserror::Error;

/// Result type for data layer operations
pub type Result<T> = std::result::Result<T, LayerError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error kinds, used by callers to decide how to report a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or missing mapping/option. Fatal, not retried.
    Configuration,
    /// Malformed continuation token
    Decode,
    /// Store I/O, scan, mapping or parse failure
    Internal,
    /// Operation the layer refuses to attempt
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Decode => write!(f, "decode"),
            Self::Internal => write!(f, "internal"),
            Self::NotSupported => write!(f, "not_supported"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LayerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("decode error: {message}")]
    Decode {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("not supported: {0}")]
    NotSupported(String),
}

impl LayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::DatasetNotFound(_) => ErrorKind::Configuration,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::NotSupported(_) => ErrorKind::NotSupported,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn decode(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Decode {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a store or parser failure, keeping it as the error source
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    /// Chain a failed rollback onto the error that triggered it.
    ///
    /// The rollback failure becomes the headline and the original error
    /// stays reachable through `source()`.
    pub fn with_rollback_failure(self, rollback: LayerError) -> Self {
        Self::Internal {
            message: format!("failed to rollback transaction: {}, underlying: {}", rollback, self),
            source: Some(Box::new(self)),
        }
    }
}
