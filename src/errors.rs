//! Error handling for the digest pipeline
//!
//! Provider-local failures are expressed as `DigestError` values and converted
//! into structured results at the provider boundary. Only `NoUsableData` is
//! meant to terminate a run.

use crate::event::Provider;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the ingestion and aggregation pipeline
#[derive(Error, Debug)]
pub enum DigestError {
    #[error("Configuration error: {provider} - {message}")]
    Configuration { provider: String, message: String },

    #[error("Transient fetch error: {provider} - {message}")]
    TransientFetch { provider: Provider, message: String },

    #[error("Malformed input: {} - {message}", path.display())]
    MalformedInput { path: PathBuf, message: String },

    #[error("No usable data: none of {attempted} provider(s) produced a report")]
    NoUsableData {
        attempted: usize,
        failures: Vec<String>,
    },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Network operation failed: {operation}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Result alias used across the crate
pub type DigestResult<T> = Result<T, DigestError>;

impl DigestError {
    /// Create a configuration error scoped to a provider (or `"global"`)
    pub fn configuration(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a transient fetch error
    pub fn transient(provider: Provider, message: impl Into<String>) -> Self {
        Self::TransientFetch {
            provider,
            message: message.into(),
        }
    }

    /// Create a malformed input error for a sink path
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MalformedInput {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create a network error
    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            operation: operation.into(),
            source,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Re-tag an error raised while paging a provider.
    ///
    /// Configuration problems keep their kind; everything else becomes a
    /// `TransientFetch` carrying the full error chain as its message.
    pub fn into_fetch_error(self, provider: Provider) -> Self {
        match self {
            Self::Configuration { .. } | Self::TransientFetch { .. } => self,
            other => Self::transient(provider, error_chain(&other)),
        }
    }
}

/// Render an error together with its sources, `outer: inner: root`.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl From<serde_json::Error> for DigestError {
    fn from(err: serde_json::Error) -> Self {
        DigestError::serialization("json_operation", err)
    }
}

impl From<std::io::Error> for DigestError {
    fn from(err: std::io::Error) -> Self {
        DigestError::io("io_operation", err)
    }
}

impl From<reqwest::Error> for DigestError {
    fn from(err: reqwest::Error) -> Self {
        DigestError::network("http_request", err)
    }
}
