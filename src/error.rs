//! Error types for the consumption pipeline
//!
//! Transport-level failures stay inside the supervisor and feed the
//! reconnect loop; only `PipelineError` values escape to callers of the
//! consumer facade.

use crate::message::DeliveryTag;
use thiserror::Error;

/// Errors raised by a transport adapter
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {message}")]
    ConnectFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connect timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Subscribe to '{filter}' failed: {message}")]
    SubscribeFailed { filter: String, message: String },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Acknowledgement for {tag} refers to a previous connection")]
    StaleDelivery { tag: DeliveryTag },

    #[error("Acknowledgement for {tag} matches no pending delivery")]
    UnknownDelivery { tag: DeliveryTag },

    #[error("Publish to '{topic}' failed: {message}")]
    PublishFailed { topic: String, message: String },

    #[error("Transport is closed")]
    Closed,
}

impl TransportError {
    /// Create a connect failure wrapping an underlying client error
    pub fn connect_failed<S: Into<String>>(
        message: S,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConnectFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connect failure with no underlying cause
    pub fn connect_refused<S: Into<String>>(message: S) -> Self {
        Self::ConnectFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection-lost error
    pub fn connection_lost<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Whether the reconnect supervisor should treat this as retryable
    ///
    /// Ack bookkeeping errors are local mistakes, not link failures, and
    /// must not trigger a reconnect cycle. A malformed broker URL never
    /// heals on retry either.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::StaleDelivery { .. }
                | TransportError::UnknownDelivery { .. }
                | TransportError::InvalidBrokerUrl(_)
        )
    }
}

/// Failure returned by a message handler
///
/// Carries an optional source so handler authors can surface their own
/// error types without the dispatcher depending on them.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<S: Into<String>>(
        message: S,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failure reported by a dead-letter sink
///
/// Logged and counted by the dispatcher; never propagated, since the
/// delivery is acknowledged regardless of sink health.
#[derive(Debug, Error)]
#[error("Dead-letter sink failed: {message}")]
pub struct DeadLetterError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DeadLetterError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<S: Into<String>>(
        message: S,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Top-level error type for consumer operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectAttemptsExhausted { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
