//! Error types for the stream transport library.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while producing to or consuming from the broker.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport or consumer-group configuration is unusable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error reported by the Kafka client
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Broker did not acknowledge a message
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Message payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No handler registered for the message topic
    #[error("No handler registered for topic: {0}")]
    UnroutableTopic(String),

    /// Consumer group session ended abnormally (rebalance failure, lost claim)
    #[error("Session error: {0}")]
    Session(String),

    /// Producer or consumer group was already closed
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Shorthand for configuration failures found during validation.
    pub fn config(msg: impl Into<String>) -> Self {
        TransportError::Configuration(msg.into())
    }
}
