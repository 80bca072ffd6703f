use stream_transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Failures talking to the external system of record.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Failures talking to the downstream notes system.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Target returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Failures reading or writing relay state in the key-value store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt value for {key}: {value}")]
    Corrupt { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Another instance holds the stream lock; retried on the next tick
    #[error("Lock for stream {0} is held elsewhere")]
    LockUnavailable(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] SourceError),

    #[error("Subscription failed: {0}")]
    Subscription(String),
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Target error: {0}")]
    Target(#[from] TargetError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Target error: {0}")]
    Target(#[from] TargetError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_display_carries_stream() {
        let err = RelayError::LockUnavailable("lab_results".into());
        assert_eq!(err.to_string(), "Lock for stream lab_results is held elsewhere");
    }

    #[test]
    fn test_consume_error_from_json() {
        let json_err = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();
        let err: ConsumeError = json_err.into();
        assert!(matches!(err, ConsumeError::InvalidPayload(_)));
    }
}
