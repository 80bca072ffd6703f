//! Broker connection and consumer-group configuration.
//!
//! Both structs are validated before any client is built, so a bad broker
//! list or an empty group id fails at startup rather than inside a session.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rdkafka::ClientConfig;

use crate::error::{TransportError, TransportResult};

/// Connection settings shared by producers and consumer groups.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bootstrap servers
    pub brokers: Vec<String>,
    /// Client id reported to the broker
    pub client_id: String,
    /// Bounded retry count applied by the producer itself
    pub producer_retries: u32,
    /// How long a synchronous send waits for the broker acknowledgement
    pub delivery_timeout: Duration,
    /// Broker request timeout
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "chart-sync".to_string(),
            producer_retries: 5,
            delivery_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Get bootstrap servers as comma-separated string
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(TransportError::config(
                "at least one non-empty broker address is required",
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(TransportError::config("client id must not be empty"));
        }
        if self.delivery_timeout.is_zero() {
            return Err(TransportError::config("delivery timeout must be non-zero"));
        }
        Ok(())
    }

    /// Base rdkafka configuration shared by every client built from this config.
    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("client.id", &self.client_id)
            .set(
                "request.timeout.ms",
                self.request_timeout.as_millis().to_string(),
            );
        config
    }
}

/// Partition assignment strategy used by the consumer group coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentStrategy {
    #[default]
    Range,
    RoundRobin,
}

impl AssignmentStrategy {
    /// Name understood by librdkafka's `partition.assignment.strategy`.
    pub fn as_kafka_str(&self) -> &'static str {
        match self {
            AssignmentStrategy::Range => "range",
            AssignmentStrategy::RoundRobin => "roundrobin",
        }
    }
}

impl fmt::Display for AssignmentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_kafka_str())
    }
}

impl FromStr for AssignmentStrategy {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "range" => Ok(AssignmentStrategy::Range),
            "roundrobin" | "round-robin" | "round_robin" => Ok(AssignmentStrategy::RoundRobin),
            other => Err(TransportError::config(format!(
                "unknown partition assignment strategy: {}",
                other
            ))),
        }
    }
}

/// Consumer group membership settings.
#[derive(Debug, Clone)]
pub struct ConsumerGroupConfig {
    pub group_id: String,
    /// Closed topic set; every entry needs a registered handler
    pub topics: Vec<String>,
    pub strategy: AssignmentStrategy,
    pub session_timeout: Duration,
    pub auto_offset_reset: String,
}

impl ConsumerGroupConfig {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            strategy: AssignmentStrategy::default(),
            session_timeout: Duration::from_secs(30),
            auto_offset_reset: "earliest".to_string(),
        }
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.group_id.trim().is_empty() {
            return Err(TransportError::config("consumer group id must not be empty"));
        }
        if self.topics.is_empty() {
            return Err(TransportError::config(
                "consumer group needs at least one topic",
            ));
        }
        if let Some(topic) = self.topics.iter().find(|t| t.trim().is_empty()) {
            return Err(TransportError::config(format!(
                "invalid topic name: {:?}",
                topic
            )));
        }
        if !matches!(self.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(TransportError::config(format!(
                "auto offset reset must be earliest or latest, got {}",
                self.auto_offset_reset
            )));
        }
        Ok(())
    }
}
