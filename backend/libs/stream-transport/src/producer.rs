//! Message producer with synchronous and fire-and-forget send modes.
//!
//! Retries are applied inside librdkafka (`message.send.max.retries`), never
//! at the call site. In [`ProducerMode::Async`] a send only enqueues the
//! record; delivery failures are logged from a detached task and never
//! returned to the caller.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::message::Message;

/// How `send` relates to broker acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerMode {
    /// Wait for the broker acknowledgement and return its error
    #[default]
    Sync,
    /// Enqueue and return immediately
    Async,
}

impl fmt::Display for ProducerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerMode::Sync => f.write_str("sync"),
            ProducerMode::Async => f.write_str("async"),
        }
    }
}

impl FromStr for ProducerMode {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" | "synchronous" => Ok(ProducerMode::Sync),
            "async" | "asynchronous" => Ok(ProducerMode::Async),
            other => Err(TransportError::config(format!(
                "unknown producer mode: {}",
                other
            ))),
        }
    }
}

/// Publishing seam used by the relay; swapped for an in-memory recorder in tests.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish one message.
    ///
    /// # Errors
    ///
    /// In synchronous mode returns the broker error; in asynchronous mode only
    /// fails if the producer was already closed.
    async fn send(&self, message: Message) -> TransportResult<()>;

    /// Flush pending sends and release broker connections.
    async fn close(&self) -> TransportResult<()>;
}

/// Kafka-backed [`MessagePublisher`].
pub struct KafkaProducer {
    producer: FutureProducer,
    mode: ProducerMode,
    delivery_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaProducer {
    /// Create a new producer.
    ///
    /// The producer is configured with:
    /// - `enable.idempotence = true` and `acks = all`
    /// - `message.send.max.retries` from [`TransportConfig::producer_retries`]
    /// - `message.timeout.ms` from [`TransportConfig::delivery_timeout`]
    pub fn new(config: &TransportConfig, mode: ProducerMode) -> TransportResult<Self> {
        config.validate()?;

        let producer: FutureProducer = config
            .client_config()
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("message.send.max.retries", config.producer_retries.to_string())
            .set(
                "message.timeout.ms",
                config.delivery_timeout.as_millis().to_string(),
            )
            .set("linger.ms", "10")
            .create()?;

        info!(
            brokers = %config.bootstrap_servers(),
            mode = %mode,
            retries = config.producer_retries,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            mode,
            delivery_timeout: config.delivery_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> ProducerMode {
        self.mode
    }

    fn record(message: &Message) -> FutureRecord<'_, str, [u8]> {
        let mut record: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(&message.topic).payload(message.value.as_slice());

        if let Some(key) = &message.key {
            record = record.key(key.as_str());
        }

        if !message.headers.is_empty() {
            let headers = message
                .headers
                .iter()
                .fold(OwnedHeaders::new(), |headers, (key, value)| {
                    headers.insert(Header {
                        key: key.as_str(),
                        value: Some(value.as_bytes()),
                    })
                });
            record = record.headers(headers);
        }

        record
    }

    async fn send_sync(&self, message: &Message) -> TransportResult<()> {
        let (partition, offset) = self
            .producer
            .send(Self::record(message), self.delivery_timeout)
            .await
            .map_err(|(err, _)| {
                TransportError::PublishFailed(format!(
                    "topic {}: Kafka publish failed: {}",
                    message.topic, err
                ))
            })?;

        debug!(
            topic = %message.topic,
            partition,
            offset,
            "Message acknowledged by broker"
        );
        Ok(())
    }

    fn send_async(&self, message: &Message) {
        match self.producer.send_result(Self::record(message)) {
            Ok(delivery) => {
                let topic = message.topic.clone();
                tokio::spawn(async move {
                    match delivery.await {
                        Ok(Ok((partition, offset))) => {
                            debug!(topic = %topic, partition, offset, "Async message delivered");
                        }
                        Ok(Err((err, _))) => {
                            warn!(topic = %topic, error = %err, "Async message delivery failed");
                        }
                        Err(_) => {
                            warn!(topic = %topic, "Async delivery future cancelled");
                        }
                    }
                });
            }
            Err((err, _)) => {
                warn!(
                    topic = %message.topic,
                    error = %err,
                    "Failed to enqueue async message"
                );
            }
        }
    }
}

#[async_trait]
impl MessagePublisher for KafkaProducer {
    async fn send(&self, message: Message) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        match self.mode {
            ProducerMode::Sync => self.send_sync(&message).await,
            ProducerMode::Async => {
                self.send_async(&message);
                Ok(())
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Kafka producer already closed");
            return Ok(());
        }

        let producer = self.producer.clone();
        let timeout = self.delivery_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| TransportError::PublishFailed(format!("flush task failed: {}", e)))??;

        info!("Kafka producer flushed and closed");
        Ok(())
    }
}
