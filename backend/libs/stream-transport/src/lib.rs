//! Stream transport over a partitioned message broker.
//!
//! Provides a producer with synchronous or fire-and-forget delivery and a
//! consumer group that dispatches messages to per-topic handlers with
//! at-least-once semantics: an offset is committed only after its handler
//! returns `Ok`.
//!
//! # Example
//!
//! ```ignore
//! use stream_transport::{StreamTransport, TransportConfig, ProducerMode, Message};
//!
//! let transport = StreamTransport::kafka(TransportConfig::default())?;
//! let producer = transport.producer(ProducerMode::Sync)?;
//! producer.send(Message::new("chart-sync.lab-results", payload)).await?;
//! ```

pub mod config;
pub mod consumer_group;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod kafka;
pub mod message;
pub mod producer;

pub use config::{AssignmentStrategy, ConsumerGroupConfig, TransportConfig};
pub use consumer_group::{Claim, ConsumerGroup, GroupClient, SessionHandler};
pub use dispatcher::{MessageHandler, TopicDispatcher};
pub use error::{TransportError, TransportResult};
pub use factory::{ClientFactory, KafkaClientFactory, StreamTransport};
pub use kafka::KafkaGroupClient;
pub use message::{ConsumedMessage, Message};
pub use producer::{KafkaProducer, MessagePublisher, ProducerMode};
