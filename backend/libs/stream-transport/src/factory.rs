//! Client construction seam.
//!
//! Services build producers and consumer groups through [`StreamTransport`];
//! tests inject a [`ClientFactory`] that hands out in-memory clients.

use std::sync::Arc;

use tracing::info;

use crate::config::{ConsumerGroupConfig, TransportConfig};
use crate::consumer_group::{ConsumerGroup, GroupClient};
use crate::dispatcher::TopicDispatcher;
use crate::error::TransportResult;
use crate::kafka::KafkaGroupClient;
use crate::producer::{KafkaProducer, MessagePublisher, ProducerMode};

pub trait ClientFactory: Send + Sync {
    fn producer(
        &self,
        config: &TransportConfig,
        mode: ProducerMode,
    ) -> TransportResult<Arc<dyn MessagePublisher>>;

    fn group_client(
        &self,
        config: &TransportConfig,
        group: &ConsumerGroupConfig,
    ) -> TransportResult<Arc<dyn GroupClient>>;
}

/// Builds librdkafka clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaClientFactory;

impl ClientFactory for KafkaClientFactory {
    fn producer(
        &self,
        config: &TransportConfig,
        mode: ProducerMode,
    ) -> TransportResult<Arc<dyn MessagePublisher>> {
        Ok(Arc::new(KafkaProducer::new(config, mode)?))
    }

    fn group_client(
        &self,
        config: &TransportConfig,
        group: &ConsumerGroupConfig,
    ) -> TransportResult<Arc<dyn GroupClient>> {
        Ok(Arc::new(KafkaGroupClient::new(config, group)?))
    }
}

/// Entry point for building producers and consumer groups from one config.
#[derive(Clone)]
pub struct StreamTransport {
    config: TransportConfig,
    factory: Arc<dyn ClientFactory>,
}

impl StreamTransport {
    pub fn new(config: TransportConfig, factory: Arc<dyn ClientFactory>) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self { config, factory })
    }

    /// Transport backed by Kafka.
    pub fn kafka(config: TransportConfig) -> TransportResult<Self> {
        Self::new(config, Arc::new(KafkaClientFactory))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn producer(&self, mode: ProducerMode) -> TransportResult<Arc<dyn MessagePublisher>> {
        self.factory.producer(&self.config, mode)
    }

    /// Build a consumer group whose topic set is fully covered by `dispatcher`.
    pub fn consumer_group(
        &self,
        group: &ConsumerGroupConfig,
        dispatcher: TopicDispatcher,
    ) -> TransportResult<ConsumerGroup> {
        group.validate()?;
        dispatcher.validate(&group.topics)?;

        let client = self.factory.group_client(&self.config, group)?;
        info!(group_id = %group.group_id, topics = ?group.topics, "Consumer group configured");
        Ok(ConsumerGroup::new(client, dispatcher))
    }
}
