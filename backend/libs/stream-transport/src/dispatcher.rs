//! Topic to handler routing for consumed messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{TransportError, TransportResult};
use crate::message::ConsumedMessage;

/// Per-topic message handler.
///
/// Returning an error leaves the message unacknowledged so the broker
/// redelivers it on the next claim assignment or restart.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ConsumedMessage) -> anyhow::Result<()>;
}

/// Routes each consumed message to the handler registered for its topic.
///
/// The topic set is closed: [`TopicDispatcher::validate`] runs at startup
/// against the consumer group's declared topics.
#[derive(Clone, Default)]
pub struct TopicDispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl TopicDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Ensure every declared topic has a handler.
    pub fn validate(&self, topics: &[String]) -> TransportResult<()> {
        for topic in topics {
            if !self.handlers.contains_key(topic) {
                return Err(TransportError::config(format!(
                    "no handler registered for subscribed topic {}",
                    topic
                )));
            }
        }
        Ok(())
    }

    pub async fn dispatch(&self, message: &ConsumedMessage) -> anyhow::Result<()> {
        let handler = self
            .handlers
            .get(&message.topic)
            .ok_or_else(|| TransportError::UnroutableTopic(message.topic.clone()))?;
        handler.handle(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: &ConsumedMessage) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message(topic: &str) -> ConsumedMessage {
        ConsumedMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            value: b"{}".to_vec(),
            headers: vec![],
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_topic() {
        let lab = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let patients = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let dispatcher = TopicDispatcher::new()
            .register("lab-results", lab.clone())
            .register("patients", patients.clone());

        dispatcher.dispatch(&message("lab-results")).await.unwrap();
        dispatcher.dispatch(&message("lab-results")).await.unwrap();
        dispatcher.dispatch(&message("patients")).await.unwrap();

        assert_eq!(lab.0.load(Ordering::SeqCst), 2);
        assert_eq!(patients.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_topic_errors() {
        let dispatcher = TopicDispatcher::new();
        let err = dispatcher.dispatch(&message("orders")).await.unwrap_err();
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_validate_requires_handler_per_topic() {
        let dispatcher = TopicDispatcher::new()
            .register("lab-results", Arc::new(CountingHandler(AtomicUsize::new(0))));

        tokio_test::assert_ok!(dispatcher.validate(&["lab-results".to_string()]));
        tokio_test::assert_err!(
            dispatcher.validate(&["lab-results".to_string(), "patients".to_string()])
        );
        assert_eq!(dispatcher.topics(), vec!["lab-results".to_string()]);
    }
}
