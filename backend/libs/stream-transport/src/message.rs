use serde::Serialize;

use crate::error::TransportResult;

/// Unit of transport: a serialized payload addressed to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    /// Partition key; messages with the same key keep their relative order
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Message {
    pub fn new(topic: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value,
            headers: Vec::new(),
        }
    }

    /// Build a message whose value is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: &T,
    ) -> TransportResult<Self> {
        let value = serde_json::to_vec(payload)?;
        Ok(Self {
            topic: topic.into(),
            key: Some(key.into()),
            value,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// A message delivered by a consumer group claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl ConsumedMessage {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
