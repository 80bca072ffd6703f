//! librdkafka-backed [`GroupClient`].
//!
//! Rebalance callbacks run on rdkafka's background thread and are forwarded
//! to the session loop over an unbounded channel. Each assigned partition is
//! split into its own queue and consumed by a dedicated task, while the main
//! consumer keeps being polled so callbacks fire.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::ClientContext;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerGroupConfig, TransportConfig};
use crate::consumer_group::{Claim, GroupClient, SessionHandler};
use crate::error::{TransportError, TransportResult};
use crate::message::ConsumedMessage;

#[derive(Debug)]
enum SessionEvent {
    Assigned(Vec<Claim>),
    Revoked(Vec<Claim>),
    Failed(String),
}

fn claims_of(tpl: &TopicPartitionList) -> Vec<Claim> {
    tpl.elements()
        .iter()
        .map(|e| Claim::new(e.topic(), e.partition()))
        .collect()
}

/// Forwards rebalance notifications to the active session.
pub struct GroupContext {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions_revoked = tpl.count(), "Kafka rebalance: partitions being revoked");
                let _ = self.events.send(SessionEvent::Revoked(claims_of(tpl)));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(msg) => {
                warn!(error = %msg, "Kafka rebalance error");
                let _ = self.events.send(SessionEvent::Failed(msg.to_string()));
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            info!(partitions_assigned = tpl.count(), "Kafka rebalance: partitions assigned");
            let _ = self.events.send(SessionEvent::Assigned(claims_of(tpl)));
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

fn to_consumed(msg: &BorrowedMessage<'_>) -> ConsumedMessage {
    let headers = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    (
                        h.key.to_string(),
                        h.value
                            .map(|v| String::from_utf8_lossy(v).into_owned())
                            .unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    ConsumedMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        value: msg.payload().unwrap_or_default().to_vec(),
        headers,
    }
}

/// Process one message and commit its offset only when the handler succeeds.
///
/// Returns `false` when the handler failed; the caller must stop advancing
/// this partition so the committed offset stays before the failed message.
async fn process_and_commit(
    consumer: &GroupConsumer,
    handler: &dyn SessionHandler,
    msg: &BorrowedMessage<'_>,
) -> bool {
    let consumed = to_consumed(msg);
    match handler.process(&consumed).await {
        Ok(()) => {
            if let Err(e) = consumer.commit_message(msg, CommitMode::Async) {
                warn!(
                    topic = %consumed.topic,
                    partition = consumed.partition,
                    offset = consumed.offset,
                    error = %e,
                    "Failed to commit offset"
                );
            }
            true
        }
        Err(e) => {
            error!(
                topic = %consumed.topic,
                partition = consumed.partition,
                offset = consumed.offset,
                error = %e,
                "Message handler failed, offset not committed"
            );
            false
        }
    }
}

fn pause_claim(consumer: &GroupConsumer, claim: &Claim) {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(&claim.topic, claim.partition);
    if let Err(e) = consumer.pause(&tpl) {
        warn!(topic = %claim.topic, partition = claim.partition, error = %e, "Failed to pause claim");
    }
}

/// Kafka consumer group member.
pub struct KafkaGroupClient {
    consumer: Arc<GroupConsumer>,
    events: Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
    group_id: String,
}

impl KafkaGroupClient {
    /// Create the consumer and subscribe to the group's topics.
    ///
    /// Auto-commit is disabled; offsets are committed per message after the
    /// handler succeeds.
    pub fn new(transport: &TransportConfig, group: &ConsumerGroupConfig) -> TransportResult<Self> {
        transport.validate()?;
        group.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: GroupConsumer = transport
            .client_config()
            .set("group.id", &group.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &group.auto_offset_reset)
            .set(
                "session.timeout.ms",
                group.session_timeout.as_millis().to_string(),
            )
            .set("partition.assignment.strategy", group.strategy.as_kafka_str())
            .create_with_context(GroupContext { events: tx })?;

        let topics: Vec<&str> = group.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        info!(
            group_id = %group.group_id,
            topics = ?group.topics,
            strategy = %group.strategy,
            "Kafka consumer group created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            events: Mutex::new(rx),
            group_id: group.group_id.clone(),
        })
    }

    fn spawn_claim(
        &self,
        workers: &mut JoinSet<()>,
        claim: Claim,
        handler: Arc<dyn SessionHandler>,
        cancel: CancellationToken,
    ) {
        let Some(queue) = self
            .consumer
            .split_partition_queue(&claim.topic, claim.partition)
        else {
            warn!(
                topic = %claim.topic,
                partition = claim.partition,
                "Could not split partition queue, messages will be handled inline"
            );
            return;
        };

        let consumer = Arc::clone(&self.consumer);
        workers.spawn(async move {
            debug!(topic = %claim.topic, partition = claim.partition, "Claim started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = queue.recv() => match msg {
                        Ok(msg) => {
                            if !process_and_commit(&consumer, handler.as_ref(), &msg).await {
                                // Redelivered from the committed offset on the next assignment.
                                pause_claim(&consumer, &claim);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(topic = %claim.topic, partition = claim.partition, error = %e, "Claim receive error");
                        }
                    }
                }
            }
            debug!(topic = %claim.topic, partition = claim.partition, "Claim stopped");
        });
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn consume(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn SessionHandler>,
    ) -> TransportResult<()> {
        let mut events = self.events.lock().await;
        let claim_cancel = cancel.child_token();
        let mut workers = JoinSet::new();
        let mut active: BTreeSet<Claim> = BTreeSet::new();

        let current = claims_of(&self.consumer.assignment()?);
        if !current.is_empty() {
            // Setup runs first so a re-applied pause lands before any claim polls.
            handler.setup(&current);
            for claim in &current {
                self.spawn_claim(&mut workers, claim.clone(), Arc::clone(&handler), claim_cancel.clone());
            }
            active.extend(current);
        }

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = events.recv() => match event {
                    Some(SessionEvent::Assigned(claims)) => {
                        let assigned: BTreeSet<Claim> = claims.iter().cloned().collect();
                        if active.is_empty() {
                            handler.setup(&claims);
                            for claim in &claims {
                                self.spawn_claim(&mut workers, claim.clone(), Arc::clone(&handler), claim_cancel.clone());
                            }
                            active = assigned;
                        } else if assigned != active {
                            debug!(group_id = %self.group_id, "Assignment changed, ending session");
                            break Ok(());
                        }
                    }
                    Some(SessionEvent::Revoked(_)) => {
                        if !active.is_empty() {
                            debug!(group_id = %self.group_id, "Claims revoked, ending session");
                            break Ok(());
                        }
                    }
                    Some(SessionEvent::Failed(reason)) => break Err(TransportError::Session(reason)),
                    None => break Err(TransportError::Closed),
                },
                msg = self.consumer.recv() => match msg {
                    Ok(msg) => {
                        if !process_and_commit(&self.consumer, handler.as_ref(), &msg).await {
                            pause_claim(&self.consumer, &Claim::new(msg.topic(), msg.partition()));
                        }
                    }
                    Err(e) => break Err(e.into()),
                },
            }
        };

        claim_cancel.cancel();
        while workers.join_next().await.is_some() {}
        handler.cleanup();

        result
    }

    fn pause(&self) -> TransportResult<()> {
        let assignment = self.consumer.assignment()?;
        self.consumer.pause(&assignment)?;
        Ok(())
    }

    fn resume(&self) -> TransportResult<()> {
        let assignment = self.consumer.assignment()?;
        self.consumer.resume(&assignment)?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.consumer.unsubscribe();
        info!(group_id = %self.group_id, "Kafka consumer group closed");
        Ok(())
    }
}
