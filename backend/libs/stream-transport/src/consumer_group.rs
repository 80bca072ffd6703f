//! Consumer group session lifecycle.
//!
//! ```text
//!  start ──▶ Joining ──setup()──▶ Ready/Consuming ──rebalance──▶ cleanup() ─┐
//!               ▲                                                           │
//!               └──────────────────── outer consume loop ◀──────────────────┘
//!  cancel ──▶ Stopped (claims cancelled, client closed)
//! ```
//!
//! A [`GroupClient`] runs exactly one session per `consume` call and returns
//! when the broker rebalances, the connection fails, or the session token is
//! cancelled. [`ConsumerGroup`] re-enters `consume` until its root token is
//! cancelled, resetting the readiness signal between sessions and reporting
//! session errors on a channel instead of returning them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::TopicDispatcher;
use crate::error::{TransportError, TransportResult};
use crate::message::ConsumedMessage;

const ERROR_CHANNEL_CAPACITY: usize = 64;
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// A topic-partition assigned to this member for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Claim {
    pub topic: String,
    pub partition: i32,
}

impl Claim {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Callbacks a [`GroupClient`] drives during one session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Claims were assigned and the session is ready to consume.
    fn setup(&self, claims: &[Claim]);

    /// The session ended; no further `process` calls follow.
    fn cleanup(&self);

    /// Process one message. The client commits its offset only on `Ok`.
    async fn process(&self, message: &ConsumedMessage) -> anyhow::Result<()>;
}

/// Broker-side consumer group membership.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Run one session; blocks until rebalance, error or cancellation.
    async fn consume(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn SessionHandler>,
    ) -> TransportResult<()>;

    /// Suspend delivery without leaving the group.
    fn pause(&self) -> TransportResult<()>;

    fn resume(&self) -> TransportResult<()>;

    /// Leave the group and release the broker connection.
    async fn close(&self) -> TransportResult<()>;
}

/// Bridges session callbacks to the dispatcher and the readiness signal.
///
/// A pause applies to one assignment only, so `setup` re-applies it to the
/// claims of every new session while the group is paused.
struct DispatchingHandler {
    dispatcher: TopicDispatcher,
    ready: watch::Sender<bool>,
    client: Arc<dyn GroupClient>,
    paused: Arc<AtomicBool>,
}

#[async_trait]
impl SessionHandler for DispatchingHandler {
    fn setup(&self, claims: &[Claim]) {
        if self.paused.load(Ordering::SeqCst) {
            match self.client.pause() {
                Ok(()) => info!(claims = claims.len(), "Re-applied pause to new claims"),
                Err(e) => warn!(error = %e, "Failed to re-apply pause to new claims"),
            }
        }
        info!(claims = claims.len(), "Consumer group session ready");
        self.ready.send_replace(true);
    }

    fn cleanup(&self) {
        if self.ready.send_replace(false) {
            debug!("Consumer group session cleaned up");
        }
    }

    async fn process(&self, message: &ConsumedMessage) -> anyhow::Result<()> {
        match AssertUnwindSafe(self.dispatcher.dispatch(message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    panic = %reason,
                    "Message handler panicked"
                );
                Err(anyhow::anyhow!("message handler panicked: {}", reason))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Consumer group driven by an outer retry loop around [`GroupClient::consume`].
pub struct ConsumerGroup {
    client: Arc<dyn GroupClient>,
    handler: Arc<DispatchingHandler>,
    ready: watch::Receiver<bool>,
    paused: Arc<AtomicBool>,
    errors_tx: mpsc::Sender<TransportError>,
    errors_rx: Mutex<Option<mpsc::Receiver<TransportError>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    retry_backoff: Duration,
}

impl ConsumerGroup {
    pub fn new(client: Arc<dyn GroupClient>, dispatcher: TopicDispatcher) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let paused = Arc::new(AtomicBool::new(false));

        Self {
            handler: Arc::new(DispatchingHandler {
                dispatcher,
                ready: ready_tx,
                client: Arc::clone(&client),
                paused: Arc::clone(&paused),
            }),
            client,
            ready: ready_rx,
            paused,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Initial delay before re-entering `consume` after a session error.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Readiness signal; `true` while a session is set up.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    /// Take the session error stream. Returns `None` after the first call.
    pub fn errors(&self) -> Option<mpsc::Receiver<TransportError>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Spawn the consume loop and block until the first session is ready.
    ///
    /// `parent` is the root cancellation token; cancelling it stops the group.
    pub async fn start(&self, parent: &CancellationToken) -> TransportResult<()> {
        {
            let mut task = self
                .task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if task.is_some() {
                return Err(TransportError::config("consumer group already started"));
            }

            let cancel = self.cancel.clone();
            let link = parent.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = link.cancelled() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            });

            let client = Arc::clone(&self.client);
            let handler = Arc::clone(&self.handler);
            let cancel = self.cancel.clone();
            let errors = self.errors_tx.clone();
            let backoff = self.retry_backoff;

            *task = Some(tokio::spawn(async move {
                let outer = consume_loop(client, handler, cancel, errors, backoff);
                if let Err(panic) = AssertUnwindSafe(outer).catch_unwind().await {
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        "Consumer group runtime panicked, terminating process"
                    );
                    std::process::exit(1);
                }
            }));
        }

        let mut ready = self.ready.clone();
        tokio::select! {
            res = ready.wait_for(|ready| *ready) => {
                res.map_err(|_| TransportError::Closed)?;
                info!("Consumer group is up and running");
                Ok(())
            }
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
        }
    }

    pub fn pause(&self) -> TransportResult<()> {
        self.client.pause()?;
        self.paused.store(true, Ordering::SeqCst);
        info!("Consumer group paused");
        Ok(())
    }

    pub fn resume(&self) -> TransportResult<()> {
        self.client.resume()?;
        self.paused.store(false, Ordering::SeqCst);
        info!("Consumer group resumed");
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Apply a pause/resume control signal until the group stops.
    pub async fn run_pause_control(&self, mut control: watch::Receiver<bool>) {
        loop {
            let want_paused = *control.borrow_and_update();
            if want_paused != self.is_paused() {
                let result = if want_paused {
                    self.pause()
                } else {
                    self.resume()
                };
                if let Err(e) = result {
                    warn!(error = %e, paused = want_paused, "Failed to toggle consumer group delivery");
                }
            }

            tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() {
                        debug!("Pause control channel closed");
                        return;
                    }
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Cancel in-flight claims, wait for the loop to exit and close the client.
    pub async fn stop(&self) -> TransportResult<()> {
        self.cancel.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer group loop did not exit cleanly");
            }
        }

        self.client.close().await?;
        info!("Consumer group stopped");
        Ok(())
    }
}

async fn consume_loop(
    client: Arc<dyn GroupClient>,
    handler: Arc<DispatchingHandler>,
    cancel: CancellationToken,
    errors: mpsc::Sender<TransportError>,
    initial_backoff: Duration,
) {
    let mut backoff = initial_backoff;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let session = cancel.child_token();
        let result = client
            .consume(session, Arc::clone(&handler) as Arc<dyn SessionHandler>)
            .await;

        // A new Ready transition must be observable for the next session.
        handler.cleanup();

        match result {
            Ok(()) => {
                backoff = initial_backoff;
                debug!("Consumer group session ended, rejoining");
            }
            Err(e) => {
                error!(error = %e, "Consumer group session failed");
                if let Err(mpsc::error::TrySendError::Full(e)) = errors.try_send(e) {
                    warn!(error = %e, "Consumer group error channel full, dropping error");
                }

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => break,
                }
                backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
            }
        }
    }

    info!("Consumer group loop exited");
}
