//! Process wiring: builds every collaborator from [`Config`] and runs the
//! relays and the consumer group until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use redis_utils::RedisPool;
use stream_transport::{ConsumerGroup, StreamTransport, TopicDispatcher};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::{HttpChangeSource, HttpNotesTarget};
use crate::config::Config;
use crate::consumer::LabResultConsumer;
use crate::flags::{watch_consumer_hold, FeatureFlags, RedisFlags, StaticFlags};
use crate::metrics;
use crate::models::EntityKind;
use crate::relay::{PollingRelay, RelayDeps, SystemClock};
use crate::state::RedisState;

pub async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    let redis = RedisPool::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let state = Arc::new(RedisState::new(redis.manager()));
    let flags: Arc<dyn FeatureFlags> = Arc::new(RedisFlags::new(
        redis.manager(),
        StaticFlags::from_defaults(&config.flags),
    ));

    let source = Arc::new(HttpChangeSource::new(&config.source).context("Failed to build source client")?);
    let target = Arc::new(HttpNotesTarget::new(&config.target).context("Failed to build target client")?);
    let clock = Arc::new(SystemClock);

    let transport = StreamTransport::kafka(config.transport.clone())?;
    let producer = transport.producer(config.producer_mode)?;

    let deps = RelayDeps {
        source: source.clone(),
        publisher: producer.clone(),
        checkpoints: state.clone(),
        locks: state.clone(),
        flags: flags.clone(),
        clock: clock.clone(),
    };

    let mut relays = JoinSet::new();
    for entity in EntityKind::ALL {
        let relay = PollingRelay::new(
            entity,
            config.topic_for(entity),
            config.relay.clone(),
            deps.clone(),
        );
        let cancel = cancel.clone();
        relays.spawn(async move { relay.run(cancel).await });
    }

    let consumer = Arc::new(LabResultConsumer::new(source, target, state, clock));
    let dispatcher = TopicDispatcher::new().register(&config.lab_results_topic, consumer);
    let group = Arc::new(transport.consumer_group(&config.consumer_group_config(), dispatcher)?);
    let hold = watch_consumer_hold(flags.clone(), config.flags.refresh_interval, cancel.clone()).await;
    if *hold.borrow() {
        info!("Lab result consumption held by flags, group joins paused");
        if let Err(e) = group.pause() {
            warn!(error = %e, "Failed to pause consumer group before start");
        }
    }
    start_consumer_group(&group, hold, &cancel);

    tokio::spawn(shutdown_on_signal(cancel.clone()));
    info!("chart-sync-service running");

    cancel.cancelled().await;
    info!("Shutting down chart-sync-service");

    if let Err(e) = group.stop().await {
        error!(error = %e, "Consumer group did not close cleanly");
    }

    while let Some(res) = relays.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "Relay task ended abnormally");
        }
    }

    match metrics::gather() {
        Ok(snapshot) => debug!(metrics = %snapshot, "Final metrics snapshot"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }

    producer.close().await.context("Failed to close producer")?;
    info!("chart-sync-service stopped");
    Ok(())
}

/// Spawn the group's start, error drain and pause-control tasks.
///
/// `hold` pauses delivery while set; it is applied before the first session
/// is ready and re-applied to every later one.
fn start_consumer_group(
    group: &Arc<ConsumerGroup>,
    hold: watch::Receiver<bool>,
    cancel: &CancellationToken,
) {
    if let Some(mut errors) = group.errors() {
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                error!(error = %e, "Consumer group error");
            }
        });
    }

    let paused = Arc::clone(group);
    tokio::spawn(async move { paused.run_pause_control(hold).await });

    let starting = Arc::clone(group);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        match starting.start(&cancel).await {
            Ok(()) => info!("Lab result consumer group ready"),
            Err(e) if cancel.is_cancelled() => info!(error = %e, "Consumer group start interrupted by shutdown"),
            Err(e) => error!(error = %e, "Consumer group failed to start"),
        }
    });
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
