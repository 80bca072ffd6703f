//! Polling relay cycle tests against in-memory collaborators.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chart_sync_service::error::RelayError;
use chart_sync_service::flags::Flag;
use chart_sync_service::models::{ChangeNotification, EntityKind};
use chart_sync_service::relay::{PollingRelay, BACKFILL_HEADER};
use common::{at, relay_config, FakeSource, Harness};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "chart-sync.lab-results";
const STREAM: &str = "lab_results";

fn changes(ids: &[&str]) -> Vec<ChangeNotification> {
    ids.iter().map(|id| ChangeNotification::new(*id)).collect()
}

fn relay(harness: &Harness, page_size: u32) -> PollingRelay {
    PollingRelay::new(
        EntityKind::LabResults,
        TOPIC,
        relay_config(page_size),
        harness.deps(),
    )
}

#[tokio::test]
async fn test_cycle_follows_pagination_in_order() {
    let harness = Harness::new(FakeSource::with_changes(changes(&["1", "2", "3"])), at(1_000));
    let relay = relay(&harness, 2);

    let report = relay.run_cycle().await.unwrap();

    assert_eq!(report.published, 3);
    assert_eq!(report.backfilled, 0);
    assert_eq!(harness.publisher.sent_keys(), vec!["1", "2", "3"]);

    // Listed records are marked processed, so every page reads from the front.
    let offsets: Vec<u32> = harness.source.cursors().iter().map(|c| c.offset).collect();
    assert_eq!(offsets, vec![0, 0]);
    for cursor in harness.source.cursors() {
        assert_eq!(cursor.start_time, None);
        assert_eq!(cursor.end_time, Some(at(1_000)));
        assert_eq!(cursor.limit, Some(2));
    }

    for message in harness.publisher.sent() {
        assert_eq!(message.topic, TOPIC);
        assert!(message.headers.is_empty());
    }
}

#[tokio::test]
async fn test_consuming_listing_reaches_every_page() {
    let harness = Harness::new(
        FakeSource::with_changes(changes(&["1", "2", "3", "4", "5", "6"])),
        at(1_000),
    );

    let report = relay(&harness, 2).run_cycle().await.unwrap();

    assert_eq!(report.published, 6);
    assert_eq!(harness.publisher.sent_keys(), vec!["1", "2", "3", "4", "5", "6"]);
    assert!(harness.source.changes.lock().unwrap().is_empty());
    assert!(harness.source.cursors().iter().all(|c| c.offset == 0));
}

#[tokio::test]
async fn test_unprocessed_listing_advances_offset() {
    let harness = Harness::new(
        FakeSource::with_changes(changes(&["1", "2", "3", "4", "5"])),
        at(1_000),
    );
    let mut config = relay_config(2);
    config.leave_unprocessed = true;
    let relay = PollingRelay::new(EntityKind::LabResults, TOPIC, config, harness.deps());

    let report = relay.run_cycle().await.unwrap();

    assert_eq!(report.published, 5);
    assert_eq!(harness.publisher.sent_keys(), vec!["1", "2", "3", "4", "5"]);
    let offsets: Vec<u32> = harness.source.cursors().iter().map(|c| c.offset).collect();
    assert_eq!(offsets, vec![0, 2, 4]);
    assert!(harness.source.cursors().iter().all(|c| c.leave_unprocessed));
    assert_eq!(harness.source.changes.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn test_clean_cycle_clears_dirty_bit_and_advances_watermark() {
    let harness = Harness::new(FakeSource::with_changes(changes(&["1"])), at(2_000));
    harness.state.set_watermark_of(STREAM, at(1_000));

    tokio_test::assert_ok!(relay(&harness, 50).run_cycle().await);

    assert!(!harness.state.dirty(STREAM));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(2_000)));
    assert!(!harness.state.is_locked(STREAM));
}

#[tokio::test]
async fn test_dirty_bit_with_watermark_backfills_gap() {
    let source = FakeSource::with_changes(changes(&["10"]));
    *source.backfill.lock().unwrap() = changes(&["7", "8"]);
    let harness = Harness::new(source, at(2_000));
    harness.state.set_dirty(STREAM, true);
    harness.state.set_watermark_of(STREAM, at(1_000));

    let report = relay(&harness, 50).run_cycle().await.unwrap();

    assert_eq!(report.backfilled, 2);
    assert_eq!(report.published, 1);
    assert_eq!(harness.publisher.sent_keys(), vec!["7", "8", "10"]);

    let cursors = harness.source.cursors();
    assert_eq!(cursors[0].start_time, Some(at(1_000)));
    assert_eq!(cursors[0].end_time, Some(at(2_000)));

    let sent = harness.publisher.sent();
    let backfilled: Vec<bool> = sent
        .iter()
        .map(|m| m.headers.iter().any(|(k, v)| k == BACKFILL_HEADER && v == "true"))
        .collect();
    assert_eq!(backfilled, vec![true, true, false]);

    assert!(!harness.state.dirty(STREAM));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(2_000)));
}

#[tokio::test]
async fn test_dirty_bit_without_watermark_skips_backfill() {
    let source = FakeSource::with_changes(changes(&["1"]));
    *source.backfill.lock().unwrap() = changes(&["99"]);
    let harness = Harness::new(source, at(2_000));
    harness.state.set_dirty(STREAM, true);

    let report = relay(&harness, 50).run_cycle().await.unwrap();

    assert_eq!(report.backfilled, 0);
    assert_eq!(harness.publisher.sent_keys(), vec!["1"]);
    assert!(harness
        .source
        .cursors()
        .iter()
        .all(|c| c.start_time.is_none()));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(2_000)));
}

#[tokio::test]
async fn test_lock_held_elsewhere_skips_cycle() {
    let harness = Harness::new(FakeSource::with_changes(changes(&["1"])), at(2_000));
    harness.state.hold_lock(STREAM);

    let result = relay(&harness, 50).run_cycle().await;

    assert!(matches!(result, Err(RelayError::LockUnavailable(ref s)) if s == STREAM));
    assert!(harness.publisher.sent().is_empty());
    assert!(harness.source.cursors().is_empty());
    assert_eq!(harness.state.watermark_of(STREAM), None);
}

#[tokio::test]
async fn test_concurrent_cycles_are_mutually_exclusive() {
    let source = FakeSource::with_changes(changes(&["1", "2"]));
    *source.list_delay.lock().unwrap() = Some(Duration::from_millis(100));
    let harness = Harness::new(source, at(2_000));
    let first = relay(&harness, 50);
    let second = relay(&harness, 50);

    let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());

    let results = [a, b];
    let skipped = results
        .iter()
        .filter(|r| matches!(r, Err(RelayError::LockUnavailable(s)) if s == STREAM))
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(harness.publisher.sent_keys(), vec!["1", "2"]);
    assert_eq!(harness.source.cursors().len(), 1);
    assert!(!harness.state.is_locked(STREAM));
}

#[tokio::test]
async fn test_watermark_write_failure_restores_dirty_bit() {
    let harness = Harness::new(FakeSource::with_changes(changes(&["1"])), at(2_000));
    harness.state.set_watermark_of(STREAM, at(1_000));
    harness.state.fail_watermark_writes.store(true, Ordering::SeqCst);

    let result = relay(&harness, 50).run_cycle().await;

    assert!(matches!(result, Err(RelayError::State(_))));
    assert!(harness.state.dirty(STREAM));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(1_000)));
    assert!(!harness.state.is_locked(STREAM));

    // The next cycle backfills the window the failed write left open.
    harness.state.fail_watermark_writes.store(false, Ordering::SeqCst);
    *harness.source.backfill.lock().unwrap() = changes(&["1"]);
    harness.clock.set(at(3_000));

    let report = relay(&harness, 50).run_cycle().await.unwrap();

    assert_eq!(report.backfilled, 1);
    assert!(!harness.state.dirty(STREAM));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(3_000)));
}

#[tokio::test]
async fn test_fetch_failure_leaves_dirty_bit_for_next_cycle() {
    let source = FakeSource::with_changes(changes(&["1"]));
    *source.backfill.lock().unwrap() = changes(&["1"]);
    source.fail_list.store(true, Ordering::SeqCst);
    let harness = Harness::new(source, at(2_000));
    harness.state.set_watermark_of(STREAM, at(1_000));
    let relay = relay(&harness, 50);

    let result = relay.run_cycle().await;

    assert!(matches!(result, Err(RelayError::Fetch(_))));
    assert!(harness.state.dirty(STREAM));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(1_000)));
    assert!(!harness.state.is_locked(STREAM));

    harness.source.fail_list.store(false, Ordering::SeqCst);
    harness.clock.set(at(3_000));

    let report = relay.run_cycle().await.unwrap();

    assert_eq!(report.backfilled, 1);
    assert!(!harness.state.dirty(STREAM));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(3_000)));
}

#[tokio::test]
async fn test_publish_failures_do_not_abort_cycle() {
    let harness = Harness::new(FakeSource::with_changes(changes(&["1", "2", "3"])), at(2_000));
    harness.publisher.reject("2");

    let report = relay(&harness, 50).run_cycle().await.unwrap();

    assert_eq!(report.published, 2);
    assert_eq!(report.publish_failures, 1);
    assert_eq!(harness.publisher.sent_keys(), vec!["1", "3"]);
    assert!(!harness.state.dirty(STREAM));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(2_000)));
}

#[tokio::test]
async fn test_clock_behind_watermark_keeps_stored_value() {
    let harness = Harness::new(FakeSource::default(), at(1_000));
    harness.state.set_watermark_of(STREAM, at(5_000));

    relay(&harness, 50).run_cycle().await.unwrap();

    assert_eq!(harness.state.watermark_of(STREAM), Some(at(5_000)));
    assert!(!harness.state.dirty(STREAM));
}

#[tokio::test]
async fn test_ensure_subscribed_subscribes_once() {
    let harness = Harness::new(FakeSource::default(), at(1_000));
    let relay = relay(&harness, 50);

    relay.ensure_subscribed().await.unwrap();
    relay.ensure_subscribed().await.unwrap();

    assert_eq!(*harness.source.subscribe_calls.lock().unwrap(), 1);
    assert!(harness
        .source
        .subscribed
        .lock()
        .unwrap()
        .contains(&EntityKind::LabResults));
}

#[tokio::test]
async fn test_run_honours_poll_flag_and_cancellation() {
    let harness = Harness::new(FakeSource::with_changes(changes(&["1"])), at(1_000));
    harness.flags.set(Flag::Poll(EntityKind::LabResults), false);
    let relay = relay(&harness, 50);
    let cancel = CancellationToken::new();

    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();
    });
    tokio::time::timeout(Duration::from_secs(2), relay.run(cancel))
        .await
        .expect("relay stops on cancellation");

    assert!(harness.publisher.sent().is_empty());
    assert!(harness.source.cursors().is_empty());

    harness.flags.set(Flag::Poll(EntityKind::LabResults), true);
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();
    });
    tokio::time::timeout(Duration::from_secs(2), relay.run(cancel))
        .await
        .expect("relay stops on cancellation");

    assert!(harness.publisher.sent_keys().contains(&"1".to_string()));
    assert_eq!(harness.state.watermark_of(STREAM), Some(at(1_000)));
}
