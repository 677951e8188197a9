mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MemoryDatabase, RecordingSink};
use mediatheca::database::Database;
use mediatheca::update::{FlushPolicy, UpdateAggregator};

async fn wait_for_emissions(sink: &RecordingSink, count: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if sink.emitted.lock().unwrap().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn duplicate_notifications_coalesce_into_one_emission() {
    let database = MemoryDatabase::new();
    let sink = Arc::new(RecordingSink::default());
    let aggregator = UpdateAggregator::with_interval(
        database as Arc<dyn Database>,
        sink.clone(),
        Duration::from_millis(150),
    );
    aggregator.start();

    aggregator.container_changed(10);
    aggregator.container_changed(10);
    aggregator.container_changed(11);

    assert!(
        wait_for_emissions(&sink, 1, Duration::from_secs(3)).await,
        "no update emitted"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    let emitted = sink.emitted.lock().unwrap().clone();
    assert_eq!(emitted.len(), 1, "expected a single batched emission");
    assert_eq!(emitted[0], "10,1,11,1");

    aggregator.shutdown().await;
}

#[tokio::test]
async fn asap_policy_flushes_without_waiting_for_the_window() {
    let database = MemoryDatabase::new();
    let sink = Arc::new(RecordingSink::default());
    let aggregator = UpdateAggregator::with_interval(
        database as Arc<dyn Database>,
        sink.clone(),
        Duration::from_secs(30),
    );
    aggregator.start();

    aggregator.container_changed_with_policy(42, FlushPolicy::Asap);
    assert!(
        wait_for_emissions(&sink, 1, Duration::from_secs(3)).await,
        "ASAP flush did not happen"
    );
    assert_eq!(sink.emitted.lock().unwrap()[0], "42,1");

    aggregator.shutdown().await;
}

#[tokio::test]
async fn raising_policy_mid_window_forces_a_flush() {
    let database = MemoryDatabase::new();
    let sink = Arc::new(RecordingSink::default());
    let aggregator = UpdateAggregator::with_interval(
        database as Arc<dyn Database>,
        sink.clone(),
        Duration::from_secs(30),
    );
    aggregator.start();

    aggregator.container_changed(7);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.emitted.lock().unwrap().is_empty());

    aggregator.container_changed_with_policy(8, FlushPolicy::Asap);
    assert!(
        wait_for_emissions(&sink, 1, Duration::from_secs(3)).await,
        "policy raise did not flush"
    );
    assert_eq!(sink.emitted.lock().unwrap()[0], "7,1,8,1");

    aggregator.shutdown().await;
}

#[tokio::test]
async fn batched_ids_preserve_order_and_emit_once() {
    let database = MemoryDatabase::new();
    let sink = Arc::new(RecordingSink::default());
    let aggregator = UpdateAggregator::with_interval(
        database as Arc<dyn Database>,
        sink.clone(),
        Duration::from_millis(100),
    );
    aggregator.start();

    aggregator
        .containers_changed(&[3, 4, 3, 5], FlushPolicy::Spec)
        .await;
    assert!(
        wait_for_emissions(&sink, 1, Duration::from_secs(3)).await,
        "batch never flushed"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let emitted = sink.emitted.lock().unwrap().clone();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0], "3,1,4,1,5,1");

    aggregator.shutdown().await;
}

#[tokio::test]
async fn second_window_starts_fresh_update_counters() {
    let database = MemoryDatabase::new();
    let sink = Arc::new(RecordingSink::default());
    let aggregator = UpdateAggregator::with_interval(
        database as Arc<dyn Database>,
        sink.clone(),
        Duration::from_millis(100),
    );
    aggregator.start();

    aggregator.container_changed(10);
    assert!(wait_for_emissions(&sink, 1, Duration::from_secs(3)).await);

    // the one-slot duplicate cache resets between windows
    aggregator.container_changed(10);
    assert!(wait_for_emissions(&sink, 2, Duration::from_secs(3)).await);

    let emitted = sink.emitted.lock().unwrap().clone();
    assert_eq!(emitted, vec!["10,1".to_string(), "10,2".to_string()]);

    aggregator.shutdown().await;
}
