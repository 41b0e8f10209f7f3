use evochora_sqlite::SqliteDb;
use evochora_topic::{
    config::InMemoryTopicConfig, topic_name, InMemoryTopic, SqliteTopic, Topic,
};
use prost::Message;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RUN_ID: &str = "20240301-09300000-0f0e0d0c-0b0a-0908-0706-050403020100";
const OTHER_RUN: &str = "20240302-09300000-0f0e0d0c-0b0a-0908-0706-050403020100";

async fn sqlite_topic(claim_timeout: Duration) -> Topic {
    let db = SqliteDb::new_test_db().await;
    Topic::Sqlite(
        SqliteTopic::new(db, claim_timeout, Duration::from_millis(5))
            .await
            .unwrap(),
    )
}

fn in_memory_topic(claim_timeout: Duration) -> Topic {
    let config = InMemoryTopicConfig {
        claim_timeout,
        poll_interval: Duration::from_millis(5),
    };
    Topic::InMemory(InMemoryTopic::new(&config))
}

fn batch_info(tick_start: i64, tick_end: i64) -> Vec<u8> {
    evochora_types::BatchInfo {
        simulation_run_id: RUN_ID.to_string(),
        storage_path: format!("{}/raw/000/000/batch_{:020}_{:020}.pb", RUN_ID, tick_start, tick_end),
        tick_start,
        tick_end,
        written_at_ms: 1_709_285_400_000,
    }
    .encode_to_vec()
}

async fn assert_fifo_per_consumer(topic: Topic) {
    for (start, end) in [(0, 24), (25, 49), (50, 74)] {
        topic.publish(RUN_ID, batch_info(start, end)).await.unwrap();
    }
    let subscription = topic.subscribe(RUN_ID, "indexer");
    let mut starts = Vec::new();
    while let Some(message) = subscription.poll().await.unwrap() {
        let info = evochora_types::BatchInfo::decode(&message.payload[..]).unwrap();
        starts.push(info.tick_start);
        subscription.ack(&message).await.unwrap();
    }
    assert_eq!(starts, vec![0, 25, 50]);
}

#[tokio::test]
async fn sqlite_delivery_order_is_publish_order() {
    assert_fifo_per_consumer(sqlite_topic(Duration::from_secs(300)).await).await;
}

#[tokio::test]
async fn in_memory_delivery_order_is_publish_order() {
    assert_fifo_per_consumer(in_memory_topic(Duration::from_secs(300))).await;
}

async fn assert_exactly_one_delivery_across_group(topic: Topic) {
    for (start, end) in [(0, 24), (25, 49), (50, 74), (75, 99)] {
        topic.publish(RUN_ID, batch_info(start, end)).await.unwrap();
    }
    // Two consumers in the same group: each message goes to exactly one.
    let a = topic.subscribe(RUN_ID, "indexer");
    let b = topic.subscribe(RUN_ID, "indexer");
    let mut seen = Vec::new();
    loop {
        let from_a = a.poll().await.unwrap();
        let from_b = b.poll().await.unwrap();
        if from_a.is_none() && from_b.is_none() {
            break;
        }
        for (subscription, message) in [(&a, from_a), (&b, from_b)] {
            if let Some(message) = message {
                seen.push(message.id);
                subscription.ack(&message).await.unwrap();
            }
        }
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 4, "each message delivered exactly once");
}

#[tokio::test]
async fn sqlite_competing_consumers_split_the_stream() {
    assert_exactly_one_delivery_across_group(sqlite_topic(Duration::from_secs(300)).await).await;
}

#[tokio::test]
async fn in_memory_competing_consumers_split_the_stream() {
    assert_exactly_one_delivery_across_group(in_memory_topic(Duration::from_secs(300))).await;
}

#[tokio::test]
async fn separate_groups_each_see_every_message() {
    let topic = sqlite_topic(Duration::from_secs(300)).await;
    topic.publish(RUN_ID, batch_info(0, 24)).await.unwrap();

    let indexer = topic.subscribe(RUN_ID, "indexer");
    let renderer = topic.subscribe(RUN_ID, "renderer");
    let for_indexer = indexer.poll().await.unwrap().unwrap();
    let for_renderer = renderer.poll().await.unwrap().unwrap();
    assert_eq!(for_indexer.payload, for_renderer.payload);
    indexer.ack(&for_indexer).await.unwrap();
    renderer.ack(&for_renderer).await.unwrap();
}

async fn assert_unacked_message_redelivers(topic: Topic) {
    topic.publish(RUN_ID, batch_info(0, 24)).await.unwrap();
    let subscription = topic.subscribe(RUN_ID, "indexer");

    let first = subscription.poll().await.unwrap().unwrap();
    assert_eq!(first.delivery_count, 1);
    // Claimed but not acked: invisible until the lease expires.
    assert!(subscription.poll().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let second = subscription.poll().await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.delivery_count, 2);
    subscription.ack(&second).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(
        subscription.poll().await.unwrap().is_none(),
        "acked message must not redeliver after the lease window"
    );
}

#[tokio::test]
async fn sqlite_lease_expiry_redelivers_unacked_messages() {
    assert_unacked_message_redelivers(sqlite_topic(Duration::from_millis(50)).await).await;
}

#[tokio::test]
async fn in_memory_lease_expiry_redelivers_unacked_messages() {
    assert_unacked_message_redelivers(in_memory_topic(Duration::from_millis(50))).await;
}

#[tokio::test]
async fn next_returns_none_on_cancellation() {
    let topic = sqlite_topic(Duration::from_secs(300)).await;
    let subscription = topic.subscribe(RUN_ID, "indexer");
    let cancel = CancellationToken::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(30);
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep_until(deadline).await;
            cancel.cancel();
        }
    });
    // Nothing is published, so the consumer idles on its poll interval
    // until the cancellation fires.
    assert!(subscription.next(&cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_deletes_only_the_matching_run() {
    let topic = sqlite_topic(Duration::from_secs(300)).await;
    topic.publish(RUN_ID, batch_info(0, 24)).await.unwrap();
    topic.publish(RUN_ID, batch_info(25, 49)).await.unwrap();
    topic.publish(OTHER_RUN, batch_info(0, 24)).await.unwrap();

    let names = topic.list_topic_names().await.unwrap();
    assert_eq!(names, vec![topic_name(RUN_ID), topic_name(OTHER_RUN)]);

    let deleted = topic.delete_run(RUN_ID).await.unwrap();
    assert_eq!(deleted, 2);
    let names = topic.list_topic_names().await.unwrap();
    assert_eq!(names, vec![topic_name(OTHER_RUN)]);
}
