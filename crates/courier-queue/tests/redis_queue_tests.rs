//! Priority Queue Integration Tests
//!
//! These tests require a running Redis and are skipped unless
//! `COURIER_TEST_REDIS` is set, e.g.:
//!
//!   COURIER_TEST_REDIS=redis://localhost:6379/15 cargo test -p courier-queue
//!
//! Tests for:
//! - FIFO ordering within a channel and priority
//! - Per-second rate limiting and dethrottling
//! - Externally asserted rate-limit keys
//! - Bulk-only pausing
//! - Complete bookkeeping
//! - Deduper window behavior

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_queue::{Deduper, PopResult, PriorityQueue, QueuePriority};

async fn test_conn() -> Option<ConnectionManager> {
    let url = match std::env::var("COURIER_TEST_REDIS") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("COURIER_TEST_REDIS not set, skipping redis test");
            return None;
        }
    };
    let client = redis::Client::open(url.as_str()).expect("invalid redis url");
    Some(ConnectionManager::new(client).await.expect("redis unreachable"))
}

/// Unique queue type per test so runs never share keys.
fn fresh_queue_type() -> String {
    format!("test-msgs-{}", Uuid::new_v4().simple())
}

/// Waits until we are early in a fresh second so a test that counts pops
/// within one second does not straddle the boundary.
async fn align_to_second_start() {
    loop {
        let millis = Utc::now().timestamp_subsec_millis();
        if millis < 300 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn expect_payload(result: PopResult) -> String {
    match result {
        PopResult::Payload { payload, .. } => payload,
        other => panic!("expected payload, got {other:?}"),
    }
}

#[tokio::test]
async fn test_push_pop_fifo() {
    let Some(conn) = test_conn().await else { return };
    let queue = PriorityQueue::new(conn, fresh_queue_type());
    let channel = Uuid::new_v4();

    for id in 1..=3 {
        queue
            .push(channel, 10, QueuePriority::High, &format!("{{\"id\":{id}}}"), None)
            .await
            .unwrap();
    }

    for id in 1..=3 {
        let result = queue.pop().await.unwrap();
        let payload = expect_payload(result);
        assert_eq!(payload, format!("{{\"id\":{id}}}"));
    }

    assert!(matches!(queue.pop().await.unwrap(), PopResult::Empty));
}

#[tokio::test]
async fn test_high_beats_bulk() {
    let Some(conn) = test_conn().await else { return };
    let queue = PriorityQueue::new(conn, fresh_queue_type());
    let channel = Uuid::new_v4();

    queue.push(channel, 10, QueuePriority::Bulk, "bulk-1", None).await.unwrap();
    queue.push(channel, 10, QueuePriority::High, "high-1", None).await.unwrap();

    assert_eq!(expect_payload(queue.pop().await.unwrap()), "high-1");
    assert_eq!(expect_payload(queue.pop().await.unwrap()), "bulk-1");
}

#[tokio::test]
async fn test_rate_limit_and_dethrottle() {
    let Some(conn) = test_conn().await else { return };
    let queue = PriorityQueue::new(conn, fresh_queue_type());
    let channel = Uuid::new_v4();

    align_to_second_start().await;

    for id in 0..20 {
        queue
            .push(channel, 10, QueuePriority::Bulk, &format!("{{\"id\":{id}}}"), None)
            .await
            .unwrap();
    }

    // ten pops succeed inside the second, the eleventh must wait
    for id in 0..10 {
        let payload = expect_payload(queue.pop().await.unwrap());
        assert_eq!(payload, format!("{{\"id\":{id}}}"));
    }
    assert!(matches!(queue.pop().await.unwrap(), PopResult::Retry));

    // the dethrottler restores eligibility for the next second
    queue.dethrottle().await.unwrap();
    for id in 10..20 {
        let payload = expect_payload(queue.pop().await.unwrap());
        assert_eq!(payload, format!("{{\"id\":{id}}}"));
    }
}

#[tokio::test]
async fn test_external_rate_limit_key() {
    let Some(conn) = test_conn().await else { return };
    let queue = PriorityQueue::new(conn, fresh_queue_type());
    let channel = Uuid::new_v4();

    queue
        .push(channel, 10, QueuePriority::High, "{\"id\":34}", None)
        .await
        .unwrap();
    queue.rate_limit_channel(channel, 2).await.unwrap();

    assert!(matches!(queue.pop().await.unwrap(), PopResult::Retry));

    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(expect_payload(queue.pop().await.unwrap()), "{\"id\":34}");
}

#[tokio::test]
async fn test_bulk_pause_lets_high_flow() {
    let Some(conn) = test_conn().await else { return };
    let queue = PriorityQueue::new(conn, fresh_queue_type());
    let channel = Uuid::new_v4();

    queue.push(channel, 10, QueuePriority::Bulk, "bulk-1", None).await.unwrap();
    queue.push(channel, 10, QueuePriority::High, "high-1", None).await.unwrap();
    queue.rate_limit_bulk(channel, 30).await.unwrap();

    // high still flows while bulk is paused
    assert_eq!(expect_payload(queue.pop().await.unwrap()), "high-1");
    assert!(matches!(queue.pop().await.unwrap(), PopResult::Empty));
}

#[tokio::test]
async fn test_complete_releases_in_flight() {
    let Some(conn) = test_conn().await else { return };
    let queue_type = fresh_queue_type();
    let queue = PriorityQueue::new(conn.clone(), queue_type.clone());
    let channel = Uuid::new_v4();

    queue.push(channel, 10, QueuePriority::High, "one", None).await.unwrap();
    queue.push(channel, 10, QueuePriority::High, "two", None).await.unwrap();

    let token = match queue.pop().await.unwrap() {
        PopResult::Payload { token, .. } => token,
        other => panic!("expected payload, got {other:?}"),
    };

    let mut raw = conn.clone();
    let score: Option<f64> = redis::cmd("ZSCORE")
        .arg(format!("{queue_type}:active"))
        .arg(token.to_string())
        .query_async(&mut raw)
        .await
        .unwrap();
    assert_eq!(score, Some(1.0));

    queue.complete(&token).await.unwrap();

    let score: Option<f64> = redis::cmd("ZSCORE")
        .arg(format!("{queue_type}:active"))
        .arg(token.to_string())
        .query_async(&mut raw)
        .await
        .unwrap();
    assert_eq!(score, Some(0.0));
}

#[tokio::test]
async fn test_size_counts_queued_payloads() {
    let Some(conn) = test_conn().await else { return };
    let queue = PriorityQueue::new(conn, fresh_queue_type());
    let channel_a = Uuid::new_v4();
    let channel_b = Uuid::new_v4();

    assert_eq!(queue.size().await.unwrap(), 0);

    queue.push(channel_a, 10, QueuePriority::Bulk, "a1", None).await.unwrap();
    queue.push(channel_a, 10, QueuePriority::High, "a2", None).await.unwrap();
    queue.push(channel_b, 10, QueuePriority::Bulk, "b1", None).await.unwrap();

    assert_eq!(queue.size().await.unwrap(), 3);
}

#[tokio::test]
async fn test_deferred_push_waits() {
    let Some(conn) = test_conn().await else { return };
    let queue = PriorityQueue::new(conn, fresh_queue_type());
    let channel = Uuid::new_v4();

    let eligible_at = Utc::now().timestamp() + 1;
    queue
        .push(channel, 10, QueuePriority::High, "later", Some(eligible_at))
        .await
        .unwrap();

    assert!(matches!(queue.pop().await.unwrap(), PopResult::Retry));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(expect_payload(queue.pop().await.unwrap()), "later");
}

#[tokio::test]
async fn test_push_msgs_roundtrip() {
    let Some(conn) = test_conn().await else { return };
    let queue = PriorityQueue::new(conn, fresh_queue_type());
    let channel = Uuid::new_v4();

    let msg = courier_common::MsgOut {
        id: courier_common::MsgId(10234),
        uuid: Uuid::new_v4(),
        channel_uuid: channel,
        urn: courier_common::Urn::from_tel("+250788383383", None).unwrap(),
        text: "hello world".to_string(),
        attachments: vec!["image/jpeg:https://example.com/a.jpg".to_string()],
        quick_replies: vec!["yes".to_string(), "no".to_string()],
        high_priority: true,
        response_to_external_id: None,
        error_count: 0,
        session_status: None,
    };

    queue
        .push_msgs(channel, 10, QueuePriority::High, std::slice::from_ref(&msg))
        .await
        .unwrap();

    let payload = expect_payload(queue.pop().await.unwrap());
    let decoded: Vec<courier_common::MsgOut> = serde_json::from_str(&payload).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].id, msg.id);
    assert_eq!(decoded[0].urn, msg.urn);
    assert_eq!(decoded[0].text, msg.text);
    assert_eq!(decoded[0].attachments, msg.attachments);
    assert_eq!(decoded[0].quick_replies, msg.quick_replies);
    assert!(decoded[0].high_priority);
}

#[tokio::test]
async fn test_deduper_returns_prior_value() {
    let Some(conn) = test_conn().await else { return };
    let prefix = format!("test-dedupe-{}", Uuid::new_v4().simple());
    let deduper = Deduper::new(conn, prefix, Duration::from_secs(300));

    assert_eq!(deduper.seen("fingerprint-1").await.unwrap(), None);

    deduper.record("fingerprint-1", "10234").await.unwrap();
    assert_eq!(
        deduper.seen("fingerprint-1").await.unwrap(),
        Some("10234".to_string())
    );
    assert_eq!(deduper.seen("fingerprint-2").await.unwrap(), None);
}

#[tokio::test]
async fn test_record_if_absent_is_first_writer_wins() {
    let Some(conn) = test_conn().await else { return };
    let prefix = format!("test-dedupe-{}", Uuid::new_v4().simple());
    let deduper = Deduper::new(conn, prefix, Duration::from_secs(300));

    assert_eq!(
        deduper.record_if_absent("fingerprint-1", "writer-a").await.unwrap(),
        None
    );
    assert_eq!(
        deduper.record_if_absent("fingerprint-1", "writer-b").await.unwrap(),
        Some("writer-a".to_string())
    );
    // the losing write changed nothing
    assert_eq!(
        deduper.seen("fingerprint-1").await.unwrap(),
        Some("writer-a".to_string())
    );
}

#[tokio::test]
async fn test_record_if_absent_race_admits_one_writer() {
    let Some(conn) = test_conn().await else { return };
    let prefix = format!("test-dedupe-{}", Uuid::new_v4().simple());
    let deduper = std::sync::Arc::new(Deduper::new(conn, prefix, Duration::from_secs(300)));

    // race concurrent writers on the same fingerprint: exactly one claims
    // it, every loser observes the winner's value
    let mut tasks = Vec::new();
    for writer in 0..16 {
        let deduper = deduper.clone();
        tasks.push(tokio::spawn(async move {
            deduper
                .record_if_absent("fingerprint-contested", &format!("writer-{writer}"))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    let mut observed = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            None => winners += 1,
            Some(value) => observed.push(value),
        }
    }
    assert_eq!(winners, 1);

    let recorded = deduper.seen("fingerprint-contested").await.unwrap().unwrap();
    assert!(observed.iter().all(|value| *value == recorded));
}
