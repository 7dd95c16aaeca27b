// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use concord_node::config::SubscriptionConfig;
use concord_node::notify::{Subscription, SubscriptionError, SubscriptionState, Topic};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

fn topic() -> Topic<u64> {
    Topic::new("events", SubscriptionConfig::default())
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_buffered_before_start_delivered_in_order() {
    let topic = topic();
    let sub = topic.subscribe_standard(&CancellationToken::new(), None);
    let mut rx = sub.listen().unwrap();
    assert_eq!(sub.state(), SubscriptionState::Buffering);

    for m in 1..=3 {
        assert_eq!(topic.broadcast(m).await, 1);
    }
    settle().await;
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    sub.start().unwrap();
    assert_eq!(sub.state(), SubscriptionState::Started);
    topic.broadcast(4).await;
    topic.broadcast(5).await;

    let mut got = Vec::new();
    for _ in 0..5 {
        got.push(rx.recv().await.unwrap());
    }
    assert_eq!(got, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_never_listened_self_closes() {
    let topic = topic();
    let sub = topic.subscribe_standard(&CancellationToken::new(), None);
    sub.publish(1).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), sub.closed()).await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Closed);

    // Nothing buffered ever comes out.
    let mut rx = sub.listen().unwrap();
    assert_eq!(rx.recv().await, None);
    assert_eq!(sub.publish(2).await, Err(SubscriptionError::Closed));
    assert_eq!(sub.start(), Err(SubscriptionError::Closed));

    settle().await;
    assert!(topic.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_never_listened_closes_despite_steady_traffic() {
    let topic = topic();
    let sub = topic.subscribe_standard(&CancellationToken::new(), None);
    let started = tokio::time::Instant::now();

    for m in 0..20 {
        if sub.publish(m).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert!(started.elapsed() < Duration::from_millis(300), "closed after {:?}", started.elapsed());
    assert_eq!(sub.publish(99).await, Err(SubscriptionError::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_listened_subscription_survives_idle() {
    let topic = topic();
    let sub = topic.subscribe_standard(&CancellationToken::new(), None);
    let mut rx = sub.listen().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(sub.state(), SubscriptionState::Buffering);

    sub.start().unwrap();
    topic.broadcast(8).await;
    assert_eq!(rx.recv().await, Some(8));
}

#[tokio::test]
async fn test_cancel_closes_and_rejects_publish() {
    let topic = topic();
    let cancel = CancellationToken::new();
    let sub = topic.subscribe_standard(&cancel, None);
    let mut rx = sub.listen().unwrap();
    sub.start().unwrap();

    cancel.cancel();
    assert_eq!(rx.recv().await, None);
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(sub.publish(1).await, Err(SubscriptionError::Closed));

    settle().await;
    assert_eq!(topic.broadcast(1).await, 0);
}

#[tokio::test]
async fn test_unread_subscriber_absorbs_burst_within_capacity() {
    let config = SubscriptionConfig {
        queue_capacity: 2,
        ..SubscriptionConfig::default()
    };
    let topic: Topic<u64> = Topic::new("events", config);

    // Listens but never drains.
    let slow = topic.subscribe_standard(&CancellationToken::new(), None);
    let _slow_rx = slow.listen().unwrap();
    slow.start().unwrap();

    let fast = topic.subscribe_standard(&CancellationToken::new(), None);
    let mut fast_rx = fast.listen().unwrap();
    fast.start().unwrap();

    let drain = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(m) = fast_rx.recv().await {
            seen.push(m);
            if seen.len() == 3 {
                break;
            }
        }
        seen
    });

    // slow's outward queue (2) plus its inbound queue (2) absorb the burst.
    for m in 0..3 {
        topic.broadcast(m).await;
    }
    assert_eq!(drain.await.unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_filtered_subscription() {
    let topic = topic();
    let filter: concord_node::notify::Filter<u64> = Arc::new(|m| *m >= 10);
    let sub = topic.subscribe_standard(&CancellationToken::new(), Some(filter));
    let mut rx = sub.listen().unwrap();
    sub.start().unwrap();
    for m in [1, 10, 2, 20] {
        topic.broadcast(m).await;
    }
    assert_eq!(rx.recv().await, Some(10));
    assert_eq!(rx.recv().await, Some(20));
}
