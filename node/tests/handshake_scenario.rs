// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use concord_kernel::entry::codes;
use concord_node::app::stream::POST;
use concord_node::app::{Event, PostEvent, Posted, StreamAnswer, StreamApp, StreamQuery};
use concord_node::config::NodeConfig;
use concord_node::notify::{Subscription, SubscriptionCoordinator, SubscriptionState, TopicRegistry};
use concord_node::runtime::{Client, Cluster, Runtime};
use concord_node::{ClientError, LocalCluster, MemoryStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Replica {
    _runtime: Runtime<StreamApp, MemoryStore>,
    client: Client<StreamApp, MemoryStore>,
    coordinator: Arc<SubscriptionCoordinator<Event>>,
}

async fn start_replica(cluster: &Arc<Cluster<StreamApp, MemoryStore>>, replica_id: u64) -> Replica {
    let cfg = NodeConfig {
        bootstrap: replica_id == 1,
        ..NodeConfig::for_replica(1, replica_id)
    };
    let topics = Arc::new(TopicRegistry::new(cfg.subscription));
    topics.create("events").unwrap();
    let coordinator = Arc::new(SubscriptionCoordinator::new(replica_id, topics));
    let app = Arc::new(StreamApp::new(cfg.namespace.clone(), coordinator.clone()));
    let mut runtime = Runtime::new(cfg, app, Arc::new(MemoryStore::new()));
    let client = runtime.start(cluster).await.unwrap();
    Replica {
        _runtime: runtime,
        client,
        coordinator,
    }
}

async fn three_replicas(first_index: u64) -> (Replica, Replica, Replica) {
    let cluster = LocalCluster::starting_at(1, first_index);
    let r1 = start_replica(&cluster, 1).await;
    let r2 = start_replica(&cluster, 2).await;
    let r3 = start_replica(&cluster, 3).await;
    (r1, r2, r3)
}

fn post(key: &str, id: &str) -> PostEvent {
    PostEvent {
        topic: "events".into(),
        key: key.into(),
        id: id.into(),
        payload: json!({"id": id}),
    }
}

#[tokio::test]
async fn test_start_commits_at_index_and_activates_origin() {
    let (_r1, r2, _r3) = three_replicas(1000).await;

    let cancel = CancellationToken::new();
    let sub = r2.coordinator.subscribe("events", &cancel, None).unwrap();
    let mut rx = sub.listen().unwrap();
    assert_eq!(sub.state(), SubscriptionState::Buffering);

    let index = r2.coordinator.request_start(&r2.client, sub.id(), "events").await.unwrap();
    assert_eq!(index, 1000);
    assert_eq!(sub.state(), SubscriptionState::Started);

    let posted: Posted = r2.client.publish(POST, &post("k", "1")).await.unwrap().decode_data().unwrap();
    assert_eq!(posted.event_id, 1001);

    let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_id, 1001);
    assert_eq!(event.id, "1");
}

#[tokio::test]
async fn test_start_targeting_other_replica_is_noop_locally() {
    let (r1, r2, _r3) = three_replicas(1000).await;

    let sub1 = r1.coordinator.subscribe("events", &CancellationToken::new(), None).unwrap();
    let _rx1 = sub1.listen().unwrap();

    // Same subscription id, but the command is stamped for replica 2.
    let index = r2.coordinator.request_start(&r2.client, sub1.id(), "events").await.unwrap();
    assert_eq!(index, 1000);
    assert_eq!(sub1.state(), SubscriptionState::Buffering);
}

#[tokio::test]
async fn test_unknown_topic_is_rejected_without_stalling_log() {
    let (r1, r2, _r3) = three_replicas(1).await;

    let sub = r2.coordinator.subscribe("events", &CancellationToken::new(), None).unwrap();
    let err = r2.coordinator.request_start(&r2.client, sub.id(), "missing").await.unwrap_err();
    match err {
        ClientError::Rejected { code, message } => {
            assert_eq!(code, codes::TOPIC_NOT_FOUND);
            assert!(message.contains("missing"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    let posted: Posted = r1.client.publish(POST, &post("k", "1")).await.unwrap().decode_data().unwrap();
    assert_eq!(posted.event_id, 2);
}

#[tokio::test]
async fn test_history_and_live_splice_without_gap() {
    let (r1, r2, _r3) = three_replicas(1000).await;

    let sub = r2.coordinator.subscribe("events", &CancellationToken::new(), None).unwrap();
    let mut rx = sub.listen().unwrap();

    // Committed between subscribe and start: buffered.
    r1.client.publish(POST, &post("k", "a")).await.unwrap();
    let index = r2.coordinator.request_start(&r2.client, sub.id(), "events").await.unwrap();
    assert_eq!(index, 1001);
    r1.client.publish(POST, &post("k", "b")).await.unwrap();

    let history = match r2
        .client
        .query(StreamQuery::EventsBefore {
            topic: "events".into(),
            before: index,
            limit: None,
        })
        .await
        .unwrap()
    {
        StreamAnswer::Events(events) => events,
        other => panic!("unexpected answer {:?}", other),
    };
    assert_eq!(history.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![1000]);

    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!((first.event_id, second.event_id), (1000, 1002));

    let mut spliced: Vec<u64> = history.iter().map(|e| e.event_id).collect();
    spliced.extend([first, second].iter().map(|e| e.event_id).filter(|id| *id >= index));
    assert_eq!(spliced, vec![1000, 1002]);
}
