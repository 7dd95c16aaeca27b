// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use concord_node::app::stream::POST;
use concord_node::app::{Event, PostEvent, StreamAnswer, StreamApp, StreamQuery};
use concord_node::config::{NodeConfig, RetryPolicy, SubscriptionConfig};
use concord_node::consensus::{LeaderInfo, LeaderListener};
use concord_node::notify::{Subscription, SubscriptionCoordinator, TopicRegistry};
use concord_node::runtime::{Client, Cluster, Runtime};
use concord_node::{ClientError, LocalCluster, MemoryStore, RuntimeError};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Node = Runtime<StreamApp, MemoryStore>;

fn runtime(replica_id: u64, bootstrap: bool, store: Arc<MemoryStore>) -> Node {
    let cfg = NodeConfig {
        bootstrap,
        ..NodeConfig::for_replica(1, replica_id)
    };
    let topics: Arc<TopicRegistry<Event>> = Arc::new(TopicRegistry::new(cfg.subscription));
    let coordinator = Arc::new(SubscriptionCoordinator::new(replica_id, topics));
    let app = Arc::new(StreamApp::new(cfg.namespace.clone(), coordinator));
    Runtime::new(cfg, app, store)
}

fn post(id: &str) -> PostEvent {
    PostEvent {
        topic: "events".into(),
        key: "key".into(),
        id: id.into(),
        payload: json!(null),
    }
}

async fn applied(client: &Client<StreamApp, MemoryStore>) -> u64 {
    match client.query(StreamQuery::AppliedIndex).await.unwrap() {
        StreamAnswer::AppliedIndex(i) => i,
        other => panic!("unexpected answer {:?}", other),
    }
}

struct Cast {
    cluster: Arc<Cluster<StreamApp, MemoryStore>>,
    nodes: Vec<(Node, Client<StreamApp, MemoryStore>, Arc<MemoryStore>)>,
}

async fn cast() -> Cast {
    let cluster = LocalCluster::new(1);
    let mut nodes = Vec::new();
    for replica_id in 1..=3 {
        let store = Arc::new(MemoryStore::new());
        let mut node = runtime(replica_id, replica_id == 1, store.clone());
        let client = node.start(&cluster).await.unwrap();
        nodes.push((node, client, store));
    }
    Cast { cluster, nodes }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<LeaderInfo>>);

impl LeaderListener for Recorder {
    fn leader_updated(&self, info: LeaderInfo) {
        self.0.lock().push(info);
    }
}

#[tokio::test]
async fn test_replicas_converge() {
    let cast = cast().await;
    for (i, (_, client, _)) in cast.nodes.iter().enumerate() {
        client.publish(POST, &post(&i.to_string())).await.unwrap();
    }
    for (_, client, store) in &cast.nodes {
        assert_eq!(applied(client).await, 3);
        assert_eq!(store.row_count("events"), Some(3));
    }
    assert_eq!(cast.cluster.last_index().await, 3);
}

#[tokio::test]
async fn test_restarted_replica_replays_missed_entries() {
    let mut cast = cast().await;
    cast.nodes[0].1.publish(POST, &post("a")).await.unwrap();

    let (mut node3, _, store3) = cast.nodes.pop().unwrap();
    node3.stop().await.unwrap();
    assert_eq!(cast.cluster.replica_ids(), vec![1, 2]);

    cast.nodes[0].1.publish(POST, &post("b")).await.unwrap();
    cast.nodes[1].1.publish(POST, &post("c")).await.unwrap();
    assert_eq!(store3.row_count("events"), Some(1));

    let mut node3 = runtime(3, false, store3.clone());
    let client3 = node3.start(&cast.cluster).await.unwrap();
    assert_eq!(node3.machine().applied_index(), 3);
    assert_eq!(applied(&client3).await, 3);
    assert_eq!(store3.row_count("events"), Some(3));
}

#[tokio::test]
async fn test_leader_moves_when_leader_stops() {
    let mut cast = cast().await;
    let recorder = Arc::new(Recorder::default());
    cast.cluster.add_listener(recorder.clone());
    assert_eq!(cast.cluster.leader().leader_id, Some(1));

    let term = cast.cluster.leader().term;
    cast.nodes[0].0.stop().await.unwrap();

    let leader = cast.cluster.leader();
    assert_eq!(leader.leader_id, Some(2));
    assert!(leader.term > term);
    assert_eq!(recorder.0.lock().last().and_then(|i| i.leader_id), Some(2));

    cast.nodes[1].1.publish(POST, &post("x")).await.unwrap();
}

#[tokio::test]
async fn test_fatal_replica_is_removed() {
    let cast = cast().await;
    cast.nodes[2].2.fail_next_commits(1);

    cast.nodes[0].1.publish(POST, &post("a")).await.unwrap();
    assert_eq!(cast.cluster.replica_ids(), vec![1, 2]);
    assert_eq!(cast.nodes[2].2.row_count("events"), Some(0));

    cast.nodes[1].1.publish(POST, &post("b")).await.unwrap();
    assert_eq!(applied(&cast.nodes[1].1).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_proposal_is_retried() {
    let cast = cast().await;
    cast.cluster.drop_next_proposals(1);

    cast.nodes[0].1.publish(POST, &post("a")).await.unwrap();
    assert_eq!(cast.cluster.last_index().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_leader_is_not_ready() {
    let cluster = LocalCluster::new(1);
    let mut node = runtime(1, false, Arc::new(MemoryStore::new()));
    let client = node.start(&cluster).await.unwrap();

    let err = client.publish(POST, &post("a")).await.unwrap_err();
    assert!(matches!(err, ClientError::NotReady { attempts: 3, .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_runtime_lifecycle_errors() {
    let cluster = LocalCluster::new(1);
    let mut node = runtime(1, true, Arc::new(MemoryStore::new()));
    assert!(matches!(node.client(), Err(RuntimeError::NotStarted)));
    assert!(matches!(node.stop().await, Err(RuntimeError::NotStarted)));

    node.start(&cluster).await.unwrap();
    assert!(matches!(node.start(&cluster).await, Err(RuntimeError::AlreadyStarted)));

    let other: Arc<Cluster<StreamApp, MemoryStore>> = LocalCluster::new(9);
    let mut stray = runtime(2, false, Arc::new(MemoryStore::new()));
    assert!(matches!(
        stray.start(&other).await,
        Err(RuntimeError::ShardMismatch { expected: 1, actual: 9 })
    ));

    node.stop().await.unwrap();
    assert!(!node.is_started());
}

async fn events_on(client: &Client<StreamApp, MemoryStore>) -> Vec<u64> {
    let query = StreamQuery::EventsSince {
        topic: "events".into(),
        since: 0,
        limit: None,
    };
    match client.query(query).await.unwrap() {
        StreamAnswer::Events(events) => events.iter().map(|e| e.event_id).collect(),
        other => panic!("unexpected answer {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_proposer_timeout_does_not_skip_entries_on_later_replicas() {
    let cluster = LocalCluster::new(1);
    let mut nodes = Vec::new();
    let mut coordinators = Vec::new();
    for replica_id in 1..=3 {
        let mut cfg = NodeConfig {
            bootstrap: replica_id == 1,
            subscription: SubscriptionConfig {
                queue_capacity: 1,
                ..SubscriptionConfig::default()
            },
            ..NodeConfig::for_replica(1, replica_id)
        };
        if replica_id == 1 {
            cfg.retry = RetryPolicy {
                attempts: 1,
                attempt_timeout: Duration::from_millis(300),
                ..RetryPolicy::default()
            };
        }
        let topics: Arc<TopicRegistry<Event>> = Arc::new(TopicRegistry::new(cfg.subscription));
        topics.create("events").unwrap();
        let coordinator = Arc::new(SubscriptionCoordinator::new(replica_id, topics));
        let app = Arc::new(StreamApp::new(cfg.namespace.clone(), coordinator.clone()));
        let mut node = Runtime::new(cfg, app, Arc::new(MemoryStore::new()));
        let client = node.start(&cluster).await.unwrap();
        nodes.push((node, client));
        coordinators.push(coordinator);
    }

    // Replica 2 hosts a started subscriber that never drains.
    let cancel = CancellationToken::new();
    let sub = coordinators[1].subscribe("events", &cancel, None).unwrap();
    let _rx = sub.listen().unwrap();
    coordinators[1].request_start(&nodes[1].1, sub.id(), "events").await.unwrap();

    let mut timed_out = None;
    for i in 0..10 {
        match nodes[0].1.publish(POST, &post(&i.to_string())).await {
            Ok(_) => continue,
            Err(e) => {
                assert!(e.is_not_ready(), "got {:?}", e);
                timed_out = Some(i);
                break;
            }
        }
    }
    let timed_out = timed_out.expect("the stalled subscriber should hold up delivery");

    cancel.cancel();
    nodes[0].1.publish(POST, &post("after")).await.unwrap();

    let expected: Vec<u64> = (2..=timed_out as u64 + 3).collect();
    for (replica, (_, client)) in nodes.iter().enumerate() {
        assert_eq!(events_on(client).await, expected, "replica {}", replica + 1);
        assert_eq!(applied(client).await, timed_out as u64 + 3);
    }
    assert_eq!(cluster.replica_ids(), vec![1, 2, 3]);
}
