// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use anyhow::{ensure, Context};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use concord_node::app::stream::POST;
use concord_node::app::{Event, PostEvent, StreamAnswer, StreamApp, StreamQuery};
use concord_node::config::NodeConfig;
use concord_node::consensus::OnDiskStateMachine;
use concord_node::notify::{Subscription, SubscriptionCoordinator, TopicRegistry};
use concord_node::runtime::{Client, Cluster, Runtime};
use concord_node::{LocalCluster, MemoryStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "demo";
const SHARD_ID: u64 = 1;

pub struct DemoOptions {
    pub replicas: u64,
    pub events: u64,
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug)]
pub struct DemoReport {
    /// Commit index of the `start_subscription` entry.
    pub start_index: u64,
    /// Events committed before the start, read back through a query.
    pub history: Vec<Event>,
    /// Events the started subscription delivered.
    pub delivered: Vec<Event>,
    /// `(replica_id, applied_index)` per replica at the end.
    pub applied: Vec<(u64, u64)>,
}

struct DemoNode {
    runtime: Runtime<StreamApp, MemoryStore>,
    client: Client<StreamApp, MemoryStore>,
    coordinator: Arc<SubscriptionCoordinator<Event>>,
}

async fn start_node(cluster: &Arc<Cluster<StreamApp, MemoryStore>>, replica_id: u64) -> anyhow::Result<DemoNode> {
    let cfg = NodeConfig {
        bootstrap: replica_id == 1,
        ..NodeConfig::for_replica(SHARD_ID, replica_id)
    };
    let topics = Arc::new(TopicRegistry::new(cfg.subscription));
    topics.create(TOPIC)?;
    let coordinator = Arc::new(SubscriptionCoordinator::new(replica_id, topics));
    let app = Arc::new(StreamApp::new(cfg.namespace.clone(), coordinator.clone()));
    let mut runtime = Runtime::new(cfg, app, Arc::new(MemoryStore::new()));
    let client = runtime.start(cluster).await?;
    Ok(DemoNode {
        runtime,
        client,
        coordinator,
    })
}

fn post(n: u64, from: u64) -> PostEvent {
    PostEvent {
        topic: TOPIC.to_string(),
        key: format!("demo-{}", n),
        id: n.to_string(),
        payload: json!({ "n": n, "from": from }),
    }
}

pub async fn run(opts: &DemoOptions) -> anyhow::Result<DemoReport> {
    ensure!(opts.replicas >= 1, "a shard needs at least one replica");

    let cluster: Arc<Cluster<StreamApp, MemoryStore>> = LocalCluster::new(SHARD_ID);
    let mut nodes = Vec::new();
    for replica_id in 1..=opts.replicas {
        nodes.push(start_node(&cluster, replica_id).await?);
    }
    println!("\nShard {} running with {} replicas", SHARD_ID, nodes.len());

    // Committed before anyone subscribes: only reachable as history.
    nodes[0].client.publish(POST, &post(0, 1)).await?;

    let origin = nodes.last().context("no replicas")?;
    let cancel = CancellationToken::new();
    let subscription = origin.coordinator.subscribe(TOPIC, &cancel, None)?;
    let mut live = subscription.listen()?;
    let start_index = origin
        .coordinator
        .request_start(&origin.client, subscription.id(), TOPIC)
        .await?;
    println!(
        "Subscription {} on replica {} starts at index {}",
        subscription.id(),
        origin.client.replica_id(),
        start_index
    );

    for n in 1..=opts.events {
        let node = &nodes[((n - 1) % nodes.len() as u64) as usize];
        node.client.publish(POST, &post(n, node.client.replica_id())).await?;
    }

    let mut delivered = Vec::new();
    while (delivered.len() as u64) < opts.events {
        match tokio::time::timeout(Duration::from_secs(1), live.recv()).await {
            Ok(Some(event)) if event.event_id >= start_index => delivered.push(event),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    let history = match origin
        .client
        .query(StreamQuery::EventsBefore {
            topic: TOPIC.to_string(),
            before: start_index,
            limit: None,
        })
        .await?
    {
        StreamAnswer::Events(events) => events,
        other => anyhow::bail!("unexpected answer {:?}", other),
    };

    let mut applied = Vec::new();
    for node in &nodes {
        match node.client.query(StreamQuery::AppliedIndex).await? {
            StreamAnswer::AppliedIndex(index) => applied.push((node.client.replica_id(), index)),
            other => anyhow::bail!("unexpected answer {:?}", other),
        }
    }

    if let Some(path) = &opts.snapshot {
        let machine = nodes[0].runtime.machine();
        let state = machine.prepare_snapshot().await?;
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        machine.save_snapshot(state, &mut file).await?;
        println!("Snapshot of replica 1 written to {}", path.display());
    }

    cancel.cancel();
    for node in &mut nodes {
        node.runtime.stop().await?;
    }

    let report = DemoReport {
        start_index,
        history,
        delivered,
        applied,
    };
    print_report(&report);
    Ok(report)
}

fn print_report(report: &DemoReport) {
    let mut events = Table::new();
    events
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Event", "Key", "Source", "Payload"]);
    for event in &report.history {
        events.add_row(vec![
            event.event_id.to_string(),
            event.key.clone(),
            "history".to_string(),
            event.payload.to_string(),
        ]);
    }
    for event in &report.delivered {
        events.add_row(vec![
            event.event_id.to_string(),
            event.key.clone(),
            "live".to_string(),
            event.payload.to_string(),
        ]);
    }
    println!("{}", events);

    let mut replicas = Table::new();
    replicas
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Replica", "Applied Index"]);
    for (replica_id, index) in &report.applied {
        replicas.add_row(vec![replica_id.to_string(), index.to_string()]);
    }
    println!("{}", replicas);
}
