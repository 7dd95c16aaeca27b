// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Standalone single-replica node hosting the event stream application.
use concord_node::app::StreamApp;
use concord_node::config::NodeConfig;
use concord_node::consensus::LocalCluster;
use concord_node::notify::{SubscriptionCoordinator, TopicRegistry};
use concord_node::runtime::{Cluster, Runtime};
use concord_node::store::MemoryStore;
use concord_node::telemetry;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    telemetry::init_telemetry();

    let cfg = match NodeConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    tracing::info!("Initializing concord node with config: {:?}", cfg);

    let topics = Arc::new(TopicRegistry::new(cfg.subscription));
    let coordinator = Arc::new(SubscriptionCoordinator::new(cfg.replica_id, topics));
    let app = Arc::new(StreamApp::new(cfg.namespace.clone(), coordinator));
    let store = Arc::new(MemoryStore::new());

    let cluster: Arc<Cluster<StreamApp, MemoryStore>> = LocalCluster::new(cfg.shard_id);
    let mut runtime = Runtime::new(cfg, app, store);
    if let Err(e) = runtime.start(&cluster).await {
        tracing::error!("Failed to start replica: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
    if let Err(e) = runtime.stop().await {
        tracing::error!("Failed to stop replica: {}", e);
    }
    tracing::info!("Final metrics:\n{}", telemetry::render_metrics());
}
