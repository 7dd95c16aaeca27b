// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-replica runtime: `new → start → stop`.
//!
//! Owns everything one replica needs (identity, state machine, engine
//! handle). Nothing here is process-global; run several runtimes in one
//! process to host several replicas.

use crate::application::Application;
use crate::client::ReplicatedClient;
use crate::config::NodeConfig;
use crate::consensus::{ConsensusError, LeaderInfo, LeaderListener, LocalCluster, LocalNode, RaftContext};
use crate::state_machine::StateMachine;
use crate::store::DurableStore;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime not started")]
    NotStarted,
    #[error("runtime already started")]
    AlreadyStarted,
    #[error("runtime is configured for shard {expected}, cluster hosts shard {actual}")]
    ShardMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

pub type Machine<A, S> = StateMachine<A, S>;
pub type Cluster<A, S> = LocalCluster<Machine<A, S>>;
pub type Client<A, S> = ReplicatedClient<LocalNode<Machine<A, S>>>;

struct LeaderLog {
    replica_id: u64,
}

impl LeaderListener for LeaderLog {
    fn leader_updated(&self, info: LeaderInfo) {
        match info.leader_id {
            Some(leader) if leader == self.replica_id => {
                tracing::info!("Replica {} is leader of shard {} (term {})", leader, info.shard_id, info.term)
            }
            Some(leader) => tracing::info!("Shard {} leader is replica {} (term {})", info.shard_id, leader, info.term),
            None => tracing::warn!("Shard {} has no leader (term {})", info.shard_id, info.term),
        }
        metrics::gauge!("concord_leader_replica", info.leader_id.unwrap_or(0) as f64);
    }
}

pub struct Runtime<A: Application, S: DurableStore> {
    config: NodeConfig,
    machine: Arc<Machine<A, S>>,
    cluster: Option<Arc<Cluster<A, S>>>,
}

impl<A: Application, S: DurableStore> Runtime<A, S> {
    pub fn new(config: NodeConfig, app: Arc<A>, store: Arc<S>) -> Self {
        let raft = RaftContext::new(config.shard_id, config.replica_id, config.bootstrap);
        let machine = Arc::new(StateMachine::new(raft, app, store, config.namespace.clone()));
        Self {
            config,
            machine,
            cluster: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<Machine<A, S>> {
        &self.machine
    }

    pub fn is_started(&self) -> bool {
        self.cluster.is_some()
    }

    /// Join `cluster` as an on-disk replica and return a client bound to it.
    pub async fn start(&mut self, cluster: &Arc<Cluster<A, S>>) -> Result<Client<A, S>, RuntimeError> {
        if self.cluster.is_some() {
            return Err(RuntimeError::AlreadyStarted);
        }
        if cluster.shard_id() != self.config.shard_id {
            return Err(RuntimeError::ShardMismatch {
                expected: self.config.shard_id,
                actual: cluster.shard_id(),
            });
        }

        cluster.add_listener(Arc::new(LeaderLog {
            replica_id: self.config.replica_id,
        }));
        let applied = cluster
            .start_on_disk_replica(self.config.replica_id, self.machine.clone(), self.config.bootstrap)
            .await?;
        tracing::info!(
            "Runtime started: shard {} replica {} from applied index {}",
            self.config.shard_id,
            self.config.replica_id,
            applied
        );
        self.cluster = Some(cluster.clone());
        self.client()
    }

    pub fn client(&self) -> Result<Client<A, S>, RuntimeError> {
        let cluster = self.cluster.as_ref().ok_or(RuntimeError::NotStarted)?;
        Ok(ReplicatedClient::new(
            Arc::new(cluster.node(self.config.replica_id)),
            self.config.shard_id,
            self.config.replica_id,
            self.config.retry,
        ))
    }

    pub async fn stop(&mut self) -> Result<(), RuntimeError> {
        let cluster = self.cluster.take().ok_or(RuntimeError::NotStarted)?;
        cluster.stop_replica(self.config.replica_id).await?;
        tracing::info!("Runtime stopped: shard {} replica {}", self.config.shard_id, self.config.replica_id);
        Ok(())
    }
}
