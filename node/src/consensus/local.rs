// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-process loopback engine.
//!
//! One ordered log per shard, delivered to every started replica's state
//! machine one entry at a time, in index order, under a single lock.
//! Delivery of an appended entry runs to completion on a detached task, so
//! a proposer that times out never leaves replicas with a hole in the log. There is
//! no election and no quorum: whoever proposes is appended. The proposing
//! replica's result is returned, the way an engine returns the local apply
//! result of a synchronous proposal.
//!
//! A replica whose state machine reports a fatal error is stopped and removed,
//! the rest of the shard keeps going.

use super::{ConsensusEngine, ConsensusError, LeaderInfo, LeaderListener, LogEntry, OnDiskStateMachine};
use async_trait::async_trait;
use concord_kernel::EntryResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

struct Log {
    first_index: u64,
    entries: Vec<Vec<u8>>,
}

impl Log {
    fn append(&mut self, cmd: Vec<u8>) -> u64 {
        let index = self.first_index + self.entries.len() as u64;
        self.entries.push(cmd);
        index
    }

    fn last_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64 - 1
    }

    /// Retained entries strictly above `applied`.
    fn since(&self, applied: u64) -> Vec<LogEntry> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, cmd)| (self.first_index + i as u64, cmd))
            .filter(|(index, _)| *index > applied)
            .map(|(index, cmd)| LogEntry::new(index, cmd.clone()))
            .collect()
    }
}

pub struct LocalCluster<M: OnDiskStateMachine> {
    shard_id: u64,
    log: Mutex<Log>,
    replicas: RwLock<BTreeMap<u64, Arc<M>>>,
    leader: RwLock<LeaderInfo>,
    listeners: RwLock<Vec<Arc<dyn LeaderListener>>>,
    drop_next: AtomicUsize,
}

impl<M: OnDiskStateMachine> LocalCluster<M> {
    pub fn new(shard_id: u64) -> Arc<Self> {
        Self::starting_at(shard_id, 1)
    }

    /// A log whose first retained entry will get `first_index`, as if
    /// everything before it had been compacted away.
    pub fn starting_at(shard_id: u64, first_index: u64) -> Arc<Self> {
        Arc::new(Self {
            shard_id,
            log: Mutex::new(Log {
                first_index: first_index.max(1),
                entries: Vec::new(),
            }),
            replicas: RwLock::new(BTreeMap::new()),
            leader: RwLock::new(LeaderInfo {
                shard_id,
                leader_id: None,
                term: 0,
            }),
            listeners: RwLock::new(Vec::new()),
            drop_next: AtomicUsize::new(0),
        })
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    /// Client-side handle bound to one replica.
    pub fn node(self: &Arc<Self>, replica_id: u64) -> LocalNode<M> {
        LocalNode {
            cluster: self.clone(),
            replica_id,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn LeaderListener>) {
        self.listeners.write().push(listener);
    }

    pub fn leader(&self) -> LeaderInfo {
        *self.leader.read()
    }

    pub fn set_leader(&self, leader_id: Option<u64>) {
        let info = {
            let mut leader = self.leader.write();
            leader.leader_id = leader_id;
            leader.term += 1;
            *leader
        };
        tracing::info!("Shard {} leader is now {:?} (term {})", self.shard_id, leader_id, info.term);
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            listener.leader_updated(info);
        }
    }

    /// Fault injection: the next `n` proposals are dropped before append.
    pub fn drop_next_proposals(&self, n: usize) {
        self.drop_next.store(n, Ordering::SeqCst);
    }

    pub fn replica_ids(&self) -> Vec<u64> {
        self.replicas.read().keys().copied().collect()
    }

    pub fn replica(&self, replica_id: u64) -> Option<Arc<M>> {
        self.replicas.read().get(&replica_id).cloned()
    }

    /// Index of the last appended entry; `first_index - 1` when empty.
    pub async fn last_index(&self) -> u64 {
        self.log.lock().await.last_index()
    }

    /// Open the replica's state machine, replay every retained entry above
    /// its recovered applied index, then join it to the delivery set.
    pub async fn start_on_disk_replica(
        &self,
        replica_id: u64,
        machine: Arc<M>,
        bootstrap: bool,
    ) -> Result<u64, ConsensusError> {
        if self.replicas.read().contains_key(&replica_id) {
            return Err(ConsensusError::ReplicaExists(replica_id));
        }

        let applied = machine.open().await?;

        // Hold the log so no proposal slips between catch-up and joining.
        let log = self.log.lock().await;
        if applied > 0 && applied + 1 < log.first_index {
            tracing::warn!(
                "Replica {} applied index {} is behind the retained log (first {}); recover it from a snapshot",
                replica_id,
                applied,
                log.first_index
            );
        }
        let mut backlog = log.since(applied);
        if !backlog.is_empty() {
            tracing::info!("Replica {} replaying {} entries above {}", replica_id, backlog.len(), applied);
            machine.update(&mut backlog).await?;
        }
        self.replicas.write().insert(replica_id, machine);
        drop(log);

        tracing::info!("Shard {} replica {} started (applied index {})", self.shard_id, replica_id, applied);
        if bootstrap && self.leader().leader_id.is_none() {
            self.set_leader(Some(replica_id));
        }
        Ok(applied)
    }

    pub async fn stop_replica(&self, replica_id: u64) -> Result<(), ConsensusError> {
        // Wait out an in-flight delivery.
        let _log = self.log.lock().await;
        let machine = self
            .replicas
            .write()
            .remove(&replica_id)
            .ok_or(ConsensusError::ReplicaNotFound(replica_id))?;
        machine.close().await?;
        tracing::info!("Shard {} replica {} stopped", self.shard_id, replica_id);
        self.reelect_if_leader(replica_id);
        Ok(())
    }

    fn reelect_if_leader(&self, gone: u64) {
        if self.leader().leader_id == Some(gone) {
            let next = self.replicas.read().keys().next().copied();
            self.set_leader(next);
        }
    }

    async fn propose(self: &Arc<Self>, origin: u64, payload: Vec<u8>) -> Result<EntryResult, ConsensusError> {
        let dropped = self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(ConsensusError::Dropped);
        }
        if self.leader().leader_id.is_none() {
            return Err(ConsensusError::ShardNotReady(self.shard_id));
        }

        // Once appended, an entry reaches every replica even if the proposer
        // stops waiting, so delivery runs on its own task.
        let (done, outcome) = oneshot::channel();
        let cluster = self.clone();
        tokio::spawn(async move {
            let result = cluster.append_and_deliver(origin, payload).await;
            if done.send(result).is_err() {
                tracing::debug!("Proposer from replica {} went away before its entry was applied", origin);
            }
        });
        outcome.await.map_err(|_| ConsensusError::Dropped)?
    }

    async fn append_and_deliver(&self, origin: u64, payload: Vec<u8>) -> Result<EntryResult, ConsensusError> {
        let mut log = self.log.lock().await;
        if !self.replicas.read().contains_key(&origin) {
            return Err(ConsensusError::ReplicaNotFound(origin));
        }
        let index = log.append(payload.clone());
        let targets: Vec<(u64, Arc<M>)> = self.replicas.read().iter().map(|(id, m)| (*id, m.clone())).collect();

        let mut outcome = Err(ConsensusError::ReplicaNotFound(origin));
        for (replica_id, machine) in targets {
            let mut batch = [LogEntry::new(index, payload.clone())];
            match machine.update(&mut batch).await {
                Ok(()) => {
                    if replica_id == origin {
                        outcome = Ok(std::mem::take(&mut batch[0].result));
                    }
                }
                Err(e) => {
                    tracing::error!("Replica {} failed entry {}: {}. Stopping replica.", replica_id, index, e);
                    self.replicas.write().remove(&replica_id);
                    if let Err(close_err) = machine.close().await {
                        tracing::warn!("Replica {} close failed: {}", replica_id, close_err);
                    }
                    self.reelect_if_leader(replica_id);
                    if replica_id == origin {
                        outcome = Err(ConsensusError::StateMachine(e));
                    }
                }
            }
        }
        drop(log);
        outcome
    }

    async fn read(&self, replica_id: u64, query: M::Query) -> Result<M::Answer, ConsensusError> {
        if self.leader().leader_id.is_none() {
            return Err(ConsensusError::ShardNotReady(self.shard_id));
        }
        let machine = self.replica(replica_id).ok_or(ConsensusError::ReplicaNotFound(replica_id))?;
        Ok(machine.lookup(query).await?)
    }
}

pub struct LocalNode<M: OnDiskStateMachine> {
    cluster: Arc<LocalCluster<M>>,
    replica_id: u64,
}

impl<M: OnDiskStateMachine> Clone for LocalNode<M> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            replica_id: self.replica_id,
        }
    }
}

impl<M: OnDiskStateMachine> LocalNode<M> {
    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    pub fn cluster(&self) -> &Arc<LocalCluster<M>> {
        &self.cluster
    }
}

#[async_trait]
impl<M: OnDiskStateMachine> ConsensusEngine for LocalNode<M> {
    type Query = M::Query;
    type Answer = M::Answer;

    async fn sync_propose(&self, shard_id: u64, payload: Vec<u8>) -> Result<EntryResult, ConsensusError> {
        if shard_id != self.cluster.shard_id {
            return Err(ConsensusError::ShardNotReady(shard_id));
        }
        self.cluster.propose(self.replica_id, payload).await
    }

    async fn sync_read(&self, shard_id: u64, query: Self::Query) -> Result<Self::Answer, ConsensusError> {
        if shard_id != self.cluster.shard_id {
            return Err(ConsensusError::ShardNotReady(shard_id));
        }
        self.cluster.read(self.replica_id, query).await
    }
}
