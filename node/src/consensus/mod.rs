// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Contracts with the consensus engine.
//!
//! Leader election, replication and quorum live in the engine. This crate
//! only needs to propose bytes, read through a shard, and be driven as an
//! on-disk state machine. [`local::LocalCluster`] is an in-process stand-in
//! used by tests and the CLI demo.

pub mod local;

pub use local::{LocalCluster, LocalNode};

use crate::errors::StateMachineError;
use async_trait::async_trait;
use concord_kernel::EntryResult;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Identity of one replica instance, passed explicitly to every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftContext {
    pub shard_id: u64,
    pub replica_id: u64,
    pub bootstrap: bool,
}

impl RaftContext {
    pub fn new(shard_id: u64, replica_id: u64, bootstrap: bool) -> Self {
        Self {
            shard_id,
            replica_id,
            bootstrap,
        }
    }
}

/// One raw committed record as the engine hands it over. `result` is filled
/// in by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub index: u64,
    pub cmd: Vec<u8>,
    pub result: EntryResult,
}

impl LogEntry {
    pub fn new(index: u64, cmd: Vec<u8>) -> Self {
        Self {
            index,
            cmd,
            result: EntryResult::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderInfo {
    pub shard_id: u64,
    pub leader_id: Option<u64>,
    pub term: u64,
}

/// Leadership-change notification callback.
pub trait LeaderListener: Send + Sync {
    fn leader_updated(&self, info: LeaderInfo);
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("request timed out")]
    Timeout,
    #[error("shard {0} not ready")]
    ShardNotReady(u64),
    #[error("proposal dropped")]
    Dropped,
    #[error("replica {0} is not running")]
    ReplicaNotFound(u64),
    #[error("replica {0} already running")]
    ReplicaExists(u64),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

impl ConsensusError {
    /// Answers such as "does not exist" that a retry cannot change.
    pub fn is_permanent(&self) -> bool {
        match self {
            ConsensusError::StateMachine(StateMachineError::Lookup(e)) => e.is_permanent(),
            _ => false,
        }
    }
}

/// Handle used by clients to reach one shard.
#[async_trait]
pub trait ConsensusEngine: Send + Sync + 'static {
    type Query: Send + 'static;
    type Answer: Send + 'static;

    async fn sync_propose(&self, shard_id: u64, payload: Vec<u8>) -> Result<EntryResult, ConsensusError>;
    async fn sync_read(&self, shard_id: u64, query: Self::Query) -> Result<Self::Answer, ConsensusError>;
}

/// Snapshot state captured by `prepare_snapshot`.
#[derive(Debug, Clone)]
pub struct SnapshotState {
    pub applied_index: u64,
    pub tables: Vec<crate::store::TableDump>,
}

/// The engine's on-disk state-machine lifecycle.
///
/// `update` is never called concurrently with itself for one shard.
/// `lookup` may run concurrently with `update` and with other lookups.
#[async_trait]
pub trait OnDiskStateMachine: Send + Sync + 'static {
    type Query: Send + 'static;
    type Answer: Send + 'static;

    /// Returns the applied index to resume from.
    async fn open(&self) -> Result<u64, StateMachineError>;
    async fn update(&self, entries: &mut [LogEntry]) -> Result<(), StateMachineError>;
    async fn lookup(&self, query: Self::Query) -> Result<Self::Answer, StateMachineError>;
    async fn sync(&self) -> Result<(), StateMachineError>;
    async fn prepare_snapshot(&self) -> Result<SnapshotState, StateMachineError>;
    async fn save_snapshot(
        &self,
        state: SnapshotState,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), StateMachineError>;
    async fn recover_from_snapshot(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<(), StateMachineError>;
    async fn close(&self) -> Result<(), StateMachineError>;
}
