// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! On-disk state machine adapter - the commit barrier
//!
//! Turns committed log batches into sequential calls on an [`Application`]
//! and keeps the applied-index invariant:
//! 1. Replay check: every entry index > applied index recovered at open,
//!    and indexes follow the applied index without gaps
//! 2. Business writes staged per entry, flushed by `Application::apply`
//! 3. Applied index written into the SAME transaction
//! 4. Commit
//! 5. Deferred effects run, results populated
//!
//! Nothing from a batch is visible, and no subscriber hears about it, unless
//! step 4 succeeded. A failed commit is fatal for the replica.
//!
//! Lifecycle: `unopened → open → closing → closed`. `update` and `lookup`
//! are only legal while open.

use crate::application::{Applied, Application, UpdateBatch};
use crate::consensus::{LogEntry, OnDiskStateMachine, RaftContext, SnapshotState};
use crate::errors::{Phase, StateMachineError};
use crate::metadata::MetadataStore;
use crate::snapshot::{self, SnapshotError, SnapshotMeta};
use crate::store::DurableStore;
use async_trait::async_trait;
use concord_kernel::{CommandEnvelope, Entry, EntryResult, Metadata};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub struct StateMachine<A: Application, S: DurableStore> {
    raft: RaftContext,
    app: Arc<A>,
    /// Dropped on close; in-flight calls keep their own clone.
    store: RwLock<Option<Arc<S>>>,
    metadata: MetadataStore,
    phase: AtomicU8,
    /// Applied index recovered at open (or adopted from a snapshot).
    initial_applied: AtomicU64,
    applied: AtomicU64,
}

impl<A: Application, S: DurableStore> StateMachine<A, S> {
    pub fn new(raft: RaftContext, app: Arc<A>, store: Arc<S>, namespace: impl Into<String>) -> Self {
        Self {
            raft,
            app,
            store: RwLock::new(Some(store)),
            metadata: MetadataStore::new(namespace),
            phase: AtomicU8::new(Phase::Unopened as u8),
            initial_applied: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    pub fn raft(&self) -> &RaftContext {
        &self.raft
    }

    pub fn app(&self) -> &Arc<A> {
        &self.app
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn require_open(&self, op: &'static str) -> Result<Arc<S>, StateMachineError> {
        let phase = self.phase();
        if phase != Phase::Open {
            return Err(StateMachineError::InvalidPhase { op, phase });
        }
        self.store
            .read()
            .clone()
            .ok_or(StateMachineError::InvalidPhase { op, phase: Phase::Closed })
    }

    async fn run_batch(&self, store: &S, entries: &mut [LogEntry], last_index: u64) -> Result<(), StateMachineError> {
        let tx = store.begin().await.map_err(StateMachineError::Transaction)?;
        let mut batch = UpdateBatch::new(&self.raft, store, tx);

        if let Err(e) = self.app.prepare_update(&mut batch).await {
            batch.into_tx().abort().await;
            return Err(StateMachineError::Batch(e));
        }

        let mut deferred: Vec<Option<Applied<A::Effect>>> = Vec::with_capacity(entries.len());
        for entry in entries.iter_mut() {
            let envelope = match CommandEnvelope::from_bytes(&entry.cmd) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Entry {}: {}", entry.index, e);
                    entry.result = EntryResult::malformed(&e);
                    deferred.push(None);
                    continue;
                }
            };

            let view = Entry::from_envelope(entry.index, envelope);
            match self.app.on_update(&mut batch, &view).await {
                Ok(applied) => deferred.push(Some(applied)),
                Err(e) if e.is_infrastructure() => {
                    tracing::error!("Entry {}: store failure during on_update: {}", entry.index, e);
                    batch.into_tx().abort().await;
                    return Err(StateMachineError::Batch(e));
                }
                Err(e) => {
                    tracing::debug!("Entry {} ({}) rejected: {}", entry.index, view.command, e);
                    entry.result = EntryResult::rejected(e.code(), e.to_string());
                    deferred.push(None);
                }
            }
        }

        if let Err(e) = self.app.apply(&mut batch).await {
            batch.into_tx().abort().await;
            return Err(StateMachineError::Batch(e));
        }

        let mut tx = batch.into_tx();
        if let Err(e) = self.metadata.stage(tx.as_mut(), &Metadata::at(last_index)) {
            tx.abort().await;
            return Err(StateMachineError::Metadata(e));
        }

        // COMMIT BOUNDARY
        if let Err(e) = tx.commit().await {
            tracing::error!(
                "CRITICAL: shard {} replica {} failed to commit batch ending at {}: {}",
                self.raft.shard_id,
                self.raft.replica_id,
                last_index,
                e
            );
            return Err(StateMachineError::Transaction(e));
        }
        self.applied.store(last_index, Ordering::SeqCst);

        for (entry, applied) in entries.iter_mut().zip(deferred) {
            let Some(applied) = applied else { continue };
            let mut result = applied.result;
            for effect in applied.effects {
                if let Some(replaced) = self.app.after_commit(&self.raft, entry.index, effect).await {
                    result = replaced;
                }
            }
            entry.result = result;
        }
        Ok(())
    }
}

#[async_trait]
impl<A: Application, S: DurableStore> OnDiskStateMachine for StateMachine<A, S> {
    type Query = A::Query;
    type Answer = A::Answer;

    async fn open(&self) -> Result<u64, StateMachineError> {
        let phase = self.phase();
        if phase != Phase::Unopened {
            return Err(StateMachineError::InvalidPhase { op: "open", phase });
        }
        let store = self
            .store
            .read()
            .clone()
            .ok_or(StateMachineError::InvalidPhase { op: "open", phase: Phase::Closed })?;

        self.metadata
            .ensure_schema(&*store)
            .await
            .map_err(StateMachineError::Schema)?;
        let meta = self
            .metadata
            .load(&*store)
            .await
            .map_err(StateMachineError::Schema)?;
        self.app
            .init(&self.raft, &*store)
            .await
            .map_err(StateMachineError::Init)?;

        self.initial_applied.store(meta.applied_index, Ordering::SeqCst);
        self.applied.store(meta.applied_index, Ordering::SeqCst);
        self.set_phase(Phase::Open);
        metrics::gauge!("concord_applied_index", meta.applied_index as f64);

        tracing::info!(
            "State machine open: shard {} replica {} namespace '{}' applied index {}",
            self.raft.shard_id,
            self.raft.replica_id,
            self.metadata.namespace(),
            meta.applied_index
        );
        Ok(meta.applied_index)
    }

    async fn update(&self, entries: &mut [LogEntry]) -> Result<(), StateMachineError> {
        let store = self.require_open("update")?;
        let Some(last_index) = entries.last().map(|e| e.index) else {
            return Ok(());
        };

        let initial = self.initial_applied.load(Ordering::SeqCst);
        if let Some(stale) = entries.iter().find(|e| e.index <= initial) {
            tracing::error!(
                "FATAL: shard {} replica {} was handed entry {} but recovered applied index {}",
                self.raft.shard_id,
                self.raft.replica_id,
                stale.index,
                initial
            );
            return Err(StateMachineError::Replay {
                index: stale.index,
                applied: initial,
            });
        }

        // A store that has applied nothing may join a log whose prefix was
        // compacted away; after that every entry is exactly applied + 1.
        let applied = self.applied_index();
        let mut expected = if applied == 0 { entries[0].index } else { applied + 1 };
        for entry in entries.iter() {
            if entry.index != expected {
                tracing::error!(
                    "FATAL: shard {} replica {} was handed entry {} but expected {}",
                    self.raft.shard_id,
                    self.raft.replica_id,
                    entry.index,
                    expected
                );
                return Err(StateMachineError::Gap {
                    index: entry.index,
                    expected,
                });
            }
            expected += 1;
        }

        let started = Instant::now();
        self.run_batch(&store, entries, last_index).await?;

        let rejected = entries.iter().filter(|e| !e.result.is_success()).count();
        metrics::counter!("concord_entries_applied_total", entries.len() as u64);
        metrics::counter!("concord_entries_rejected_total", rejected as u64);
        metrics::histogram!("concord_update_batch_seconds", started.elapsed().as_secs_f64());
        metrics::gauge!("concord_applied_index", last_index as f64);
        tracing::debug!("Batch committed: {} entries, applied index {}", entries.len(), last_index);
        Ok(())
    }

    async fn lookup(&self, query: Self::Query) -> Result<Self::Answer, StateMachineError> {
        let store = self.require_open("lookup")?;
        self.app
            .lookup(&self.raft, &*store, query)
            .await
            .map_err(StateMachineError::Lookup)
    }

    /// Every batch is committed synchronously by `update`; nothing to flush.
    async fn sync(&self) -> Result<(), StateMachineError> {
        Ok(())
    }

    async fn prepare_snapshot(&self) -> Result<SnapshotState, StateMachineError> {
        let store = self.require_open("prepare_snapshot")?;
        let applied_index = self.applied_index();
        let tables = store.export().await.map_err(SnapshotError::Store)?;
        Ok(SnapshotState { applied_index, tables })
    }

    async fn save_snapshot(
        &self,
        state: SnapshotState,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), StateMachineError> {
        self.require_open("save_snapshot")?;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut meta = SnapshotMeta {
            version: 0,
            shard_id: self.raft.shard_id,
            replica_id: self.raft.replica_id,
            applied_index: state.applied_index,
            timestamp,
            table_count: 0,
            body_len: 0,
        };
        let bytes = snapshot::encode(&mut meta, &state.tables)?;
        writer.write_all(&bytes).await.map_err(SnapshotError::Io)?;
        writer.flush().await.map_err(SnapshotError::Io)?;
        tracing::info!("Snapshot saved at applied index {} ({} bytes)", state.applied_index, bytes.len());
        Ok(())
    }

    async fn recover_from_snapshot(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<(), StateMachineError> {
        let store = self.require_open("recover_from_snapshot")?;
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await.map_err(SnapshotError::Io)?;
        let (meta, tables) = snapshot::decode(&buffer)?;
        if meta.shard_id != self.raft.shard_id {
            return Err(SnapshotError::Corrupted(format!(
                "snapshot belongs to shard {}, this is shard {}",
                meta.shard_id, self.raft.shard_id
            ))
            .into());
        }

        let applied = self.applied_index();
        if meta.applied_index < applied {
            return Err(SnapshotError::Stale {
                snapshot: meta.applied_index,
                applied,
            }
            .into());
        }

        // Tables and metadata land in one commit or not at all.
        let mut tx = store.begin().await.map_err(StateMachineError::Transaction)?;
        for dump in tables {
            if let Err(e) = tx.replace(dump) {
                tx.abort().await;
                return Err(SnapshotError::Store(e).into());
            }
        }
        if let Err(e) = self.metadata.stage(tx.as_mut(), &Metadata::at(meta.applied_index)) {
            tx.abort().await;
            return Err(StateMachineError::Metadata(e));
        }
        tx.commit().await.map_err(StateMachineError::Transaction)?;

        self.initial_applied.store(meta.applied_index, Ordering::SeqCst);
        self.applied.store(meta.applied_index, Ordering::SeqCst);
        metrics::gauge!("concord_applied_index", meta.applied_index as f64);
        tracing::info!(
            "Recovered from snapshot of replica {} at applied index {}",
            meta.replica_id,
            meta.applied_index
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), StateMachineError> {
        if self.phase() == Phase::Closed {
            return Ok(());
        }
        self.set_phase(Phase::Closing);
        self.store.write().take();
        self.set_phase(Phase::Closed);
        tracing::info!("State machine closed: shard {} replica {}", self.raft.shard_id, self.raft.replica_id);
        Ok(())
    }
}
