// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Application contract.
//!
//! A business state machine plugs into the adapter through [`Application`].
//! Per batch the adapter calls, in order:
//! ```text
//! prepare_update
//! ↓
//! on_update (once per entry, in log order)
//! ↓
//! apply        (flush staged business rows into the batch transaction)
//! ↓
//! -- adapter writes metadata + commits --
//! ↓
//! after_commit (once per deferred effect, in log order)
//! ```
//! `on_update` must not produce externally visible side effects. Anything
//! that should only happen once the batch is durable goes into
//! [`Applied::effects`].

use crate::consensus::RaftContext;
use crate::store::{DurableStore, Row, RowQuery, StoreError, StoreResult, StoreTx};
use async_trait::async_trait;
use concord_kernel::entry::codes;
use concord_kernel::{Entry, EntryResult, KernelError};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("{0}")]
    Rejected(String),
}

impl AppError {
    /// Conditions where asking again cannot change the answer.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AppError::NotFound(_) | AppError::InvalidKey(_))
    }

    /// Store failures are local to this replica and not derived from the
    /// log, so they cannot be encoded into a deterministic result.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, AppError::Store(_))
    }

    /// Result code used when this error is folded into an entry's result.
    pub fn code(&self) -> u64 {
        match self {
            AppError::Kernel(KernelError::MalformedEnvelope(_)) => codes::MALFORMED,
            AppError::Kernel(_) => codes::INVALID_PAYLOAD,
            _ => codes::REJECTED,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// What `on_update` hands back for one entry: the result to report once the
/// batch is committed, plus effects to run after the commit.
#[derive(Debug)]
pub struct Applied<E> {
    pub result: EntryResult,
    pub effects: Vec<E>,
}

impl<E> Applied<E> {
    pub fn done(result: EntryResult) -> Self {
        Self {
            result,
            effects: Vec::new(),
        }
    }

    pub fn with_effect(result: EntryResult, effect: E) -> Self {
        Self {
            result,
            effects: vec![effect],
        }
    }
}

/// Write scope of one update batch.
///
/// Business rows are staged here during `on_update` and moved into the
/// transaction by [`UpdateBatch::flush`] from `apply`. Dropping the batch
/// without committing discards both.
pub struct UpdateBatch<'a> {
    raft: &'a RaftContext,
    store: &'a dyn DurableStore,
    tx: Box<dyn StoreTx>,
    staged: Vec<(String, Row)>,
}

impl<'a> UpdateBatch<'a> {
    pub(crate) fn new(raft: &'a RaftContext, store: &'a dyn DurableStore, tx: Box<dyn StoreTx>) -> Self {
        Self {
            raft,
            store,
            tx,
            staged: Vec::new(),
        }
    }

    pub fn raft(&self) -> &RaftContext {
        self.raft
    }

    /// Committed state only; rows staged in this batch are not visible here.
    pub fn store(&self) -> &dyn DurableStore {
        self.store
    }

    pub fn stage(&mut self, table: impl Into<String>, row: Row) {
        self.staged.push((table.into(), row));
    }

    /// Latest staged value for `key` in `table`, if any.
    pub fn staged(&self, table: &str, key: &str) -> Option<&Value> {
        self.staged
            .iter()
            .rev()
            .find(|(t, r)| t == table && r.key == key)
            .map(|(_, r)| &r.value)
    }

    /// Staged value if present, else the committed one.
    pub async fn read(&self, table: &str, key: &str) -> StoreResult<Option<Value>> {
        if let Some(v) = self.staged(table, key) {
            return Ok(Some(v.clone()));
        }
        let rows = self
            .store
            .query(RowQuery::Get {
                table: table.to_string(),
                key: key.to_string(),
            })
            .await?;
        Ok(rows.into_iter().next().map(|r| r.value))
    }

    /// Move staged rows into the batch transaction.
    pub fn flush(&mut self) -> StoreResult<usize> {
        let n = self.staged.len();
        for (table, row) in self.staged.drain(..) {
            self.tx.append(&table, row)?;
        }
        Ok(n)
    }

    pub(crate) fn into_tx(self) -> Box<dyn StoreTx> {
        self.tx
    }
}

#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Deferred work produced by `on_update`, run after commit.
    type Effect: Send + 'static;
    type Query: Send + 'static;
    type Answer: Send + 'static;

    /// Prepare schema and in-memory state. Failure is fatal for the replica.
    async fn init(&self, raft: &RaftContext, store: &dyn DurableStore) -> AppResult<()>;

    async fn prepare_update(&self, _batch: &mut UpdateBatch<'_>) -> AppResult<()> {
        Ok(())
    }

    /// Decide the outcome of one entry. `Err` folds into a rejection result
    /// for this entry only, except store errors which abort the batch.
    async fn on_update(&self, batch: &mut UpdateBatch<'_>, entry: &Entry) -> AppResult<Applied<Self::Effect>>;

    /// Flush accumulated business writes into the batch transaction.
    async fn apply(&self, batch: &mut UpdateBatch<'_>) -> AppResult<()>;

    /// Run one deferred effect. `Some` replaces the entry's result.
    async fn after_commit(&self, raft: &RaftContext, index: u64, effect: Self::Effect) -> Option<EntryResult>;

    /// Read-only; may run concurrently with updates and other lookups.
    async fn lookup(&self, raft: &RaftContext, store: &dyn DurableStore, query: Self::Query) -> AppResult<Self::Answer>;
}
