// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Durable store capability.
//!
//! The state machine never sees a concrete store API. It needs exactly:
//! - `exec` for DDL and out-of-batch DML
//! - `query` for point reads and ordered key ranges
//! - `async_insert` for fire-and-forget appends outside a batch
//! - `begin` for the one write transaction that spans an update batch
//! - `export`, and `StoreTx::replace`, for bulk state transfer through
//!   snapshots
//!
//! Rows are JSON values addressed by a string key. Keys order
//! lexicographically, so numeric keys must be zero-padded (see [`index_key`]).

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub value: Value,
}

impl Row {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), value }
    }

    pub fn encode<T: Serialize>(key: impl Into<String>, value: &T) -> StoreResult<Self> {
        Ok(Self::new(key, serde_json::to_value(value)?))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(T::deserialize(&self.value)?)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    /// Idempotent: creating an existing table is a no-op.
    CreateTable { table: String },
    Upsert { table: String, row: Row },
}

#[derive(Clone, Debug, PartialEq)]
pub enum RowQuery {
    Get { table: String, key: String },
    /// Ascending keys in `[from, to)`; open bounds when `None`.
    Range {
        table: String,
        from: Option<String>,
        to: Option<String>,
        limit: Option<usize>,
    },
}

/// Every row of one table, used for snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    pub table: String,
    pub rows: Vec<Row>,
}

#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn exec(&self, stmt: Statement) -> StoreResult<()>;
    async fn query(&self, query: RowQuery) -> StoreResult<Vec<Row>>;
    async fn async_insert(&self, table: &str, rows: Vec<Row>) -> StoreResult<()>;
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;
    async fn export(&self) -> StoreResult<Vec<TableDump>>;
}

/// A write transaction. Nothing is visible to readers until `commit`
/// succeeds, and a failed commit leaves no trace.
#[async_trait]
pub trait StoreTx: Send + Sync {
    fn append(&mut self, table: &str, row: Row) -> StoreResult<()>;
    /// Replace the whole content of `dump.table`, creating it if missing.
    fn replace(&mut self, dump: TableDump) -> StoreResult<()>;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn abort(self: Box<Self>);
}

/// Zero-padded key so that log indexes sort numerically.
pub fn index_key(index: u64) -> String {
    format!("{:020}", index)
}
