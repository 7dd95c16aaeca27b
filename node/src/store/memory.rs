// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-memory implementation of the durable store.
//!
//! Used by tests, the CLI demo and any deployment that does not need to
//! survive a process restart. A `MemoryStore` shared between two state
//! machine instances behaves like an external database that outlives a
//! crashed replica, which is how the recovery tests use it.
//!
//! Tables live under one `RwLock`: readers run concurrently with each other
//! and only block for the duration of a commit's apply step.

use super::{DurableStore, Row, RowQuery, Statement, StoreError, StoreResult, StoreTx, TableDump};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type Tables = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Default)]
struct Inner {
    tables: RwLock<Tables>,
    fail_commits: AtomicUsize,
    commits: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail before anything is applied.
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.fail_commits.store(n, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.inner.tables.read().get(table).map(|t| t.len())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.inner.tables.read().keys().cloned().collect()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn exec(&self, stmt: Statement) -> StoreResult<()> {
        let mut tables = self.inner.tables.write();
        match stmt {
            Statement::CreateTable { table } => {
                tables.entry(table).or_default();
            }
            Statement::Upsert { table, row } => {
                let t = tables.get_mut(&table).ok_or(StoreError::TableNotFound(table))?;
                t.insert(row.key, row.value);
            }
        }
        Ok(())
    }

    async fn query(&self, query: RowQuery) -> StoreResult<Vec<Row>> {
        let tables = self.inner.tables.read();
        match query {
            RowQuery::Get { table, key } => {
                let t = tables.get(&table).ok_or(StoreError::TableNotFound(table))?;
                Ok(t.get(&key).map(|v| Row::new(key.clone(), v.clone())).into_iter().collect())
            }
            RowQuery::Range { table, from, to, limit } => {
                let t = tables.get(&table).ok_or(StoreError::TableNotFound(table))?;
                let rows = t
                    .iter()
                    .filter(|(k, _)| from.as_deref().map_or(true, |f| k.as_str() >= f))
                    .take_while(|(k, _)| to.as_deref().map_or(true, |e| k.as_str() < e))
                    .take(limit.unwrap_or(usize::MAX))
                    .map(|(k, v)| Row::new(k.clone(), v.clone()))
                    .collect();
                Ok(rows)
            }
        }
    }

    async fn async_insert(&self, table: &str, rows: Vec<Row>) -> StoreResult<()> {
        let mut tables = self.inner.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        for row in rows {
            t.insert(row.key, row.value);
        }
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            writes: Vec::new(),
        }))
    }

    async fn export(&self) -> StoreResult<Vec<TableDump>> {
        let tables = self.inner.tables.read();
        Ok(tables
            .iter()
            .map(|(name, rows)| TableDump {
                table: name.clone(),
                rows: rows.iter().map(|(k, v)| Row::new(k.clone(), v.clone())).collect(),
            })
            .collect())
    }
}

enum Write {
    Upsert(String, Row),
    Replace(TableDump),
}

struct MemoryTx {
    inner: Arc<Inner>,
    writes: Vec<Write>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    fn append(&mut self, table: &str, row: Row) -> StoreResult<()> {
        self.writes.push(Write::Upsert(table.to_string(), row));
        Ok(())
    }

    fn replace(&mut self, dump: TableDump) -> StoreResult<()> {
        self.writes.push(Write::Replace(dump));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { inner, writes } = *self;
        let injected = inner
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Commit("injected failure".to_string()));
        }

        let mut tables = inner.tables.write();
        // All-or-nothing: validate before the first write lands.
        let replaced: Vec<&str> = writes
            .iter()
            .filter_map(|w| match w {
                Write::Replace(dump) => Some(dump.table.as_str()),
                Write::Upsert(..) => None,
            })
            .collect();
        let missing = writes.iter().find_map(|w| match w {
            Write::Upsert(t, _) if !tables.contains_key(t) && !replaced.contains(&t.as_str()) => Some(t.clone()),
            _ => None,
        });
        if let Some(missing) = missing {
            return Err(StoreError::TableNotFound(missing));
        }

        for write in writes {
            match write {
                Write::Upsert(table, row) => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.insert(row.key, row.value);
                    }
                }
                Write::Replace(dump) => {
                    let rows = dump.rows.into_iter().map(|r| (r.key, r.value)).collect();
                    tables.insert(dump.table, rows);
                }
            }
        }
        inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        tracing::debug!("Transaction aborted with {} pending writes", self.writes.len());
    }
}
