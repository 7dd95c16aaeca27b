// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::store::{DurableStore, Row, RowQuery, Statement, StoreError, StoreTx};
use concord_kernel::{KernelError, Metadata};
use thiserror::Error;

pub const METADATA_TABLE: &str = "concord_metadata";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("corrupt metadata row: {0}")]
    Decode(#[from] KernelError),
}

/// Durable single-row-per-namespace record of the applied index.
/// The row key is the namespace; the value is `{"applied_index": n}`.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    namespace: String,
}

impl MetadataStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn ensure_schema(&self, store: &dyn DurableStore) -> Result<(), MetadataError> {
        store
            .exec(Statement::CreateTable {
                table: METADATA_TABLE.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Missing row means nothing was ever applied.
    pub async fn load(&self, store: &dyn DurableStore) -> Result<Metadata, MetadataError> {
        let rows = store
            .query(RowQuery::Get {
                table: METADATA_TABLE.to_string(),
                key: self.namespace.clone(),
            })
            .await?;
        match rows.first() {
            Some(row) => Ok(Metadata::from_json(&row.value)?),
            None => Ok(Metadata::default()),
        }
    }

    /// Stage the metadata write inside the batch transaction.
    pub fn stage(&self, tx: &mut dyn StoreTx, meta: &Metadata) -> Result<(), MetadataError> {
        tx.append(METADATA_TABLE, Row::new(self.namespace.clone(), meta.to_json()?))?;
        Ok(())
    }
}
