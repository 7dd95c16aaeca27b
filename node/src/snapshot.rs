// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! State machine snapshot file format.
//!
//! ```text
//! [MAGIC u32][VERSION u32][META_LEN u32][META JSON][BODY JSON][CRC32 u32]
//! ```
//! The body is the JSON array of table dumps. The trailing CRC covers every
//! byte before it.

use crate::store::TableDump;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAGIC: u32 = 0x434E_4344; // CNCD
const SCHEMA_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot too short")]
    TooShort,
    #[error("checksum mismatch")]
    Checksum,
    #[error("invalid magic")]
    Magic,
    #[error("unsupported version {0}")]
    Version(u32),
    #[error("snapshot at applied index {snapshot} is older than local applied index {applied}")]
    Stale { snapshot: u64, applied: u64 },
    #[error("snapshot corrupted: {0}")]
    Corrupted(String),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: u32,
    pub shard_id: u64,
    pub replica_id: u64,
    pub applied_index: u64,
    pub timestamp: u64,
    pub table_count: u32,
    pub body_len: u64,
}

pub fn encode(meta: &mut SnapshotMeta, tables: &[TableDump]) -> Result<Vec<u8>, SnapshotError> {
    let body = serde_json::to_vec(tables)?;
    meta.version = SCHEMA_VERSION;
    meta.table_count = tables.len() as u32;
    meta.body_len = body.len() as u64;
    let meta_json = serde_json::to_vec(meta)?;

    let mut out = Vec::with_capacity(HEADER_LEN + meta_json.len() + body.len() + 4);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    out.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta_json);
    out.extend_from_slice(&body);

    let mut hasher = Hasher::new();
    hasher.update(&out);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(out)
}

/// Verify framing and checksum, return the header and the body bytes.
fn split(buffer: &[u8]) -> Result<(SnapshotMeta, &[u8]), SnapshotError> {
    if buffer.len() < HEADER_LEN + 4 {
        return Err(SnapshotError::TooShort);
    }

    let (content, trailer) = buffer.split_at(buffer.len() - 4);
    let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let mut hasher = Hasher::new();
    hasher.update(content);
    if hasher.finalize() != stored_crc {
        return Err(SnapshotError::Checksum);
    }

    let word = |at: usize| u32::from_le_bytes([content[at], content[at + 1], content[at + 2], content[at + 3]]);
    if word(0) != MAGIC {
        return Err(SnapshotError::Magic);
    }
    let version = word(4);
    if version != SCHEMA_VERSION {
        return Err(SnapshotError::Version(version));
    }

    let meta_end = HEADER_LEN + word(8) as usize;
    if content.len() < meta_end {
        return Err(SnapshotError::Corrupted("truncated metadata".to_string()));
    }
    let meta: SnapshotMeta = serde_json::from_slice(&content[HEADER_LEN..meta_end])?;

    let body = &content[meta_end..];
    if body.len() as u64 != meta.body_len {
        return Err(SnapshotError::Corrupted(format!(
            "meta claims {} body bytes, found {}",
            meta.body_len,
            body.len()
        )));
    }
    Ok((meta, body))
}

pub fn decode(buffer: &[u8]) -> Result<(SnapshotMeta, Vec<TableDump>), SnapshotError> {
    let (meta, body) = split(buffer)?;
    let tables: Vec<TableDump> = serde_json::from_slice(body)?;
    if tables.len() != meta.table_count as usize {
        return Err(SnapshotError::Corrupted(format!(
            "meta claims {} tables, found {}",
            meta.table_count,
            tables.len()
        )));
    }
    Ok((meta, tables))
}

pub fn read_header(buffer: &[u8]) -> Result<SnapshotMeta, SnapshotError> {
    split(buffer).map(|(meta, _)| meta)
}
