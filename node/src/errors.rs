// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::application::AppError;
use crate::metadata::MetadataError;
use crate::snapshot::SnapshotError;
use crate::store::StoreError;
use std::fmt;
use thiserror::Error;

/// Lifecycle phase of a state machine adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Unopened = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl Phase {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Unopened,
            1 => Phase::Open,
            2 => Phase::Closing,
            _ => Phase::Closed,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Unopened => "unopened",
            Phase::Open => "open",
            Phase::Closing => "closing",
            Phase::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("schema preparation failed: {0}")]
    Schema(#[source] MetadataError),
    #[error("application init failed: {0}")]
    Init(#[source] AppError),
    #[error("replay invariant violated: entry {index} <= applied index {applied} recovered at open")]
    Replay { index: u64, applied: u64 },
    #[error("log gap: entry {index} arrived but the next expected index is {expected}")]
    Gap { index: u64, expected: u64 },
    #[error("batch transaction failed: {0}")]
    Transaction(#[source] StoreError),
    #[error("metadata write failed: {0}")]
    Metadata(#[source] MetadataError),
    #[error("application failed during batch: {0}")]
    Batch(#[source] AppError),
    #[error("operation '{op}' not allowed while {phase}")]
    InvalidPhase { op: &'static str, phase: Phase },
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("lookup failed: {0}")]
    Lookup(#[source] AppError),
}

impl StateMachineError {
    /// Fatal errors stop the replica: continuing risks diverging state.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StateMachineError::Lookup(_) | StateMachineError::Snapshot(SnapshotError::Stale { .. })
        )
    }
}
