// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-namespace state-machine metadata.

use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};

/// Index of the last log entry whose effects are durably visible.
/// Loaded once at open and overwritten once per update batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub applied_index: u64,
}

impl Metadata {
    pub fn at(applied_index: u64) -> Self {
        Self { applied_index }
    }

    pub fn to_json(&self) -> KernelResult<serde_json::Value> {
        serde_json::to_value(self).map_err(KernelError::Encode)
    }

    pub fn from_json(value: &serde_json::Value) -> KernelResult<Self> {
        Self::deserialize(value).map_err(|source| KernelError::InvalidPayload {
            command: "metadata".to_string(),
            source,
        })
    }
}
