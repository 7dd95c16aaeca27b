// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Committed log entries and their results.

use crate::command::{decode_payload, CommandEnvelope};
use crate::error::{KernelError, KernelResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Result code conventions. Zero is success; anything else is an
/// application-level rejection carrying a human-readable reason in `data`.
pub mod codes {
    pub const SUCCESS: u64 = 0;
    pub const MALFORMED: u64 = 1;
    pub const UNKNOWN_COMMAND: u64 = 2;
    pub const TOPIC_NOT_FOUND: u64 = 3;
    pub const INVALID_PAYLOAD: u64 = 4;
    pub const REJECTED: u64 = 5;
}

/// Normalized view of one committed record, built right before dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub index: u64,
    pub command: String,
    pub value: Value,
    pub replica_id: Option<u64>,
}

impl Entry {
    pub fn from_envelope(index: u64, envelope: CommandEnvelope) -> Self {
        Self {
            index,
            command: envelope.command,
            value: envelope.value,
            replica_id: envelope.replica_id,
        }
    }

    pub fn decode_value<T: DeserializeOwned>(&self) -> KernelResult<T> {
        decode_payload(&self.command, &self.value)
    }
}

/// Outcome of applying one entry. The only failure channel across the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryResult {
    pub value: u64,
    pub data: Vec<u8>,
}

impl EntryResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn success_with(data: Vec<u8>) -> Self {
        Self {
            value: codes::SUCCESS,
            data,
        }
    }

    pub fn success_json<T: Serialize>(payload: &T) -> KernelResult<Self> {
        serde_json::to_vec(payload)
            .map(Self::success_with)
            .map_err(KernelError::Encode)
    }

    pub fn rejected(code: u64, reason: impl Into<String>) -> Self {
        debug_assert_ne!(code, codes::SUCCESS);
        Self {
            value: code,
            data: reason.into().into_bytes(),
        }
    }

    /// Per-entry rejection for bytes that never parsed as an envelope.
    pub fn malformed(err: &KernelError) -> Self {
        Self::rejected(codes::MALFORMED, err.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.value == codes::SUCCESS
    }

    pub fn message(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> KernelResult<T> {
        serde_json::from_slice(&self.data).map_err(|source| KernelError::InvalidPayload {
            command: "result".to_string(),
            source,
        })
    }
}
