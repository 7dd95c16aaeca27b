// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Command envelope: the unit proposed to the replicated log.
//!
//! Wire format is JSON: `{"command": "...", "value": <json>, "replica_id": n}`.
//! `replica_id` is omitted when the proposer did not identify itself.

use crate::error::{KernelError, KernelResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command name of the subscription handshake.
pub const START_SUBSCRIPTION: &str = "start_subscription";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_id: Option<u64>,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>, value: Value) -> Self {
        Self {
            command: command.into(),
            value,
            replica_id: None,
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn encode<T: Serialize>(command: impl Into<String>, payload: &T) -> KernelResult<Self> {
        let value = serde_json::to_value(payload).map_err(KernelError::Encode)?;
        Ok(Self::new(command, value))
    }

    pub fn with_replica(mut self, replica_id: u64) -> Self {
        self.replica_id = Some(replica_id);
        self
    }

    pub fn to_bytes(&self) -> KernelResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(KernelError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        serde_json::from_slice(bytes).map_err(KernelError::MalformedEnvelope)
    }

    /// Decode the payload into the command's concrete type.
    pub fn decode_value<T: DeserializeOwned>(&self) -> KernelResult<T> {
        decode_payload(&self.command, &self.value)
    }
}

pub(crate) fn decode_payload<T: DeserializeOwned>(command: &str, value: &Value) -> KernelResult<T> {
    T::deserialize(value).map_err(|source| KernelError::InvalidPayload {
        command: command.to_string(),
        source,
    })
}
