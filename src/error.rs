// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    /// Bytes on the log are not a valid command envelope.
    #[error("malformed command envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    /// Envelope parsed but its value does not match the command's payload.
    #[error("invalid payload for command '{command}': {source}")]
    InvalidPayload {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid subscription id '{0}'")]
    InvalidSubscriptionId(String),
}

pub type KernelResult<T> = core::result::Result<T, KernelError>;
