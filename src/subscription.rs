// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Identifiers and payloads of the subscription handshake.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Process-local subscription id. A random 64-bit value, always rendered as
/// a decimal string on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| KernelError::InvalidSubscriptionId(s.to_string()))
    }
}

impl TryFrom<String> for SubscriptionId {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubscriptionId> for String {
    fn from(id: SubscriptionId) -> Self {
        id.to_string()
    }
}

/// Payload of `start_subscription`: activate `subscription_id` on
/// `replica_id` only, for the topic called `topic`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSubscription {
    pub subscription_id: SubscriptionId,
    pub replica_id: u64,
    pub topic: String,
}

/// Result payload of a committed `start_subscription`: the commit index is
/// the replay/resume offset for the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStarted {
    pub index: u64,
}
