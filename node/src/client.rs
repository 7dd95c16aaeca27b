// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Replicated client: proposals and linearizable reads against one shard,
//! with bounded retry.
//!
//! Each attempt gets its own timeout. Between attempts the client sleeps
//! `backoff_step * attempt`. Application rejections are never retried, and
//! neither are permanent read answers such as "not found".

use crate::config::RetryPolicy;
use crate::consensus::{ConsensusEngine, ConsensusError};
use concord_kernel::{CommandEnvelope, EntryResult, KernelError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("shard {shard_id} not ready after {attempts} attempts: {last}")]
    NotReady { shard_id: u64, attempts: u32, last: String },
    #[error("rejected (code {code}): {message}")]
    Rejected { code: u64, message: String },
    #[error("permanent failure: {0}")]
    Permanent(#[source] ConsensusError),
    #[error(transparent)]
    Encode(#[from] KernelError),
}

impl ClientError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, ClientError::NotReady { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ClientError::Rejected { .. })
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

pub struct ReplicatedClient<E: ConsensusEngine> {
    engine: Arc<E>,
    shard_id: u64,
    replica_id: u64,
    policy: RetryPolicy,
}

impl<E: ConsensusEngine> Clone for ReplicatedClient<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            policy: self.policy,
        }
    }
}

impl<E: ConsensusEngine> ReplicatedClient<E> {
    pub fn new(engine: Arc<E>, shard_id: u64, replica_id: u64, policy: RetryPolicy) -> Self {
        Self {
            engine,
            shard_id,
            replica_id,
            policy,
        }
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wrap `payload` in an envelope stamped with this replica and propose it.
    pub async fn publish<T: Serialize>(&self, command: &str, payload: &T) -> ClientResult<EntryResult> {
        let envelope = CommandEnvelope::encode(command, payload)?.with_replica(self.replica_id);
        self.propose(&envelope).await
    }

    /// Propose an already built envelope. A committed non-zero result comes
    /// back as [`ClientError::Rejected`].
    pub async fn propose(&self, envelope: &CommandEnvelope) -> ClientResult<EntryResult> {
        let payload = envelope.to_bytes()?;
        let result = self
            .with_retry(&envelope.command, |_| false, || {
                self.engine.sync_propose(self.shard_id, payload.clone())
            })
            .await?;

        if !result.is_success() {
            tracing::debug!("Command '{}' rejected with code {}: {}", envelope.command, result.value, result.message());
            return Err(ClientError::Rejected {
                code: result.value,
                message: result.message().into_owned(),
            });
        }
        Ok(result)
    }

    /// Linearizable read. Permanent answers abort the retry loop immediately.
    pub async fn query(&self, query: E::Query) -> ClientResult<E::Answer>
    where
        E::Query: Clone,
    {
        self.with_retry("query", ConsensusError::is_permanent, || {
            self.engine.sync_read(self.shard_id, query.clone())
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        permanent: impl Fn(&ConsensusError) -> bool,
        mut op: F,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ConsensusError>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            let outcome = match tokio::time::timeout(self.policy.attempt_timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ConsensusError::Timeout),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if permanent(&e) => {
                    tracing::debug!("{} on shard {} failed permanently: {}", what, self.shard_id, e);
                    return Err(ClientError::Permanent(e));
                }
                Err(e) => {
                    tracing::warn!(
                        "{} on shard {} attempt {}/{} failed: {}",
                        what,
                        self.shard_id,
                        attempt,
                        attempts,
                        e
                    );
                    last = e.to_string();
                }
            }
            if attempt < attempts {
                metrics::counter!("concord_proposal_retries_total", 1);
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        Err(ClientError::NotReady {
            shard_id: self.shard_id,
            attempts,
            last,
        })
    }
}
