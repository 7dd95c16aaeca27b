// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Subscription-start handshake.
//!
//! 1. Subscribe locally on replica R: the subscription buffers but delivers
//!    nothing.
//! 2. Propose `start_subscription {subscription_id, replica_id: R, topic}`.
//! 3. Every replica applies the committed entry; only R starts its local
//!    subscription, everyone else treats it as a no-op.
//! 4. The commit index goes back to the caller: history is everything
//!    before it, the subscription delivers everything from it on.

use super::subscription::{Filter, StandardSubscription};
use super::topic::TopicRegistry;
use super::TopicError;
use crate::client::{ClientResult, ReplicatedClient};
use crate::consensus::ConsensusEngine;
use concord_kernel::command::START_SUBSCRIPTION;
use concord_kernel::entry::codes;
use concord_kernel::{EntryResult, StartSubscription, SubscriptionId, SubscriptionStarted};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct SubscriptionCoordinator<M> {
    replica_id: u64,
    topics: Arc<TopicRegistry<M>>,
}

impl<M: Clone + Send + Sync + 'static> SubscriptionCoordinator<M> {
    pub fn new(replica_id: u64, topics: Arc<TopicRegistry<M>>) -> Self {
        Self { replica_id, topics }
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    pub fn topics(&self) -> &Arc<TopicRegistry<M>> {
        &self.topics
    }

    /// Step 1: an inert, buffering subscription on this replica.
    pub fn subscribe(
        &self,
        topic: &str,
        cancel: &CancellationToken,
        filter: Option<Filter<M>>,
    ) -> Result<Arc<StandardSubscription<M>>, TopicError> {
        let topic = self.topics.topic(topic)?;
        Ok(topic.subscribe_standard(cancel, filter))
    }

    pub fn start_command(&self, subscription_id: SubscriptionId, topic: &str) -> StartSubscription {
        StartSubscription {
            subscription_id,
            replica_id: self.replica_id,
            topic: topic.to_string(),
        }
    }

    /// Step 2: commit the start through the log. Returns the commit index.
    pub async fn request_start<E: ConsensusEngine>(
        &self,
        client: &ReplicatedClient<E>,
        subscription_id: SubscriptionId,
        topic: &str,
    ) -> ClientResult<u64> {
        let command = self.start_command(subscription_id, topic);
        let result = client.publish(START_SUBSCRIPTION, &command).await?;
        let started: SubscriptionStarted = result.decode_data()?;
        tracing::info!("Subscription {} on '{}' starts at index {}", subscription_id, topic, started.index);
        Ok(started.index)
    }

    /// Step 3, run after the entry at `index` is committed.
    pub fn activate(&self, index: u64, command: &StartSubscription) -> EntryResult {
        let started = started_at(index);
        if command.replica_id != self.replica_id {
            tracing::debug!(
                "Entry {}: start of subscription {} targets replica {}, skipping",
                index,
                command.subscription_id,
                command.replica_id
            );
            return started;
        }

        let topic = match self.topics.topic(&command.topic) {
            Ok(topic) => topic,
            Err(e) => return EntryResult::rejected(codes::TOPIC_NOT_FOUND, e.to_string()),
        };
        let subscription = match topic.get_subscription(&command.subscription_id.to_string()) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!("Entry {}: cannot start subscription: {}", index, e);
                return started;
            }
        };
        match subscription.start() {
            Ok(()) => tracing::debug!("Entry {}: subscription {} started", index, command.subscription_id),
            Err(e) => tracing::warn!("Entry {}: subscription {} not started: {}", index, command.subscription_id, e),
        }
        started
    }
}

fn started_at(index: u64) -> EntryResult {
    EntryResult::success_json(&SubscriptionStarted { index })
        .unwrap_or_else(|e| EntryResult::rejected(codes::INVALID_PAYLOAD, e.to_string()))
}
