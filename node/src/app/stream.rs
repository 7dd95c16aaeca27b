// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Event stream: an append-only, de-duplicated event log per topic with
//! live fan-out to local subscribers.
//!
//! Commands:
//! - `post`: append an event. Its `event_id` is the commit index. A repeat of
//!   the same `(key, id)` pair returns the original event instead.
//! - `start_subscription`: handled by the [`SubscriptionCoordinator`].
//!
//! Events are broadcast only after the batch that wrote them commits.

use crate::application::{AppError, AppResult, Applied, Application, UpdateBatch};
use crate::consensus::RaftContext;
use crate::metadata::{MetadataError, MetadataStore};
use crate::notify::SubscriptionCoordinator;
use crate::store::{index_key, DurableStore, Row, RowQuery, Statement};
use async_trait::async_trait;
use concord_kernel::command::START_SUBSCRIPTION;
use concord_kernel::entry::codes;
use concord_kernel::{Entry, EntryResult, StartSubscription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const EVENTS_TABLE: &str = "events";
pub const EVENT_KEYS_TABLE: &str = "event_keys";
pub const POST: &str = "post";

/// Payload of `post`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostEvent {
    pub topic: String,
    /// Idempotency key.
    pub key: String,
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub topic: String,
    pub key: String,
    pub id: String,
    pub payload: Value,
}

/// Result data of `post`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posted {
    pub event_id: u64,
    pub duplicate: bool,
}

#[derive(Debug)]
pub enum StreamEffect {
    Broadcast(Event),
    StartSubscription(StartSubscription),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamQuery {
    Event { event_id: u64 },
    /// Events of `topic` with `event_id < before`, the last `limit` of them.
    EventsBefore { topic: String, before: u64, limit: Option<usize> },
    /// Events of `topic` with `event_id >= since`, the first `limit` of them.
    EventsSince { topic: String, since: u64, limit: Option<usize> },
    AppliedIndex,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamAnswer {
    Event(Event),
    Events(Vec<Event>),
    AppliedIndex(u64),
}

pub struct StreamApp {
    metadata: MetadataStore,
    coordinator: Arc<SubscriptionCoordinator<Event>>,
}

impl StreamApp {
    /// `namespace` must match the adapter's so `AppliedIndex` reads the
    /// right metadata row.
    pub fn new(namespace: impl Into<String>, coordinator: Arc<SubscriptionCoordinator<Event>>) -> Self {
        Self {
            metadata: MetadataStore::new(namespace),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<SubscriptionCoordinator<Event>> {
        &self.coordinator
    }

    async fn post(&self, batch: &mut UpdateBatch<'_>, entry: &Entry) -> AppResult<Applied<StreamEffect>> {
        let post: PostEvent = entry.decode_value()?;
        if post.topic.is_empty() {
            return Err(AppError::InvalidKey("empty topic".into()));
        }
        if post.key.is_empty() {
            return Err(AppError::InvalidKey("empty idempotency key".into()));
        }

        let dedup_key = format!("{}/{}", post.key, post.id);
        if let Some(existing) = batch.read(EVENT_KEYS_TABLE, &dedup_key).await? {
            let event_id = existing
                .as_u64()
                .ok_or_else(|| AppError::Rejected(format!("corrupt dedup row for '{}'", dedup_key)))?;
            tracing::debug!("Entry {}: duplicate of event {}", entry.index, event_id);
            let result = EntryResult::success_json(&Posted {
                event_id,
                duplicate: true,
            })?;
            return Ok(Applied::done(result));
        }

        let event = Event {
            event_id: entry.index,
            topic: post.topic,
            key: post.key,
            id: post.id,
            payload: post.payload,
        };
        batch.stage(EVENTS_TABLE, Row::encode(index_key(event.event_id), &event)?);
        batch.stage(EVENT_KEYS_TABLE, Row::new(dedup_key, Value::from(event.event_id)));

        let result = EntryResult::success_json(&Posted {
            event_id: event.event_id,
            duplicate: false,
        })?;
        Ok(Applied::with_effect(result, StreamEffect::Broadcast(event)))
    }

    async fn events(
        &self,
        store: &dyn DurableStore,
        topic: &str,
        from: Option<u64>,
        to: Option<u64>,
    ) -> AppResult<Vec<Event>> {
        let rows = store
            .query(RowQuery::Range {
                table: EVENTS_TABLE.to_string(),
                from: from.map(index_key),
                to: to.map(index_key),
                limit: None,
            })
            .await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event: Event = row.decode()?;
            if event.topic == topic {
                events.push(event);
            }
        }
        Ok(events)
    }
}

fn metadata_error(e: MetadataError) -> AppError {
    match e {
        MetadataError::Store(e) => AppError::Store(e),
        MetadataError::Decode(e) => AppError::Kernel(e),
    }
}

#[async_trait]
impl Application for StreamApp {
    type Effect = StreamEffect;
    type Query = StreamQuery;
    type Answer = StreamAnswer;

    async fn init(&self, raft: &RaftContext, store: &dyn DurableStore) -> AppResult<()> {
        for table in [EVENTS_TABLE, EVENT_KEYS_TABLE] {
            store
                .exec(Statement::CreateTable {
                    table: table.to_string(),
                })
                .await?;
        }
        tracing::info!("Event stream ready on shard {} replica {}", raft.shard_id, raft.replica_id);
        Ok(())
    }

    async fn on_update(&self, batch: &mut UpdateBatch<'_>, entry: &Entry) -> AppResult<Applied<StreamEffect>> {
        match entry.command.as_str() {
            POST => self.post(batch, entry).await,
            START_SUBSCRIPTION => {
                let command: StartSubscription = entry.decode_value()?;
                Ok(Applied::with_effect(
                    EntryResult::success(),
                    StreamEffect::StartSubscription(command),
                ))
            }
            other => Ok(Applied::done(EntryResult::rejected(
                codes::UNKNOWN_COMMAND,
                format!("unknown command '{}'", other),
            ))),
        }
    }

    async fn apply(&self, batch: &mut UpdateBatch<'_>) -> AppResult<()> {
        batch.flush()?;
        Ok(())
    }

    async fn after_commit(&self, _raft: &RaftContext, index: u64, effect: StreamEffect) -> Option<EntryResult> {
        match effect {
            StreamEffect::Broadcast(event) => {
                match self.coordinator.topics().get(&event.topic) {
                    Some(topic) => {
                        let delivered = topic.broadcast(event).await;
                        tracing::debug!("Entry {}: delivered to {} subscribers", index, delivered);
                    }
                    None => tracing::debug!("Entry {}: no local topic '{}'", index, event.topic),
                }
                None
            }
            StreamEffect::StartSubscription(command) => Some(self.coordinator.activate(index, &command)),
        }
    }

    async fn lookup(&self, _raft: &RaftContext, store: &dyn DurableStore, query: StreamQuery) -> AppResult<StreamAnswer> {
        match query {
            StreamQuery::Event { event_id } => {
                let rows = store
                    .query(RowQuery::Get {
                        table: EVENTS_TABLE.to_string(),
                        key: index_key(event_id),
                    })
                    .await?;
                let row = rows
                    .first()
                    .ok_or_else(|| AppError::NotFound(format!("event {}", event_id)))?;
                Ok(StreamAnswer::Event(row.decode()?))
            }
            StreamQuery::EventsBefore { topic, before, limit } => {
                let mut events = self.events(store, &topic, None, Some(before)).await?;
                if let Some(limit) = limit {
                    let skip = events.len().saturating_sub(limit);
                    events.drain(..skip);
                }
                Ok(StreamAnswer::Events(events))
            }
            StreamQuery::EventsSince { topic, since, limit } => {
                let mut events = self.events(store, &topic, Some(since), None).await?;
                if let Some(limit) = limit {
                    events.truncate(limit);
                }
                Ok(StreamAnswer::Events(events))
            }
            StreamQuery::AppliedIndex => {
                let meta = self.metadata.load(store).await.map_err(metadata_error)?;
                Ok(StreamAnswer::AppliedIndex(meta.applied_index))
            }
        }
    }
}
