// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-process fan-out.
//!
//! A [`Topic`] holds the live subscriptions of one replica. Subscriptions
//! are never replicated; only the decision to *start* one goes through the
//! log, see [`SubscriptionCoordinator`].

pub mod coordinator;
pub mod subscription;
pub mod topic;

pub use coordinator::SubscriptionCoordinator;
pub use subscription::{Filter, StandardSubscription, Subscription, SubscriptionState};
pub use topic::{Topic, TopicRegistry};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscription closed")]
    Closed,
    #[error("subscription not ready")]
    NotReady,
    #[error("subscription already has a listener")]
    AlreadyListening,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("subscription {0} not found")]
    NotFound(String),
    #[error("invalid subscription id '{0}'")]
    InvalidId(String),
    #[error("topic '{0}' not found")]
    TopicNotFound(String),
    #[error("topic '{0}' already exists")]
    TopicExists(String),
}
