// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Topics and the per-process topic registry.

use super::subscription::{Filter, StandardSubscription, Subscription};
use super::TopicError;
use crate::config::SubscriptionConfig;
use concord_kernel::SubscriptionId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Registered<M> = Arc<dyn Subscription<M>>;

struct TopicInner<M> {
    name: String,
    config: SubscriptionConfig,
    subscriptions: RwLock<HashMap<SubscriptionId, Registered<M>>>,
}

impl<M> TopicInner<M> {
    fn report_len(&self, len: usize) {
        metrics::gauge!("concord_subscriptions_active", len as f64, "topic" => self.name.clone());
    }
}

/// Named fan-out point shared by every caller on one replica. Cloning
/// shares the same subscriber set.
pub struct Topic<M> {
    inner: Arc<TopicInner<M>>,
}

impl<M> Clone for Topic<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Clone + Send + Sync + 'static> Topic<M> {
    pub fn new(name: impl Into<String>, config: SubscriptionConfig) -> Self {
        Self {
            inner: Arc::new(TopicInner {
                name: name.into(),
                config,
                subscriptions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.inner.config
    }

    /// Register a new subscription built by `factory` under a fresh random
    /// id. It lives until `cancel` (or the subscription's own token, which is
    /// a child of it) fires, at which point it is unregistered.
    pub fn subscribe<S, F>(&self, cancel: &CancellationToken, factory: F) -> Arc<S>
    where
        S: Subscription<M> + 'static,
        F: FnOnce(SubscriptionId, CancellationToken) -> S,
    {
        let child = cancel.child_token();
        let id = {
            let subscriptions = self.inner.subscriptions.read();
            loop {
                let id = SubscriptionId::from_raw(rand::random());
                if !subscriptions.contains_key(&id) {
                    break id;
                }
            }
        };

        let subscription = Arc::new(factory(id, child.clone()));
        let len = {
            let mut subscriptions = self.inner.subscriptions.write();
            subscriptions.insert(id, subscription.clone() as Registered<M>);
            subscriptions.len()
        };
        self.inner.report_len(len);
        subscription.attach();
        tracing::debug!("Topic '{}': subscription {} registered", self.inner.name, id);

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            child.cancelled().await;
            let Some(inner) = weak.upgrade() else { return };
            let len = {
                let mut subscriptions = inner.subscriptions.write();
                if subscriptions.remove(&id).is_none() {
                    return;
                }
                subscriptions.len()
            };
            inner.report_len(len);
            tracing::debug!("Topic '{}': subscription {} unregistered", inner.name, id);
        });

        subscription
    }

    /// [`subscribe`](Self::subscribe) with a [`StandardSubscription`] using
    /// this topic's configuration.
    pub fn subscribe_standard(&self, cancel: &CancellationToken, filter: Option<Filter<M>>) -> Arc<StandardSubscription<M>> {
        self.subscribe(cancel, StandardSubscription::factory(self.inner.config, filter))
    }

    /// Publish `message` to every registered subscription, one after the
    /// other. A failing subscriber is logged and skipped. Returns how many
    /// accepted the message.
    pub async fn broadcast(&self, message: M) -> usize {
        let targets: Vec<Registered<M>> = self.inner.subscriptions.read().values().cloned().collect();
        let mut delivered = 0;
        for subscription in targets {
            match subscription.publish(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    metrics::counter!("concord_broadcast_failures_total", 1);
                    tracing::warn!(
                        "Topic '{}': publish to subscription {} failed: {}",
                        self.inner.name,
                        subscription.id(),
                        e
                    );
                }
            }
        }
        delivered
    }

    pub fn get_subscription(&self, id: &str) -> Result<Registered<M>, TopicError> {
        let parsed = parse_id(id)?;
        self.inner
            .subscriptions
            .read()
            .get(&parsed)
            .cloned()
            .ok_or_else(|| TopicError::NotFound(id.to_string()))
    }

    /// Unregister and close.
    pub fn remove_subscription(&self, id: &str) -> Result<Registered<M>, TopicError> {
        let parsed = parse_id(id)?;
        let (removed, len) = {
            let mut subscriptions = self.inner.subscriptions.write();
            let removed = subscriptions.remove(&parsed);
            (removed, subscriptions.len())
        };
        let removed = removed.ok_or_else(|| TopicError::NotFound(id.to_string()))?;
        self.inner.report_len(len);
        removed.close();
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_id(id: &str) -> Result<SubscriptionId, TopicError> {
    id.parse().map_err(|_| TopicError::InvalidId(id.to_string()))
}

/// Named topics hosted by one process.
pub struct TopicRegistry<M> {
    config: SubscriptionConfig,
    topics: RwLock<BTreeMap<String, Topic<M>>>,
}

impl<M: Clone + Send + Sync + 'static> TopicRegistry<M> {
    pub fn new(config: SubscriptionConfig) -> Self {
        Self {
            config,
            topics: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn create(&self, name: &str) -> Result<Topic<M>, TopicError> {
        let mut topics = self.topics.write();
        if topics.contains_key(name) {
            return Err(TopicError::TopicExists(name.to_string()));
        }
        let topic = Topic::new(name, self.config);
        topics.insert(name.to_string(), topic.clone());
        tracing::info!("Topic '{}' created", name);
        Ok(topic)
    }

    pub fn get_or_create(&self, name: &str) -> Topic<M> {
        if let Some(topic) = self.get(name) {
            return topic;
        }
        self.topics
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(name, self.config))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Topic<M>> {
        self.topics.read().get(name).cloned()
    }

    pub fn topic(&self, name: &str) -> Result<Topic<M>, TopicError> {
        self.get(name).ok_or_else(|| TopicError::TopicNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }

    pub fn remove(&self, name: &str) -> Option<Topic<M>> {
        self.topics.write().remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::SubscriptionState;

    #[tokio::test]
    async fn test_get_subscription_not_found_vs_invalid() {
        let topic: Topic<u64> = Topic::new("events", SubscriptionConfig::default());
        assert_eq!(topic.get_subscription("12").err(), Some(TopicError::NotFound("12".into())));
        assert_eq!(topic.get_subscription("abc").err(), Some(TopicError::InvalidId("abc".into())));
    }

    #[tokio::test]
    async fn test_cancel_unregisters() {
        let topic: Topic<u64> = Topic::new("events", SubscriptionConfig::default());
        let cancel = CancellationToken::new();
        let sub = topic.subscribe_standard(&cancel, None);
        let _rx = sub.listen().unwrap();
        assert_eq!(topic.len(), 1);
        assert!(topic.get_subscription(&sub.id().to_string()).is_ok());

        cancel.cancel();
        for _ in 0..100 {
            if topic.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(topic.is_empty());
        assert_eq!(sub.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn test_remove_closes() {
        let topic: Topic<u64> = Topic::new("events", SubscriptionConfig::default());
        let sub = topic.subscribe_standard(&CancellationToken::new(), None);
        let id = sub.id().to_string();
        topic.remove_subscription(&id).unwrap();
        assert!(topic.is_empty());
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert!(topic.remove_subscription(&id).is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed() {
        let topic: Topic<u64> = Topic::new("events", SubscriptionConfig::default());
        let live = topic.subscribe_standard(&CancellationToken::new(), None);
        let mut rx = live.listen().unwrap();
        live.start().unwrap();
        let dead = topic.subscribe_standard(&CancellationToken::new(), None);
        let _dead_rx = dead.listen().unwrap();
        dead.start().unwrap();
        dead.close();

        assert_eq!(topic.broadcast(5).await, 1);
        assert_eq!(rx.recv().await, Some(5));
    }

    #[test]
    fn test_registry() {
        let registry: TopicRegistry<u64> = TopicRegistry::new(SubscriptionConfig::default());
        registry.create("b").unwrap();
        registry.create("a").unwrap();
        assert_eq!(registry.create("a").err(), Some(TopicError::TopicExists("a".into())));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.topic("zz").err(), Some(TopicError::TopicNotFound("zz".into())));
        assert!(registry.remove("a").is_some());
        assert_eq!(registry.get_or_create("c").name(), "c");
    }
}
