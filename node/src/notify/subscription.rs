// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Subscription state machine.
//!
//! ```text
//! created ──attach──▶ buffering ──start──▶ started
//!    │                    │                   │
//!    └────────────────────┴───────────────────┴──▶ closed
//! ```
//! `created`: constructed by a factory, not yet registered; publish is
//! refused with [`SubscriptionError::NotReady`].
//! `buffering`: registered; publishes are queued but nothing reaches the
//! listener. `started`: the queue is flushed in order, then live delivery.
//! `closed` is terminal: publish fails with [`SubscriptionError::Closed`]
//! and the listen channel ends.

use super::SubscriptionError;
use crate::config::SubscriptionConfig;
use async_trait::async_trait;
use concord_kernel::SubscriptionId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    Created = 0,
    Buffering = 1,
    Started = 2,
    Closed = 3,
}

impl SubscriptionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SubscriptionState::Created,
            1 => SubscriptionState::Buffering,
            2 => SubscriptionState::Started,
            _ => SubscriptionState::Closed,
        }
    }
}

/// Optional per-subscription predicate; rejected messages are dropped.
pub type Filter<M> = Arc<dyn Fn(&M) -> bool + Send + Sync>;

#[async_trait]
pub trait Subscription<M>: Send + Sync {
    fn id(&self) -> SubscriptionId;
    fn state(&self) -> SubscriptionState;
    /// Called once by the topic right after registration.
    fn attach(&self);
    async fn publish(&self, message: M) -> Result<(), SubscriptionError>;
    fn start(&self) -> Result<(), SubscriptionError>;
    /// Outward channel. Can be taken once.
    fn listen(&self) -> Result<mpsc::Receiver<M>, SubscriptionError>;
    fn close(&self);
}

struct Shared {
    state: AtomicU8,
    listened: AtomicBool,
    start: Notify,
}

impl Shared {
    fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct LoopParts<M> {
    inbound: mpsc::Receiver<M>,
    outward: mpsc::Sender<M>,
}

/// Default subscription: one receive task per subscriber, bounded queues on
/// both sides.
pub struct StandardSubscription<M> {
    id: SubscriptionId,
    config: SubscriptionConfig,
    filter: Option<Filter<M>>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    inbound: mpsc::Sender<M>,
    parts: Mutex<Option<LoopParts<M>>>,
    outward: Mutex<Option<mpsc::Receiver<M>>>,
}

impl<M: Send + 'static> StandardSubscription<M> {
    pub fn new(id: SubscriptionId, cancel: CancellationToken, config: SubscriptionConfig, filter: Option<Filter<M>>) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outward_tx, outward_rx) = mpsc::channel(capacity);
        Self {
            id,
            config,
            filter,
            cancel,
            shared: Arc::new(Shared {
                state: AtomicU8::new(SubscriptionState::Created as u8),
                listened: AtomicBool::new(false),
                start: Notify::new(),
            }),
            inbound: inbound_tx,
            parts: Mutex::new(Some(LoopParts {
                inbound: inbound_rx,
                outward: outward_tx,
            })),
            outward: Mutex::new(Some(outward_rx)),
        }
    }

    /// Factory for [`Topic::subscribe`](super::Topic::subscribe).
    pub fn factory(
        config: SubscriptionConfig,
        filter: Option<Filter<M>>,
    ) -> impl FnOnce(SubscriptionId, CancellationToken) -> Self {
        move |id, cancel| Self::new(id, cancel, config, filter)
    }

    /// Resolves once the subscription has closed or is closing.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

#[async_trait]
impl<M: Send + 'static> Subscription<M> for StandardSubscription<M> {
    fn id(&self) -> SubscriptionId {
        self.id
    }

    fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    fn attach(&self) {
        let Some(parts) = self.parts.lock().take() else {
            return;
        };
        if !self.shared.transition(SubscriptionState::Created, SubscriptionState::Buffering) {
            return;
        }
        tokio::spawn(receive_loop(
            self.id,
            self.config,
            self.filter.clone(),
            self.cancel.clone(),
            self.shared.clone(),
            parts,
        ));
    }

    async fn publish(&self, message: M) -> Result<(), SubscriptionError> {
        match self.shared.state() {
            SubscriptionState::Closed => Err(SubscriptionError::Closed),
            SubscriptionState::Created => Err(SubscriptionError::NotReady),
            SubscriptionState::Buffering | SubscriptionState::Started => self
                .inbound
                .send(message)
                .await
                .map_err(|_| SubscriptionError::Closed),
        }
    }

    fn start(&self) -> Result<(), SubscriptionError> {
        match self.shared.state() {
            SubscriptionState::Closed => Err(SubscriptionError::Closed),
            SubscriptionState::Created => Err(SubscriptionError::NotReady),
            SubscriptionState::Started => Ok(()),
            SubscriptionState::Buffering => {
                if self.shared.transition(SubscriptionState::Buffering, SubscriptionState::Started) {
                    self.shared.start.notify_one();
                    Ok(())
                } else {
                    // Lost a race with close.
                    Err(SubscriptionError::Closed)
                }
            }
        }
    }

    fn listen(&self) -> Result<mpsc::Receiver<M>, SubscriptionError> {
        let receiver = self.outward.lock().take().ok_or(SubscriptionError::AlreadyListening)?;
        self.shared.listened.store(true, Ordering::SeqCst);
        Ok(receiver)
    }

    fn close(&self) {
        self.shared.state.store(SubscriptionState::Closed as u8, Ordering::SeqCst);
        // Never attached: drop the loop's channel ends here.
        self.parts.lock().take();
        self.cancel.cancel();
    }
}

/// Forward one message, giving up if the subscription is cancelled while
/// the outward queue is full.
async fn forward<M>(outward: &mpsc::Sender<M>, cancel: &CancellationToken, message: M) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = outward.send(message) => sent.is_ok(),
    }
}

async fn receive_loop<M: Send + 'static>(
    id: SubscriptionId,
    config: SubscriptionConfig,
    filter: Option<Filter<M>>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    parts: LoopParts<M>,
) {
    let LoopParts { mut inbound, outward } = parts;
    let mut pending: VecDeque<M> = VecDeque::new();
    let mut started = false;
    let deadline = tokio::time::sleep(config.start_deadline);
    tokio::pin!(deadline);
    // Inbound traffic does not extend it; only `listen` disarms it.
    let listen_by = tokio::time::sleep(config.idle_timeout);
    tokio::pin!(listen_by);

    let reason = 'receive: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'receive "cancelled",
            _ = shared.start.notified(), if !started => {
                started = true;
                tracing::debug!("Subscription {} started, flushing {} buffered", id, pending.len());
                while let Some(message) = pending.pop_front() {
                    if !forward(&outward, &cancel, message).await {
                        break 'receive "listener gone";
                    }
                }
            }
            _ = &mut deadline, if !started => break 'receive "not started before deadline",
            _ = &mut listen_by, if !shared.listened.load(Ordering::SeqCst) => {
                break 'receive "never listened";
            }
            message = inbound.recv(), if started || pending.len() < config.queue_capacity => {
                let Some(message) = message else {
                    break 'receive "publisher gone";
                };
                if let Some(filter) = &filter {
                    if !filter(&message) {
                        continue;
                    }
                }
                if !started {
                    pending.push_back(message);
                } else if !forward(&outward, &cancel, message).await {
                    break 'receive "listener gone";
                }
            }
        }
    };

    shared.state.store(SubscriptionState::Closed as u8, Ordering::SeqCst);
    cancel.cancel();
    if !pending.is_empty() {
        tracing::debug!("Subscription {} dropped {} undelivered messages", id, pending.len());
    }
    tracing::debug!("Subscription {} closed: {}", id, reason);
}
