//! Outgoing side of the replicated model connection
//!
//! Every event joins one queue in arrival order and is sent from its head,
//! so a detached link queues without waiting on a send still in flight.
//! Reattaching drains the queue in that same order before going live. A
//! send that fails or outlasts the send timeout takes the link offline and
//! keeps the event at the head of the queue.

use crate::model::ModelEvent;
use crate::types::{MediaKind, Subscriptions, ViewId};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishing half of the replicated-model framework
///
/// Delivery back to subscribers is the framework's business; every replica
/// hands the resulting notifications to its own coordinator.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn publish(&self, scope: &str, event_name: &str, payload: Value) -> Result<()>;
}

#[derive(Debug, Default)]
struct LinkState {
    attached: bool,
    deferred: VecDeque<ModelEvent>,
    subscriptions: Subscriptions,
}

/// Queueing publisher bound to one session scope
pub struct ModelLink {
    scope: String,
    local: ViewId,
    transport: Arc<dyn ModelTransport>,
    send_timeout: Duration,
    state: Mutex<LinkState>,
    // one sender drains the queue at a time; held across the publish await
    send_lock: tokio::sync::Mutex<()>,
}

impl ModelLink {
    /// Create a link; it starts detached
    pub fn new(scope: impl Into<String>, local: ViewId, transport: Arc<dyn ModelTransport>) -> Self {
        Self {
            scope: scope.into(),
            local,
            transport,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            state: Mutex::new(LinkState::default()),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn local_id(&self) -> &ViewId {
        &self.local
    }

    pub fn is_offline(&self) -> bool {
        !self.state.lock().attached
    }

    pub fn queued(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Publish now if attached, otherwise queue
    ///
    /// Never fails: an event that cannot be sent stays queued for the next
    /// reattach.
    pub async fn publish(&self, event: ModelEvent) -> Result<()> {
        {
            let mut state = self.state.lock();
            let attached = state.attached;
            if !attached {
                debug!("Model offline; deferring {}", event.name());
            }
            state.deferred.push_back(event);
            if !attached {
                return Ok(());
            }
        }

        let _send = self.send_lock.lock().await;
        while let Some(event) = self.next_live() {
            if let Err(e) = self.send(&event).await {
                warn!("Publishing {} failed, going offline: {}", event.name(), e);
                let mut state = self.state.lock();
                state.attached = false;
                state.deferred.push_front(event);
                break;
            }
        }
        Ok(())
    }

    // head of the queue, only while attached
    fn next_live(&self) -> Option<ModelEvent> {
        let mut state = self.state.lock();
        if !state.attached {
            return None;
        }
        state.deferred.pop_front()
    }

    async fn send(&self, event: &ModelEvent) -> Result<()> {
        let (name, payload) = event.encode()?;
        match tokio::time::timeout(
            self.send_timeout,
            self.transport.publish(&self.scope, name, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout(format!(
                "{} not acknowledged after {:?}",
                name, self.send_timeout
            ))),
        }
    }

    /// Stop sending; later events queue up
    pub fn detach(&self) {
        let mut state = self.state.lock();
        if state.attached {
            info!("Replicated model detached");
        }
        state.attached = false;
    }

    /// Flush the queue in order, then go live
    ///
    /// On failure the unsent event goes back to the head of the queue and
    /// the link stays detached.
    pub async fn reattach(&self) -> Result<usize> {
        let _send = self.send_lock.lock().await;
        let mut flushed = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.deferred.pop_front() {
                    Some(event) => event,
                    None => {
                        // empty queue and live flag change together
                        state.attached = true;
                        break;
                    }
                }
            };
            if let Err(e) = self.send(&next).await {
                self.state.lock().deferred.push_front(next);
                return Err(Error::ModelOffline(format!(
                    "flush stopped after {} events: {}",
                    flushed, e
                )));
            }
            flushed += 1;
        }
        info!("Replicated model attached; flushed {} deferred events", flushed);
        Ok(flushed)
    }

    /// This client now receives `kind` from `peer`; true if that is new
    pub fn record_subscription(&self, peer: &ViewId, kind: MediaKind) -> bool {
        self.state
            .lock()
            .subscriptions
            .entry(peer.clone())
            .or_default()
            .insert(kind)
    }

    /// True if the entry existed
    pub fn forget_subscription(&self, peer: &ViewId, kind: MediaKind) -> bool {
        let mut state = self.state.lock();
        let Some(kinds) = state.subscriptions.get_mut(peer) else {
            return false;
        };
        let removed = kinds.remove(&kind);
        if kinds.is_empty() {
            state.subscriptions.remove(peer);
        }
        removed
    }

    pub fn forget_peer_subscriptions(&self, peer: &ViewId) -> bool {
        self.state.lock().subscriptions.remove(peer).is_some()
    }

    pub fn subscriptions(&self) -> Subscriptions {
        self.state.lock().subscriptions.clone()
    }

    /// Announce what this client currently receives
    pub async fn publish_track_subscriptions(&self) -> Result<()> {
        let subscribed = self.subscriptions();
        self.publish(ModelEvent::PeerTrackSubscriptions {
            view_id: self.local.clone(),
            subscribed,
        })
        .await
    }
}

impl std::fmt::Debug for ModelLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLink")
            .field("scope", &self.scope)
            .field("local", &self.local)
            .field("offline", &self.is_offline())
            .finish()
    }
}
