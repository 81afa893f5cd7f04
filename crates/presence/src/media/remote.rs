//! Subscribe/retry state machine for remote tracks
//!
//! One slot per (peer, kind): `Unpublished -> Subscribing -> Subscribed`,
//! back to `Unpublished` on an explicit unpublish. A failed or inconclusive
//! subscribe schedules a single retry; a newer publish or an unpublish
//! supersedes it. Each slot carries a generation so that a stale attempt
//! finishing late can never install a track.

use super::transport::{MediaTransport, SubscribeOutcome};
use crate::config::PresenceConfig;
use crate::presence::{RegisterOutcome, SharedPresenceTable};
use crate::render::{RenderEvent, RenderSink};
use crate::session::link::ModelLink;
use crate::types::{MediaKind, TrackRef, ViewId};
use crate::Error;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle phase of one remote track slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackPhase {
    #[default]
    Unpublished,
    Subscribing,
    Subscribed,
}

#[derive(Debug, Default)]
struct TrackSlot {
    phase: TrackPhase,
    generation: u64,
    retry: Option<CancellationToken>,
    attempts: u32,
    retries_scheduled: u32,
}

impl TrackSlot {
    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
    }
}

type SlotKey = (ViewId, MediaKind);

struct RemoteInner {
    retry_delay: Duration,
    subscribe_timeout: Duration,
    transport: Arc<dyn MediaTransport>,
    table: SharedPresenceTable,
    render: Arc<dyn RenderSink>,
    link: Arc<ModelLink>,
    slots: Mutex<HashMap<SlotKey, TrackSlot>>,
    // shared by all slots so a recreated slot never reuses a generation
    generations: AtomicU64,
    shutdown: CancellationToken,
}

/// Drives subscriptions to every remote peer's tracks
#[derive(Clone)]
pub struct RemoteTrackController {
    inner: Arc<RemoteInner>,
}

impl RemoteTrackController {
    pub fn new(
        config: &PresenceConfig,
        transport: Arc<dyn MediaTransport>,
        table: SharedPresenceTable,
        render: Arc<dyn RenderSink>,
        link: Arc<ModelLink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                retry_delay: config.subscribe_retry_delay(),
                subscribe_timeout: config.subscribe_timeout(),
                transport,
                table,
                render,
                link,
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    /// The transport announced a remote track
    ///
    /// Cancels any pending retry for the slot and starts a fresh attempt in
    /// the background.
    pub fn on_user_published(&self, peer: &ViewId, kind: MediaKind) {
        self.inner.table.lock().clear_left(peer);

        let generation = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry((peer.clone(), kind)).or_default();
            slot.cancel_retry();
            slot.generation = self.inner.next_generation();
            slot.phase = TrackPhase::Subscribing;
            slot.generation
        };

        debug!("{} published {}; subscribing", peer, kind);
        let attempt = self.inner.clone().attempt(peer.clone(), kind, generation);
        tokio::spawn(attempt);
    }

    /// The transport withdrew a remote track
    pub async fn on_user_unpublished(&self, peer: &ViewId, kind: MediaKind) {
        {
            let mut slots = self.inner.slots.lock();
            if let Some(slot) = slots.get_mut(&(peer.clone(), kind)) {
                slot.cancel_retry();
                slot.generation = self.inner.next_generation();
                slot.phase = TrackPhase::Unpublished;
            }
        }

        let removed = self.inner.table.lock().unregister_track(peer, kind);
        if removed.is_none() {
            warn!("No {} track to unsubscribe for {}", kind, peer);
            self.inner.announce_subscriptions().await;
            return;
        }

        if let Err(e) = self.inner.transport.unsubscribe(peer, kind).await {
            debug!("Unsubscribe {} from {} failed: {}", kind, peer, e);
        }
        self.inner.render.notify(RenderEvent::TrackDetached {
            view_id: peer.clone(),
            kind,
        });
        if self.inner.link.forget_subscription(peer, kind) {
            self.inner.announce_subscriptions().await;
        }
    }

    /// Cancel timers and drop every track of a peer that is going away
    pub async fn drop_peer(&self, peer: &ViewId) {
        self.cancel_peer(peer);

        let removed = self.inner.table.lock().clear_tracks(peer);
        for (kind, _) in removed {
            self.inner.render.notify(RenderEvent::TrackDetached {
                view_id: peer.clone(),
                kind,
            });
        }
        if self.inner.link.forget_peer_subscriptions(peer) {
            self.inner.announce_subscriptions().await;
        }
    }

    /// Supersede any attempt or retry for the peer
    pub fn cancel_peer(&self, peer: &ViewId) {
        let mut slots = self.inner.slots.lock();
        for kind in MediaKind::ALL {
            if let Some(mut slot) = slots.remove(&(peer.clone(), kind)) {
                slot.cancel_retry();
            }
        }
    }

    pub fn cancel_all(&self) {
        let mut slots = self.inner.slots.lock();
        for slot in slots.values_mut() {
            slot.cancel_retry();
        }
        slots.clear();
    }

    pub fn phase(&self, peer: &ViewId, kind: MediaKind) -> TrackPhase {
        self.inner
            .slots
            .lock()
            .get(&(peer.clone(), kind))
            .map(|slot| slot.phase)
            .unwrap_or_default()
    }

    pub fn pending_retry(&self, peer: &ViewId, kind: MediaKind) -> bool {
        self.inner
            .slots
            .lock()
            .get(&(peer.clone(), kind))
            .is_some_and(|slot| slot.retry.is_some())
    }

    pub fn retries_scheduled(&self, peer: &ViewId, kind: MediaKind) -> u32 {
        self.inner
            .slots
            .lock()
            .get(&(peer.clone(), kind))
            .map_or(0, |slot| slot.retries_scheduled)
    }

    pub fn attempts(&self, peer: &ViewId, kind: MediaKind) -> u32 {
        self.inner
            .slots
            .lock()
            .get(&(peer.clone(), kind))
            .map_or(0, |slot| slot.attempts)
    }
}

impl RemoteInner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn is_current(&self, peer: &ViewId, kind: MediaKind, generation: u64) -> bool {
        self.slots
            .lock()
            .get(&(peer.clone(), kind))
            .is_some_and(|slot| slot.generation == generation)
    }

    fn update_slot(
        &self,
        peer: &ViewId,
        kind: MediaKind,
        generation: u64,
        update: impl FnOnce(&mut TrackSlot),
    ) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&(peer.clone(), kind)) {
            if slot.generation == generation {
                update(slot);
            }
        }
    }

    // boxed: a retry re-enters this function from a spawned task
    fn attempt(self: Arc<Self>, peer: ViewId, kind: MediaKind, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            {
                let mut slots = self.slots.lock();
                match slots.get_mut(&(peer.clone(), kind)) {
                    Some(slot) if slot.generation == generation => slot.attempts += 1,
                    _ => return,
                }
            }

            let outcome = tokio::time::timeout(
                self.subscribe_timeout,
                self.transport.subscribe(&peer, kind),
            )
            .await
            .unwrap_or_else(|_| {
                Err(Error::OperationTimeout(format!(
                    "subscribe to {} {} still pending after {:?}",
                    peer, kind, self.subscribe_timeout
                )))
            });

            if !self.is_current(&peer, kind, generation) {
                debug!("Subscribe to {} {} superseded", peer, kind);
                return;
            }

            match outcome {
                Ok(SubscribeOutcome::Track(track)) => {
                    self.install(&peer, kind, generation, track).await;
                }
                Ok(SubscribeOutcome::Vanished) => {
                    warn!("Subscribed to {} {} but the track is gone", peer, kind);
                    self.mark_unpublished(&peer, kind, generation);
                }
                Ok(SubscribeOutcome::Inconclusive) => {
                    warn!("Subscribe to {} {} was inconclusive", peer, kind);
                    self.schedule_retry(&peer, kind, generation);
                    self.announce_subscriptions().await;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Subscribe to {} {} failed: {}", peer, kind, e);
                    self.schedule_retry(&peer, kind, generation);
                    self.announce_subscriptions().await;
                }
                Err(e) if e.is_benign_race() => {
                    debug!("Subscribe to {} {} raced its departure: {}", peer, kind, e);
                    self.mark_unpublished(&peer, kind, generation);
                }
                Err(e) => {
                    warn!("Giving up on {} {}: {}", peer, kind, e);
                    self.mark_unpublished(&peer, kind, generation);
                    self.announce_subscriptions().await;
                }
            }
        }
        .boxed()
    }

    fn mark_unpublished(&self, peer: &ViewId, kind: MediaKind, generation: u64) {
        self.update_slot(peer, kind, generation, |slot| {
            slot.phase = TrackPhase::Unpublished;
        });
    }

    fn schedule_retry(self: &Arc<Self>, peer: &ViewId, kind: MediaKind, generation: u64) {
        let token = self.shutdown.child_token();
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&(peer.clone(), kind)) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            slot.cancel_retry();
            slot.retry = Some(token.clone());
            slot.retries_scheduled += 1;
        }

        info!(
            "Retrying {} subscribe for {} in {:?}",
            kind, peer, self.retry_delay
        );
        let this = self.clone();
        let peer = peer.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Retry for {} {} cancelled", peer, kind);
                }
                _ = tokio::time::sleep(delay) => {
                    this.update_slot(&peer, kind, generation, |slot| slot.retry = None);
                    this.attempt(peer, kind, generation).await;
                }
            }
        });
    }

    async fn install(&self, peer: &ViewId, kind: MediaKind, generation: u64, track: TrackRef) {
        let outcome = self.table.lock().register_track(peer, kind, track.clone());
        self.update_slot(peer, kind, generation, |slot| {
            slot.phase = TrackPhase::Subscribed;
        });

        match outcome {
            RegisterOutcome::Unchanged => {
                debug!("{} {} track already registered", peer, kind);
            }
            RegisterOutcome::Installed { evicted } => {
                if evicted.is_some() {
                    self.render.notify(RenderEvent::TrackDetached {
                        view_id: peer.clone(),
                        kind,
                    });
                }
                self.render.notify(RenderEvent::TrackAttached {
                    view_id: peer.clone(),
                    kind,
                    track,
                });
                info!("Subscribed to {} {}", peer, kind);
            }
        }

        if self.link.record_subscription(peer, kind) {
            self.announce_subscriptions().await;
        }
    }

    async fn announce_subscriptions(&self) {
        if let Err(e) = self.link.publish_track_subscriptions().await {
            debug!("Could not announce track subscriptions: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::transport::SubscribeOutcome;
    use crate::presence::PresenceTable;
    use crate::render::NullRenderer;
    use crate::session::link::ModelTransport;
    use crate::types::MediaTrack;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;

    #[derive(Debug)]
    struct FakeTrack(String, MediaKind);

    #[async_trait]
    impl MediaTrack for FakeTrack {
        fn id(&self) -> &str {
            &self.0
        }
        fn kind(&self) -> MediaKind {
            self.1
        }
        async fn set_enabled(&self, _enabled: bool) -> Result<()> {
            Ok(())
        }
        async fn set_muted(&self, _muted: bool) -> Result<()> {
            Ok(())
        }
    }

    enum Step {
        Fail,
        Vanish,
        Gone,
        Hang,
        Succeed(&'static str),
    }

    #[derive(Default)]
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
    }

    #[async_trait]
    impl MediaTransport for Scripted {
        async fn join(&self, _channel: &str, _id: &ViewId) -> Result<()> {
            Ok(())
        }
        async fn leave(&self) -> Result<()> {
            Ok(())
        }
        async fn publish(&self, _track: TrackRef) -> Result<()> {
            Ok(())
        }
        async fn unpublish(&self, _track: TrackRef) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _peer: &ViewId, kind: MediaKind) -> Result<SubscribeOutcome> {
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Fail) | None => Err(Error::SubscribeFailed("no answer".to_string())),
                Some(Step::Vanish) => Ok(SubscribeOutcome::Vanished),
                Some(Step::Gone) => Err(Error::UnknownPeer("not in channel".to_string())),
                Some(Step::Hang) => std::future::pending().await,
                Some(Step::Succeed(id)) => Ok(SubscribeOutcome::Track(Arc::new(FakeTrack(
                    id.to_string(),
                    kind,
                )))),
            }
        }
        async fn unsubscribe(&self, _peer: &ViewId, _kind: MediaKind) -> Result<()> {
            Ok(())
        }
    }

    /// Model transport that keeps the names of everything sent
    #[derive(Default)]
    struct Sink {
        sent: Mutex<Vec<String>>,
    }

    impl Sink {
        fn count(&self, name: &str) -> usize {
            self.sent.lock().iter().filter(|n| *n == name).count()
        }
    }

    #[async_trait]
    impl ModelTransport for Sink {
        async fn publish(&self, _scope: &str, name: &str, _payload: Value) -> Result<()> {
            self.sent.lock().push(name.to_string());
            Ok(())
        }
    }

    fn build(steps: Vec<Step>) -> (RemoteTrackController, SharedPresenceTable, Arc<ModelLink>, Arc<Sink>) {
        let transport = Arc::new(Scripted {
            steps: Mutex::new(steps.into()),
        });
        let table = PresenceTable::shared(ViewId::new("me"));
        let sink = Arc::new(Sink::default());
        let link = Arc::new(ModelLink::new("s", ViewId::new("me"), sink.clone()));
        let controller = RemoteTrackController::new(
            &PresenceConfig::default(),
            transport,
            table.clone(),
            Arc::new(NullRenderer),
            link.clone(),
            CancellationToken::new(),
        );
        (controller, table, link, sink)
    }

    fn controller(steps: Vec<Step>) -> (RemoteTrackController, SharedPresenceTable) {
        let (controller, table, _, _) = build(steps);
        (controller, table)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_subscribed() {
        let (controller, table) = controller(vec![Step::Fail, Step::Fail, Step::Succeed("c-mic")]);
        let peer = ViewId::new("c");

        controller.on_user_published(&peer, MediaKind::Audio);
        settle().await;
        assert!(controller.pending_retry(&peer, MediaKind::Audio));
        assert_eq!(controller.retries_scheduled(&peer, MediaKind::Audio), 1);

        tokio::time::advance(Duration::from_millis(2_000)).await;
        settle().await;
        assert_eq!(controller.retries_scheduled(&peer, MediaKind::Audio), 2);
        assert_eq!(controller.phase(&peer, MediaKind::Audio), TrackPhase::Subscribing);

        tokio::time::advance(Duration::from_millis(2_000)).await;
        settle().await;
        assert_eq!(controller.phase(&peer, MediaKind::Audio), TrackPhase::Subscribed);
        assert!(!controller.pending_retry(&peer, MediaKind::Audio));
        assert_eq!(controller.attempts(&peer, MediaKind::Audio), 3);
        assert!(table.lock().get(&peer).unwrap().published());
    }

    #[tokio::test(start_paused = true)]
    async fn test_republish_cancels_pending_retry() {
        let (controller, _table) = controller(vec![Step::Fail, Step::Succeed("v1")]);
        let peer = ViewId::new("d");

        controller.on_user_published(&peer, MediaKind::Video);
        settle().await;
        assert!(controller.pending_retry(&peer, MediaKind::Video));

        controller.on_user_published(&peer, MediaKind::Video);
        settle().await;
        assert!(!controller.pending_retry(&peer, MediaKind::Video));
        assert_eq!(controller.phase(&peer, MediaKind::Video), TrackPhase::Subscribed);

        // the cancelled retry never fires a third subscribe
        tokio::time::advance(Duration::from_millis(5_000)).await;
        settle().await;
        assert_eq!(controller.attempts(&peer, MediaKind::Video), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_track_is_noop() {
        let (controller, table) = controller(vec![Step::Vanish]);
        let peer = ViewId::new("e");

        controller.on_user_published(&peer, MediaKind::Audio);
        settle().await;
        assert_eq!(controller.phase(&peer, MediaKind::Audio), TrackPhase::Unpublished);
        assert!(!controller.pending_retry(&peer, MediaKind::Audio));
        assert!(!table.lock().get(&peer).unwrap().published());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpublish_without_track_is_benign() {
        let (controller, table) = controller(vec![Step::Fail]);
        let peer = ViewId::new("f");

        controller.on_user_published(&peer, MediaKind::Audio);
        settle().await;
        controller.on_user_unpublished(&peer, MediaKind::Audio).await;
        assert!(!controller.pending_retry(&peer, MediaKind::Audio));
        assert_eq!(controller.phase(&peer, MediaKind::Audio), TrackPhase::Unpublished);
        assert!(table.lock().is_known(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_failed_attempt_announces_subscriptions() {
        let (controller, _table, link, sink) = build(vec![Step::Fail, Step::Fail, Step::Succeed("g-mic")]);
        link.reattach().await.unwrap();
        let peer = ViewId::new("g");

        controller.on_user_published(&peer, MediaKind::Audio);
        settle().await;
        assert_eq!(sink.count("peer-track-subscriptions"), 1);

        tokio::time::advance(Duration::from_millis(2_000)).await;
        settle().await;
        assert_eq!(sink.count("peer-track-subscriptions"), 2);
        assert!(!link.subscriptions().contains_key(&peer));

        // the success announces the new subscription once more
        tokio::time::advance(Duration::from_millis(2_000)).await;
        settle().await;
        assert_eq!(controller.phase(&peer, MediaKind::Audio), TrackPhase::Subscribed);
        assert_eq!(sink.count("peer-track-subscriptions"), 3);
        assert!(link.subscriptions()[&peer].contains(&MediaKind::Audio));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_subscribe_times_out_into_retry() {
        let (controller, _table, link, sink) = build(vec![Step::Hang, Step::Succeed("h-cam")]);
        link.reattach().await.unwrap();
        let peer = ViewId::new("h");

        controller.on_user_published(&peer, MediaKind::Video);
        settle().await;
        assert!(!controller.pending_retry(&peer, MediaKind::Video));

        tokio::time::advance(Duration::from_millis(10_000)).await;
        settle().await;
        assert!(controller.pending_retry(&peer, MediaKind::Video));
        assert_eq!(sink.count("peer-track-subscriptions"), 1);

        tokio::time::advance(Duration::from_millis(2_000)).await;
        settle().await;
        assert_eq!(controller.phase(&peer, MediaKind::Video), TrackPhase::Subscribed);
        assert_eq!(controller.attempts(&peer, MediaKind::Video), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_peer_is_not_retried() {
        let (controller, table) = controller(vec![Step::Gone]);
        let peer = ViewId::new("i");

        controller.on_user_published(&peer, MediaKind::Audio);
        settle().await;
        assert_eq!(controller.phase(&peer, MediaKind::Audio), TrackPhase::Unpublished);
        assert!(!controller.pending_retry(&peer, MediaKind::Audio));
        assert_eq!(controller.retries_scheduled(&peer, MediaKind::Audio), 0);
        assert!(!table.lock().get(&peer).unwrap().published());
    }
}
