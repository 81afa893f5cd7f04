//! Per-client coordinator
//!
//! Owns the presence table and both track controllers, consumes replicated
//! model notifications and media transport events, and runs the periodic
//! loops (watchdog, active-speaker poll, intent announcements). Everything
//! it knows about other peers comes from those two streams; the transport
//! is ground truth for rendering, the model for membership and mode.

use super::link::{ModelLink, ModelTransport};
use crate::arbiter::{ArbiterInputs, AudioLevelSource, PeerAudio, SpeakerArbiter};
use crate::config::PresenceConfig;
use crate::media::{
    ConnectionState, LeaveReason, LocalMediaController, MediaTransport, RemoteTrackController,
    TransportEvent,
};
use crate::model::{ModelEvent, ModelNotification, ModelSnapshot, PeerLogEntry, PeerSnapshot};
use crate::presence::{PresenceTable, SharedPresenceTable};
use crate::render::{RenderEvent, RenderSink};
use crate::types::{MediaKind, PeerIdentity, Subscriptions, TrackRef, ViewId};
use crate::watchdog::{AnnounceSchedule, IntendedState, LivenessWatchdog, PeerCheckTicket, Reconciler};
use crate::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// External services a coordinator talks to
pub struct Collaborators {
    pub transport: Arc<dyn MediaTransport>,
    pub model: Arc<dyn ModelTransport>,
    pub render: Arc<dyn RenderSink>,
    pub levels: Arc<dyn AudioLevelSource>,
}

#[derive(Debug, Clone)]
struct KnownPeer {
    snapshot: PeerSnapshot,
    /// Gone from the model, still on the transport
    offline: bool,
}

struct ClientState {
    peers: BTreeMap<ViewId, KnownPeer>,
    identity: Option<PeerIdentity>,
    solo: bool,
    displayed_active: Option<ViewId>,
    reconciler: Reconciler,
    arbiter: SpeakerArbiter,
    foreground: bool,
    raising_hand: bool,
    attending: bool,
    transport_joined: bool,
    last_own_announce: Option<Instant>,
    watchdog_loop: Option<CancellationToken>,
    settled_loops: Option<CancellationToken>,
    alone_timer: Option<CancellationToken>,
}

impl ClientState {
    fn new(config: &PresenceConfig) -> Self {
        Self {
            peers: BTreeMap::new(),
            identity: None,
            solo: true,
            displayed_active: None,
            reconciler: Reconciler::new(config),
            arbiter: SpeakerArbiter::new(config),
            foreground: true,
            raising_hand: false,
            attending: false,
            transport_joined: false,
            last_own_announce: None,
            watchdog_loop: None,
            settled_loops: None,
            alone_timer: None,
        }
    }

    fn stop_connected_loops(&mut self) {
        for token in [self.watchdog_loop.take(), self.settled_loops.take()]
            .into_iter()
            .flatten()
        {
            token.cancel();
        }
        self.attending = false;
    }

    fn cancel_alone_timer(&mut self) {
        if let Some(token) = self.alone_timer.take() {
            token.cancel();
        }
    }
}

struct Inner {
    config: PresenceConfig,
    local: ViewId,
    transport: Arc<dyn MediaTransport>,
    link: Arc<ModelLink>,
    render: Arc<dyn RenderSink>,
    levels: Arc<dyn AudioLevelSource>,
    table: SharedPresenceTable,
    remote: RemoteTrackController,
    local_media: LocalMediaController,
    watchdog: LivenessWatchdog,
    schedule: AnnounceSchedule,
    state: Mutex<ClientState>,
    connection_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

/// Presence and media reconciliation for one participant
#[derive(Clone)]
pub struct PresenceCoordinator {
    inner: Arc<Inner>,
}

impl PresenceCoordinator {
    /// Build a coordinator for the local view `local`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn new(config: PresenceConfig, local: ViewId, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            transport,
            model,
            render,
            levels,
        } = collaborators;

        let shutdown = CancellationToken::new();
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Disconnected);
        let table = PresenceTable::shared(local.clone());
        let link = Arc::new(
            ModelLink::new(config.session_scope.clone(), local.clone(), model)
                .with_send_timeout(config.model_send_timeout()),
        );
        let remote = RemoteTrackController::new(
            &config,
            transport.clone(),
            table.clone(),
            render.clone(),
            link.clone(),
            shutdown.child_token(),
        );
        let local_media = LocalMediaController::new(
            &config,
            transport.clone(),
            table.clone(),
            render.clone(),
            connection_rx,
            shutdown.child_token(),
        );

        info!("Presence coordinator created for {}", local);

        Ok(Self {
            inner: Arc::new(Inner {
                watchdog: LivenessWatchdog::new(&config),
                schedule: AnnounceSchedule::new(&config),
                state: Mutex::new(ClientState::new(&config)),
                config,
                local,
                transport,
                link,
                render,
                levels,
                table,
                remote,
                local_media,
                connection_tx,
                shutdown,
            }),
        })
    }

    pub fn local_id(&self) -> &ViewId {
        &self.inner.local
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.inner.config
    }

    pub fn table(&self) -> SharedPresenceTable {
        self.inner.table.clone()
    }

    pub fn remote_tracks(&self) -> &RemoteTrackController {
        &self.inner.remote
    }

    pub fn local_media(&self) -> &LocalMediaController {
        &self.inner.local_media
    }

    pub fn link(&self) -> &ModelLink {
        &self.inner.link
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_tx.borrow()
    }

    pub fn solo(&self) -> bool {
        self.inner.state.lock().solo
    }

    /// The active peer this client is currently rendering
    pub fn displayed_active_peer(&self) -> Option<ViewId> {
        self.inner.state.lock().displayed_active.clone()
    }

    /// Known peers (the local one included), in display order
    pub fn known_peers(&self) -> Vec<ViewId> {
        let state = self.inner.state.lock();
        let mut peers: Vec<&KnownPeer> = state.peers.values().collect();
        peers.sort_by_key(|p| p.snapshot.peer_index);
        peers.iter().map(|p| p.snapshot.view_id.clone()).collect()
    }

    pub fn is_peer_known(&self, view_id: &ViewId) -> bool {
        self.inner.state.lock().peers.contains_key(view_id)
    }

    pub fn is_peer_offline(&self, view_id: &ViewId) -> bool {
        self.inner
            .state
            .lock()
            .peers
            .get(view_id)
            .is_some_and(|p| p.offline)
    }

    pub fn has_mismatch(&self, view_id: &ViewId) -> bool {
        self.inner.state.lock().reconciler.mismatch(view_id)
    }

    pub fn is_attending(&self) -> bool {
        self.inner.state.lock().attending
    }

    pub fn is_transport_joined(&self) -> bool {
        self.inner.state.lock().transport_joined
    }

    /// Publish this client's identity into the model
    pub async fn announce_identity(&self, identity: PeerIdentity, rejoining: bool) -> Result<()> {
        self.inner.state.lock().identity = Some(identity.clone());
        self.inner
            .link
            .publish(ModelEvent::PeerDetails {
                view_id: self.inner.local.clone(),
                identity,
                rejoining,
            })
            .await
    }

    /// Seed (or re-sync) local peer state from a model snapshot
    pub async fn seed_from_model(&self, snapshot: ModelSnapshot) {
        self.inner.seed_from_model(snapshot).await;
    }

    /// The model connection came back: flush, repair, re-sync
    pub async fn attach_model(&self, snapshot: ModelSnapshot) -> Result<()> {
        let inner = &self.inner;
        let reconnecting = inner.state.lock().peers.contains_key(&inner.local);

        inner.link.reattach().await?;

        if reconnecting {
            inner.repair_own_record(&snapshot).await?;
        }
        inner.seed_from_model(snapshot).await;
        Ok(())
    }

    /// The model connection was lost; outgoing events queue until reattached
    pub fn detach_model(&self) {
        self.inner.link.detach();
    }

    pub async fn set_local_track(&self, kind: MediaKind, track: TrackRef) -> Result<()> {
        self.inner.local_media.set_track(kind, track).await
    }

    pub async fn set_audio_muted(&self, muted: bool) -> Result<()> {
        self.inner.local_media.set_muted(MediaKind::Audio, muted).await
    }

    pub async fn set_video_muted(&self, muted: bool) -> Result<()> {
        self.inner.local_media.set_muted(MediaKind::Video, muted).await
    }

    pub fn set_media_unavailable(&self, kind: MediaKind) {
        self.inner.local_media.set_unavailable(kind);
    }

    pub async fn replace_audio_source(&self, track: TrackRef) -> Result<()> {
        self.inner
            .local_media
            .replace_source(MediaKind::Audio, track)
            .await
    }

    pub async fn set_hand_raised(&self, raising_hand: bool) -> Result<()> {
        self.inner.state.lock().raising_hand = raising_hand;
        self.inner
            .link
            .publish(ModelEvent::PeerHand {
                view_id: self.inner.local.clone(),
                raising_hand,
            })
            .await
    }

    /// Ask the model to switch display mode
    pub async fn request_mode(&self, solo: bool) -> Result<()> {
        self.inner.link.publish(ModelEvent::SetSolo { solo }).await
    }

    /// Whether the client is visible; a background client never nominates itself
    pub fn set_foreground(&self, foreground: bool) {
        self.inner.state.lock().foreground = foreground;
    }

    pub async fn submit_log(&self, text: impl Into<String>) -> Result<()> {
        self.inner
            .link
            .publish(ModelEvent::PeerLog {
                view_id: self.inner.local.clone(),
                text: text.into(),
            })
            .await
    }

    pub async fn handle_notification(&self, notification: ModelNotification) {
        self.inner.handle_notification(notification).await;
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        self.inner.handle_transport_event(event).await;
    }

    /// Drive the coordinator from the two inbound streams until shutdown
    pub fn spawn_event_loop(
        &self,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut notifications: mpsc::UnboundedReceiver<ModelNotification>,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        debug!("Coordinator event loop shutting down");
                        break;
                    }
                    Some(event) = transport_events.recv() => {
                        inner.handle_transport_event(event).await;
                    }
                    Some(notification) = notifications.recv() => {
                        inner.handle_notification(notification).await;
                    }
                    else => break,
                }
            }
        })
    }

    /// Stop every timer, drop remote tracks and leave the transport
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        info!("Shutting down presence coordinator for {}", inner.local);

        let was_joined = {
            let mut state = inner.state.lock();
            state.stop_connected_loops();
            state.cancel_alone_timer();
            state.reconciler.clear();
            std::mem::replace(&mut state.transport_joined, false)
        };
        inner.shutdown.cancel();
        inner.remote.cancel_all();

        let remote_ids = inner.table.lock().remote_ids();
        for view_id in remote_ids {
            inner.remote.drop_peer(&view_id).await;
            inner.table.lock().remove(&view_id);
        }

        if was_joined {
            inner.transport.leave().await?;
        }
        Ok(())
    }
}

impl Inner {
    fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    async fn handle_notification(self: &Arc<Self>, notification: ModelNotification) {
        match notification {
            ModelNotification::OnPeerDetails { snapshot } => {
                self.set_peer_state_from_model(snapshot).await;
            }
            ModelNotification::OnPeerExit { view_id } => self.on_peer_exit(&view_id).await,
            ModelNotification::OnPeerIntendedState {
                view_id,
                audio,
                video,
            } => self.on_peer_intended_state(&view_id, IntendedState { audio, video }),
            ModelNotification::OnPeerTrackSubscriptions {
                view_id,
                subscribed,
            } => self.on_peer_track_subscriptions(&view_id, subscribed),
            ModelNotification::UpdateSolo { solo } => self.on_update_solo(solo),
            ModelNotification::UpdateActivePeer { view_id } => {
                self.on_update_active_peer(view_id);
            }
            ModelNotification::OnPeerHand {
                view_id,
                raising_hand,
            } => self.on_peer_hand(&view_id, raising_hand),
            ModelNotification::OnPeerLog { entry } => on_peer_log(&entry),
        }
    }

    async fn seed_from_model(self: &Arc<Self>, snapshot: ModelSnapshot) {
        let listed: Vec<ViewId> = snapshot.peers.iter().map(|p| p.view_id.clone()).collect();
        for peer in snapshot.peers {
            self.set_peer_state_from_model(peer).await;
        }

        // removing after adding avoids a spurious drop into solo mode
        let stale: Vec<ViewId> = self
            .state
            .lock()
            .peers
            .keys()
            .filter(|id| **id != self.local && !listed.contains(id))
            .cloned()
            .collect();
        for view_id in stale {
            self.remove_peer(&view_id).await;
        }

        self.on_update_solo(snapshot.solo);
        if self.peer_count() >= self.config.mode_election_peer_count {
            self.set_displayed_active(snapshot.active_peer);
        } else {
            self.set_default_active_peer();
        }
    }

    async fn repair_own_record(&self, snapshot: &ModelSnapshot) -> Result<()> {
        let own = snapshot.peers.iter().find(|p| p.view_id == self.local);
        let (identity, raising_hand) = {
            let state = self.state.lock();
            (state.identity.clone(), state.raising_hand)
        };

        match own {
            None => {
                if let Some(identity) = identity {
                    info!("Own record missing from model; re-announcing identity");
                    self.link
                        .publish(ModelEvent::PeerDetails {
                            view_id: self.local.clone(),
                            identity,
                            rejoining: true,
                        })
                        .await?;
                }
            }
            Some(record) => {
                if record.raising_hand != raising_hand {
                    self.link
                        .publish(ModelEvent::PeerHand {
                            view_id: self.local.clone(),
                            raising_hand,
                        })
                        .await?;
                }
            }
        }

        self.link.publish_track_subscriptions().await?;
        self.announce_intended_state(Instant::now()).await
    }

    async fn set_peer_state_from_model(self: &Arc<Self>, snapshot: PeerSnapshot) {
        let view_id = snapshot.view_id.clone();
        let raising_hand = snapshot.raising_hand;
        let was_known = {
            let mut state = self.state.lock();
            if view_id == self.local {
                state.raising_hand = raising_hand;
            }
            state
                .peers
                .insert(
                    view_id.clone(),
                    KnownPeer {
                        snapshot: snapshot.clone(),
                        offline: false,
                    },
                )
                .is_some()
        };

        if was_known {
            self.render.notify(RenderEvent::PeerOfflineChanged {
                view_id: view_id.clone(),
                offline: false,
            });
            self.render.notify(RenderEvent::HandRaisedChanged {
                view_id,
                raising_hand,
            });
            return;
        }

        debug!("Adding peer {}", view_id);
        self.render.notify(RenderEvent::PeerAdded { snapshot });
        if raising_hand {
            self.render.notify(RenderEvent::HandRaisedChanged {
                view_id,
                raising_hand,
            });
        }

        let count = self.peer_count();
        if count >= 2 {
            self.ensure_transport_joined().await;
        }
        if count < self.config.mode_election_peer_count {
            self.set_default_active_peer();
        }
    }

    async fn on_peer_exit(self: &Arc<Self>, view_id: &ViewId) {
        if *view_id == self.local {
            warn!("Model reported exit of the local view; ignoring");
            return;
        }

        if self.table.lock().is_known(view_id) {
            warn!("Peer {} left the model; marked offline", view_id);
            let marked = {
                let mut state = self.state.lock();
                match state.peers.get_mut(view_id) {
                    Some(peer) => {
                        peer.offline = true;
                        true
                    }
                    None => false,
                }
            };
            if marked {
                self.render.notify(RenderEvent::PeerOfflineChanged {
                    view_id: view_id.clone(),
                    offline: true,
                });
            }
        } else {
            debug!("Peer {} left the model; removed", view_id);
            self.remove_peer(view_id).await;
        }
    }

    /// Remove a peer the transport no longer knows, if the model agrees
    async fn provisionally_remove_peer(self: &Arc<Self>, view_id: &ViewId) {
        let offline = self
            .state
            .lock()
            .peers
            .get(view_id)
            .is_some_and(|p| p.offline);
        if offline {
            self.remove_peer(view_id).await;
        }
    }

    async fn remove_peer(self: &Arc<Self>, view_id: &ViewId) {
        let removed = {
            let mut state = self.state.lock();
            state.reconciler.forget(view_id);
            state.peers.remove(view_id)
        };
        if let Some(peer) = &removed {
            if peer.snapshot.raising_hand {
                self.render.notify(RenderEvent::HandRaisedChanged {
                    view_id: view_id.clone(),
                    raising_hand: false,
                });
            }
            self.render.notify(RenderEvent::PeerRemoved {
                view_id: view_id.clone(),
            });
        }

        self.remote.drop_peer(view_id).await;
        self.table.lock().remove(view_id);

        let (count, was_active) = {
            let mut state = self.state.lock();
            state.cancel_alone_timer();
            (
                state.peers.len(),
                state.displayed_active.as_ref() == Some(view_id),
            )
        };

        if count == 1 {
            self.schedule_alone_disconnect();
        }

        if count < self.config.mode_election_peer_count {
            if let Err(e) = self.link.publish(ModelEvent::SetSolo { solo: true }).await {
                warn!("Could not petition for solo mode: {}", e);
            }
            self.set_default_active_peer();
        } else if was_active {
            // the model only clears it if nobody else was nominated meanwhile
            if let Err(e) = self
                .link
                .publish(ModelEvent::RemoveActivePeer {
                    view_id: view_id.clone(),
                })
                .await
            {
                warn!("Could not clear departed active peer: {}", e);
            }
        }
    }

    fn set_default_active_peer(&self) {
        let default = {
            let state = self.state.lock();
            match state.peers.len() {
                1 => Some(None),
                2 => Some(state.peers.keys().find(|id| **id != self.local).cloned()),
                _ => None,
            }
        };
        if let Some(active) = default {
            self.set_displayed_active(active);
        }
    }

    fn set_displayed_active(&self, active: Option<ViewId>) {
        {
            let mut state = self.state.lock();
            if let Some(id) = &active {
                if !state.peers.contains_key(id) {
                    error!("Active peer {} is not known", id);
                    return;
                }
            }
            if state.displayed_active == active {
                return;
            }
            state.displayed_active = active.clone();
        }
        info!(
            "Active peer now {}",
            active.as_ref().map_or("none", ViewId::as_str)
        );
        self.render
            .notify(RenderEvent::ActivePeerChanged { view_id: active });
    }

    fn on_update_active_peer(&self, active: Option<ViewId>) {
        // below the election count the default active peer rules
        if self.peer_count() >= self.config.mode_election_peer_count {
            self.set_displayed_active(active);
        }
    }

    fn on_update_solo(&self, solo: bool) {
        {
            let mut state = self.state.lock();
            if state.solo == solo {
                return;
            }
            state.solo = solo;
        }
        info!("Display mode now {}", if solo { "solo" } else { "group" });
        self.render.notify(RenderEvent::ModeChanged { solo });
    }

    fn on_peer_hand(&self, view_id: &ViewId, raising_hand: bool) {
        {
            let mut state = self.state.lock();
            if *view_id == self.local {
                state.raising_hand = raising_hand;
            }
            match state.peers.get_mut(view_id) {
                Some(peer) => peer.snapshot.raising_hand = raising_hand,
                None => return,
            }
        }
        self.render.notify(RenderEvent::HandRaisedChanged {
            view_id: view_id.clone(),
            raising_hand,
        });
    }

    fn on_peer_track_subscriptions(&self, view_id: &ViewId, subscribed: Subscriptions) {
        if *view_id != self.local {
            let sending = self.local_media.is_sending();
            if sending && !subscribed.contains_key(&self.local) {
                debug!("{} reports receiving nothing from this client", view_id);
            }
        }
        if let Some(peer) = self.state.lock().peers.get_mut(view_id) {
            peer.snapshot.subscribed = subscribed;
        }
    }

    fn on_peer_intended_state(self: &Arc<Self>, view_id: &ViewId, intended: IntendedState) {
        if *view_id == self.local {
            return;
        }
        let now = Instant::now();
        // any announcement keeps the peer alive for the watchdog
        self.table.lock().mark_announce(view_id, now);

        let ticket = {
            let mut state = self.state.lock();
            if !state.attending {
                return;
            }
            state.reconciler.admit(view_id, now, &self.shutdown)
        };
        let Some(ticket) = ticket else {
            return;
        };

        let this = self.clone();
        let delay = self.config.intended_state_defer();
        tokio::spawn(async move {
            tokio::select! {
                _ = ticket.token.cancelled() => {
                    trace!("Intended-state check for {} dropped", ticket.view_id);
                }
                _ = tokio::time::sleep(delay) => {
                    this.check_intended_state(&ticket, intended);
                }
            }
        });
    }

    fn check_intended_state(&self, ticket: &PeerCheckTicket, intended: IntendedState) {
        let view_id = &ticket.view_id;
        let mut state = self.state.lock();
        if !state.reconciler.complete(ticket) {
            return;
        }

        let mismatch = {
            let table = self.table.lock();
            if !table.is_known(view_id) {
                return;
            }
            let Some(observed) = table.get(view_id) else {
                return;
            };
            Reconciler::compare(view_id, intended, observed)
        };

        if state.reconciler.record_mismatch(view_id, mismatch) {
            drop(state);
            self.render.notify(RenderEvent::MismatchFlagChanged {
                view_id: view_id.clone(),
                mismatch,
            });
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChange {
                current,
                previous,
                reason,
            } => {
                info!(
                    "Transport connection {} -> {}{}",
                    previous,
                    current,
                    reason.map(|r| format!(" ({})", r)).unwrap_or_default()
                );
                self.connection_tx.send_replace(current);
                match current {
                    ConnectionState::Connected => self.on_transport_connected(),
                    ConnectionState::Disconnected => self.on_transport_disconnected().await,
                    _ => {}
                }
            }
            TransportEvent::UserPublished { peer, kind } => {
                self.state.lock().reconciler.postpone(&peer, Instant::now());
                self.remote.on_user_published(&peer, kind);
            }
            TransportEvent::UserUnpublished { peer, kind } => {
                self.state.lock().reconciler.postpone(&peer, Instant::now());
                self.remote.on_user_unpublished(&peer, kind).await;
            }
            TransportEvent::UserLeft { peer, reason } => {
                info!("Peer {} left the transport: {:?}", peer, reason);
                if self.table.lock().get(&peer).is_none() {
                    warn!("Leaving peer {} has no transport record", peer);
                    return;
                }
                self.remote.drop_peer(&peer).await;
                if reason != LeaveReason::BecomeAudience {
                    self.table.lock().mark_left(&peer);
                    self.provisionally_remove_peer(&peer).await;
                }
            }
            TransportEvent::NetworkQuality(quality) => {
                if quality.is_degraded() {
                    warn!(
                        "Network quality uplink={} downlink={}",
                        quality.uplink, quality.downlink
                    );
                } else {
                    trace!("Network quality {:?}", quality);
                }
            }
            TransportEvent::Exception {
                code,
                message,
                peer,
            } => {
                warn!(
                    "Transport exception {} ({}) for {}",
                    code,
                    message,
                    peer.as_ref().map_or("-", ViewId::as_str)
                );
            }
        }
    }

    fn on_transport_connected(self: &Arc<Self>) {
        // re-applying intent may wait on the transport; the event loop must not
        self.local_media.on_connected();
        let media = self.local_media.clone();
        tokio::spawn(async move { media.restore_intent().await });

        let (watchdog_token, settle_token) = {
            let mut state = self.state.lock();
            state.stop_connected_loops();
            let watchdog_token = self.shutdown.child_token();
            let settle_token = self.shutdown.child_token();
            state.watchdog_loop = Some(watchdog_token.clone());
            state.settled_loops = Some(settle_token.clone());
            (watchdog_token, settle_token)
        };

        self.spawn_watchdog_loop(watchdog_token);

        let this = self.clone();
        let settle = self.config.settle_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = settle_token.cancelled() => {}
                _ = tokio::time::sleep(settle) => {
                    debug!("Transport settled; starting arbitration and announcements");
                    this.state.lock().attending = true;
                    this.spawn_arbiter_loop(settle_token.clone());
                    this.spawn_announce_loop(settle_token);
                }
            }
        });
    }

    async fn on_transport_disconnected(self: &Arc<Self>) {
        self.state.lock().stop_connected_loops();
        self.local_media.on_disconnected();
        self.remote.cancel_all();

        let dropped = self.table.lock().rebuild();
        let mut forgot = false;
        for (view_id, kind, _) in dropped {
            self.render.notify(RenderEvent::TrackDetached {
                view_id: view_id.clone(),
                kind,
            });
            forgot |= self.link.forget_subscription(&view_id, kind);
        }
        if forgot {
            if let Err(e) = self.link.publish_track_subscriptions().await {
                debug!("Could not announce track subscriptions: {}", e);
            }
        }
    }

    async fn ensure_transport_joined(&self) {
        let join = {
            let mut state = self.state.lock();
            state.cancel_alone_timer();
            !std::mem::replace(&mut state.transport_joined, true)
        };
        if !join {
            return;
        }
        info!("Joining transport channel {}", self.config.channel);
        if let Err(e) = self.transport.join(&self.config.channel, &self.local).await {
            error!("Joining transport channel failed: {}", e);
            self.state.lock().transport_joined = false;
        }
    }

    fn schedule_alone_disconnect(self: &Arc<Self>) {
        let token = self.shutdown.child_token();
        {
            let mut state = self.state.lock();
            if !state.transport_joined {
                return;
            }
            state.cancel_alone_timer();
            state.alone_timer = Some(token.clone());
        }

        let this = self.clone();
        let delay = self.config.alone_disconnect_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let leave = {
                        let mut state = this.state.lock();
                        state.alone_timer = None;
                        if state.peers.len() > 1 {
                            false
                        } else {
                            std::mem::replace(&mut state.transport_joined, false)
                        }
                    };
                    if leave {
                        info!("Alone in the session; leaving transport channel");
                        if let Err(e) = this.transport.leave().await {
                            warn!("Leaving transport channel failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    fn spawn_watchdog_loop(self: &Arc<Self>, token: CancellationToken) {
        let this = self.clone();
        let period = self.config.watchdog_interval();
        tokio::spawn(async move {
            let mut ticks = ticker(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        let stalled = {
                            let mut table = this.table.lock();
                            this.watchdog.sweep(&mut table, Instant::now())
                        };
                        for view_id in stalled {
                            this.remote.drop_peer(&view_id).await;
                            this.provisionally_remove_peer(&view_id).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_arbiter_loop(self: &Arc<Self>, token: CancellationToken) {
        let this = self.clone();
        let period = self.config.arbiter_poll_interval();
        tokio::spawn(async move {
            let mut ticks = ticker(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => this.poll_for_active_peer().await,
                }
            }
        });
    }

    fn spawn_announce_loop(self: &Arc<Self>, token: CancellationToken) {
        let this = self.clone();
        let period = self.schedule.interval();
        tokio::spawn(async move {
            let mut ticks = ticker(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if this.link.is_offline() {
                            continue;
                        }
                        let published = this.local_media.is_sending();
                        let last = this.state.lock().last_own_announce;
                        let now = Instant::now();
                        if this.schedule.due(published, last, now) {
                            if let Err(e) = this.announce_intended_state(now).await {
                                debug!("Intended-state announcement failed: {}", e);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn announce_intended_state(&self, now: Instant) -> Result<()> {
        self.state.lock().last_own_announce = Some(now);
        self.table.lock().mark_announce(&self.local, now);
        self.link
            .publish(ModelEvent::PeerIntendedState {
                view_id: self.local.clone(),
                audio: self.local_media.intent(MediaKind::Audio),
                video: self.local_media.intent(MediaKind::Video),
            })
            .await
    }

    fn arbiter_inputs(&self) -> ArbiterInputs {
        let sending = self.local_media.is_sending();
        let online = self.connection_tx.borrow().is_connected() && !self.link.is_offline();
        let state = self.state.lock();
        let table = self.table.lock();

        let peers = state
            .peers
            .keys()
            .map(|view_id| {
                let observed = table.get(view_id);
                PeerAudio {
                    view_id: view_id.clone(),
                    published: if *view_id == self.local {
                        sending
                    } else {
                        observed.is_some_and(|s| s.published())
                    },
                    audio_disabled: observed.map_or(true, |s| s.audio_disabled()),
                }
            })
            .collect();

        ArbiterInputs {
            local_id: self.local.clone(),
            online,
            foreground: state.foreground,
            peers,
            displayed_active: state.displayed_active.clone(),
            audio_level: self.levels.level(),
        }
    }

    async fn poll_for_active_peer(&self) {
        let inputs = self.arbiter_inputs();
        let now = Instant::now();
        let nomination = {
            let mut state = self.state.lock();
            let nomination = state.arbiter.evaluate(&inputs, now);
            if nomination.is_some() {
                state.arbiter.record_request(now);
            }
            nomination
        };
        let Some(nomination) = nomination else {
            return;
        };

        info!("Requesting to be active: {}", nomination);
        if let Err(e) = self
            .link
            .publish(ModelEvent::SetActivePeer {
                view_id: self.local.clone(),
            })
            .await
        {
            warn!("Active-peer request failed: {}", e);
        }
    }
}

fn on_peer_log(entry: &PeerLogEntry) {
    debug!("[{} @{}] {}", entry.view_id, entry.time, entry.text);
}

/// Interval whose first tick is one period away
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
