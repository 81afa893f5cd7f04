//! Replicated session model
//!
//! A deterministic state machine over the shared, causally ordered event
//! log. Every participant runs an identical [`SessionModel`]; the only inputs
//! are log entries and model time, so all replicas publish the same
//! notifications in the same order without any negotiation.
//!
//! Operations never fail. Requests naming a view the model has never seen
//! are dropped, which absorbs races between departure and in-flight events.

pub mod events;
pub mod log;

pub use events::{ModelEvent, ModelNotification};
pub use log::{EventLog, LogEntry, Replica};

use crate::config::PresenceConfig;
use crate::types::{MediaIntent, PeerIdentity, Subscriptions, ViewId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

/// Model time in milliseconds, as stamped on log entries
pub type ModelTime = u64;

/// Tuning that affects model behaviour
///
/// Every replica must be built with the same settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub active_peer_debounce_ms: u64,
    pub mode_election_peer_count: usize,
    pub exited_peer_retention_ms: u64,
    pub peer_log_capacity: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self::from(&PresenceConfig::default())
    }
}

impl From<&PresenceConfig> for ModelSettings {
    fn from(config: &PresenceConfig) -> Self {
        Self {
            active_peer_debounce_ms: config.active_peer_debounce_ms,
            mode_election_peer_count: config.mode_election_peer_count,
            exited_peer_retention_ms: config.exited_peer_retention_ms,
            peer_log_capacity: config.peer_log_capacity,
        }
    }
}

/// Authoritative per-view record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerRecord {
    /// Assigned on first join, reused on every re-join
    pub peer_index: u64,
    pub identity: Option<PeerIdentity>,
    pub joined: bool,
    pub exit_time: Option<ModelTime>,
    pub raising_hand: bool,
    pub subscribed: Subscriptions,
}

impl PeerRecord {
    pub fn is_identified(&self) -> bool {
        self.identity.is_some()
    }
}

/// Deep copy of a record handed to clients (the `joined` flag is implied)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub view_id: ViewId,
    pub peer_index: u64,
    pub identity: Option<PeerIdentity>,
    pub raising_hand: bool,
    pub subscribed: Subscriptions,
}

/// Everything a (re)joining client needs to seed its local view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Identified peers, in display order
    pub peers: Vec<PeerSnapshot>,
    pub solo: bool,
    pub active_peer: Option<ViewId>,
}

/// Diagnostic log line collected from a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLogEntry {
    pub view_id: ViewId,
    pub time: ModelTime,
    pub text: String,
}

/// The replicated session model
#[derive(Debug, Clone)]
pub struct SessionModel {
    settings: ModelSettings,
    peers: BTreeMap<ViewId, PeerRecord>,
    next_peer_index: u64,
    solo: bool,
    active_peer: Option<ViewId>,
    last_active_publish: Option<ModelTime>,
    next_active_publish: Option<ModelTime>,
    peer_logs: VecDeque<PeerLogEntry>,
    now: ModelTime,
}

impl SessionModel {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            settings,
            peers: BTreeMap::new(),
            next_peer_index: 0,
            solo: true,
            active_peer: None,
            last_active_publish: None,
            next_active_publish: None,
            peer_logs: VecDeque::new(),
            now: 0,
        }
    }

    pub fn now(&self) -> ModelTime {
        self.now
    }

    pub fn solo(&self) -> bool {
        self.solo
    }

    pub fn active_peer(&self) -> Option<&ViewId> {
        self.active_peer.as_ref()
    }

    pub fn record(&self, view_id: &ViewId) -> Option<&PeerRecord> {
        self.peers.get(view_id)
    }

    /// Has the view ever been seen (and not yet swept)?
    pub fn has_peer(&self, view_id: &ViewId) -> bool {
        self.peers.contains_key(view_id)
    }

    /// Is the view currently in the session?
    pub fn has_joined_peer(&self, view_id: &ViewId) -> bool {
        self.peers.get(view_id).is_some_and(|p| p.joined)
    }

    /// Has the view supplied its identity?
    pub fn has_identified_peer(&self, view_id: &ViewId) -> bool {
        self.peers.get(view_id).is_some_and(PeerRecord::is_identified)
    }

    /// Identified peers, ordered by peer index
    pub fn identified_peers(&self) -> Vec<ViewId> {
        let mut ids: Vec<(&ViewId, u64)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_identified())
            .map(|(id, p)| (id, p.peer_index))
            .collect();
        ids.sort_by_key(|(_, index)| *index);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn peer_snapshot(&self, view_id: &ViewId) -> Option<PeerSnapshot> {
        self.peers.get(view_id).map(|peer| PeerSnapshot {
            view_id: view_id.clone(),
            peer_index: peer.peer_index,
            identity: peer.identity.clone(),
            raising_hand: peer.raising_hand,
            subscribed: peer.subscribed.clone(),
        })
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            peers: self
                .identified_peers()
                .iter()
                .filter_map(|id| self.peer_snapshot(id))
                .collect(),
            solo: self.solo,
            active_peer: self.active_peer.clone(),
        }
    }

    pub fn peer_logs(&self) -> impl Iterator<Item = &PeerLogEntry> {
        self.peer_logs.iter()
    }

    /// Model time of the pending active-peer publication, if any
    pub fn next_deadline(&self) -> Option<ModelTime> {
        self.next_active_publish
    }

    /// Move model time forward, firing any publication that falls due
    pub fn advance_to(&mut self, now: ModelTime) -> Vec<ModelNotification> {
        let mut out = Vec::new();
        if let Some(due) = self.next_active_publish {
            if due <= now {
                self.now = due.max(self.now);
                self.next_active_publish = None;
                self.last_active_publish = Some(self.now);
                out.push(ModelNotification::UpdateActivePeer {
                    view_id: self.active_peer.clone(),
                });
            }
        }
        self.now = self.now.max(now);
        out
    }

    /// Apply one event at model time `now`
    pub fn apply(&mut self, now: ModelTime, event: &ModelEvent) -> Vec<ModelNotification> {
        let mut out = self.advance_to(now);
        let produced = match event {
            ModelEvent::ViewJoin { view_id } => self.join(view_id),
            ModelEvent::ViewExit { view_id } => self.exit(view_id),
            ModelEvent::PeerDetails {
                view_id,
                identity,
                rejoining,
            } => self.set_identity(view_id, identity.clone(), *rejoining),
            ModelEvent::PeerIntendedState {
                view_id,
                audio,
                video,
            } => self.set_intended_state(view_id, *audio, *video),
            ModelEvent::PeerTrackSubscriptions {
                view_id,
                subscribed,
            } => self.set_track_subscriptions(view_id, subscribed.clone()),
            ModelEvent::SetSolo { solo } => self.request_mode(*solo),
            ModelEvent::PeerHand {
                view_id,
                raising_hand,
            } => self.set_hand_raised(view_id, *raising_hand),
            ModelEvent::SetActivePeer { view_id } => self.request_active_speaker(view_id),
            ModelEvent::RemoveActivePeer { view_id } => {
                self.clear_active_speaker_if_current(view_id)
            }
            ModelEvent::PeerLog { view_id, text } => self.submit_log(view_id, text),
        };
        out.extend(produced);
        out
    }

    /// A view joined the session
    pub fn join(&mut self, view_id: &ViewId) -> Vec<ModelNotification> {
        if !self.peers.contains_key(view_id) {
            let peer_index = self.next_peer_index;
            self.next_peer_index += 1;
            self.peers.insert(
                view_id.clone(),
                PeerRecord {
                    peer_index,
                    ..Default::default()
                },
            );
        } else if self.has_joined_peer(view_id) {
            warn!("View {} joined while already joined", view_id);
        }

        if let Some(peer) = self.peers.get_mut(view_id) {
            peer.joined = true;
            peer.exit_time = None;
        }

        // the first view back into a dormant session does the housekeeping
        let joined = self.peers.values().filter(|p| p.joined).count();
        if joined == 1 {
            self.clear_old_exited_peers();
        }

        Vec::new()
    }

    fn clear_old_exited_peers(&mut self) {
        let now = self.now;
        let retention = self.settings.exited_peer_retention_ms;
        self.peers.retain(|id, peer| match peer.exit_time {
            Some(exit) if now.saturating_sub(exit) > retention => {
                info!("Forgetting long-lost peer {}", id);
                false
            }
            _ => true,
        });
    }

    /// A view left the session; only its index and exit time survive
    pub fn exit(&mut self, view_id: &ViewId) -> Vec<ModelNotification> {
        let Some(peer) = self.peers.get_mut(view_id) else {
            debug!("Exit for unknown view {}", view_id);
            return Vec::new();
        };

        let was_identified = peer.is_identified();
        let was_raising_hand = peer.raising_hand;
        *peer = PeerRecord {
            peer_index: peer.peer_index,
            exit_time: Some(self.now),
            ..Default::default()
        };

        let mut out = Vec::new();
        if was_raising_hand {
            out.push(ModelNotification::OnPeerHand {
                view_id: view_id.clone(),
                raising_hand: false,
            });
        }
        out.push(ModelNotification::OnPeerExit {
            view_id: view_id.clone(),
        });

        if was_identified && self.identified_count() < self.settings.mode_election_peer_count {
            out.extend(self.request_mode(true));
        }
        out
    }

    fn identified_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_identified()).count()
    }

    /// A view supplied (or refreshed) its identity
    pub fn set_identity(
        &mut self,
        view_id: &ViewId,
        identity: PeerIdentity,
        rejoining: bool,
    ) -> Vec<ModelNotification> {
        let Some(peer) = self.peers.get_mut(view_id) else {
            warn!("No peer record to assign details for {}", view_id);
            return Vec::new();
        };
        peer.identity = Some(identity);

        let mut out = Vec::new();
        if let Some(snapshot) = self.peer_snapshot(view_id) {
            out.push(ModelNotification::OnPeerDetails { snapshot });
        }

        let count = self.identified_count();
        if count == self.settings.mode_election_peer_count {
            out.extend(self.request_mode(false));
            if !rejoining {
                out.extend(self.request_active_speaker(view_id));
            }
        } else if count == 1 {
            if !self.solo {
                info!("Ensuring solo mode for first peer");
            }
            out.extend(self.request_mode(true));
        }
        out
    }

    pub fn set_intended_state(
        &mut self,
        view_id: &ViewId,
        audio: MediaIntent,
        video: MediaIntent,
    ) -> Vec<ModelNotification> {
        if !self.has_identified_peer(view_id) {
            return Vec::new();
        }
        vec![ModelNotification::OnPeerIntendedState {
            view_id: view_id.clone(),
            audio,
            video,
        }]
    }

    pub fn set_track_subscriptions(
        &mut self,
        view_id: &ViewId,
        subscribed: Subscriptions,
    ) -> Vec<ModelNotification> {
        let Some(peer) = self.peers.get_mut(view_id) else {
            return Vec::new();
        };
        peer.subscribed = subscribed.clone();
        vec![ModelNotification::OnPeerTrackSubscriptions {
            view_id: view_id.clone(),
            subscribed,
        }]
    }

    pub fn set_hand_raised(&mut self, view_id: &ViewId, raising_hand: bool) -> Vec<ModelNotification> {
        let Some(peer) = self.peers.get_mut(view_id) else {
            return Vec::new();
        };
        peer.raising_hand = raising_hand;
        vec![ModelNotification::OnPeerHand {
            view_id: view_id.clone(),
            raising_hand,
        }]
    }

    /// Switch display mode; no notification when nothing changes
    pub fn request_mode(&mut self, solo: bool) -> Vec<ModelNotification> {
        if solo == self.solo {
            return Vec::new();
        }
        self.solo = solo;
        vec![ModelNotification::UpdateSolo { solo }]
    }

    /// Nominate an active speaker; publication is debounced
    pub fn request_active_speaker(&mut self, view_id: &ViewId) -> Vec<ModelNotification> {
        if !self.peers.contains_key(view_id) {
            return Vec::new();
        }
        self.active_peer = Some(view_id.clone());
        self.publish_active_peer()
    }

    /// Clear the active speaker, unless someone else was nominated meanwhile
    pub fn clear_active_speaker_if_current(&mut self, view_id: &ViewId) -> Vec<ModelNotification> {
        if self.active_peer.as_ref() != Some(view_id) {
            return Vec::new();
        }
        self.active_peer = None;
        self.publish_active_peer()
    }

    /// Publish the current active peer at most once per debounce interval.
    /// A request inside the interval schedules a single publication at the
    /// first eligible instant; later requests coalesce into it and the
    /// latest nomination is what gets published.
    fn publish_active_peer(&mut self) -> Vec<ModelNotification> {
        if self.next_active_publish.is_some() {
            return Vec::new();
        }

        if let Some(last) = self.last_active_publish {
            let eligible = last + self.settings.active_peer_debounce_ms;
            if self.now < eligible {
                self.next_active_publish = Some(eligible);
                return Vec::new();
            }
        }

        self.last_active_publish = Some(self.now);
        vec![ModelNotification::UpdateActivePeer {
            view_id: self.active_peer.clone(),
        }]
    }

    pub fn submit_log(&mut self, view_id: &ViewId, text: &str) -> Vec<ModelNotification> {
        let entry = PeerLogEntry {
            view_id: view_id.clone(),
            time: self.now,
            text: text.to_string(),
        };
        if self.settings.peer_log_capacity == 0 {
            return Vec::new();
        }
        while self.peer_logs.len() >= self.settings.peer_log_capacity {
            self.peer_logs.pop_front();
        }
        self.peer_logs.push_back(entry.clone());
        vec![ModelNotification::OnPeerLog { entry }]
    }
}

impl Default for SessionModel {
    fn default() -> Self {
        Self::new(ModelSettings::default())
    }
}
