//! Local peer presence table
//!
//! Per-client, non-replicated mirror of what the media transport is actually
//! doing for every known peer (including the local one). It runs ahead of or
//! behind the replicated model at times; that divergence is expected.
//!
//! Invariant, after every mutation: `published` is true exactly when at least
//! one media kind has a track that is present and enabled.

use crate::types::{same_track, MediaKind, TrackRef, ViewId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Shared handle to the table, owned by the coordinating client
pub type SharedPresenceTable = Arc<Mutex<PresenceTable>>;

/// Transport-side state of one peer
#[derive(Debug, Clone)]
pub struct LocalPeerState {
    audio_track: Option<TrackRef>,
    video_track: Option<TrackRef>,
    audio_disabled: bool,
    video_disabled: bool,
    published: bool,
    last_announce: Instant,
    left: bool,
}

impl LocalPeerState {
    fn new(now: Instant) -> Self {
        Self {
            audio_track: None,
            video_track: None,
            audio_disabled: true,
            video_disabled: true,
            published: false,
            last_announce: now,
            left: false,
        }
    }

    pub fn track(&self, kind: MediaKind) -> Option<&TrackRef> {
        match kind {
            MediaKind::Audio => self.audio_track.as_ref(),
            MediaKind::Video => self.video_track.as_ref(),
        }
    }

    pub fn is_disabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_disabled,
            MediaKind::Video => self.video_disabled,
        }
    }

    pub fn audio_disabled(&self) -> bool {
        self.audio_disabled
    }

    pub fn video_disabled(&self) -> bool {
        self.video_disabled
    }

    pub fn published(&self) -> bool {
        self.published
    }

    pub fn last_announce(&self) -> Instant {
        self.last_announce
    }

    /// Provisionally departed
    pub fn left(&self) -> bool {
        self.left
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<TrackRef> {
        match kind {
            MediaKind::Audio => &mut self.audio_track,
            MediaKind::Video => &mut self.video_track,
        }
    }

    fn set_disabled_flag(&mut self, kind: MediaKind, disabled: bool) {
        match kind {
            MediaKind::Audio => self.audio_disabled = disabled,
            MediaKind::Video => self.video_disabled = disabled,
        }
    }

    fn recompute_published(&mut self) {
        self.published = MediaKind::ALL
            .iter()
            .any(|&kind| self.track(kind).is_some() && !self.is_disabled(kind));
    }
}

/// Result of [`PresenceTable::register_track`]
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    /// The same track was already installed
    Unchanged,
    /// Track installed; a different track previously in the slot is returned
    Installed { evicted: Option<TrackRef> },
}

/// Map of every known peer's transport state
#[derive(Debug)]
pub struct PresenceTable {
    local: ViewId,
    peers: HashMap<ViewId, LocalPeerState>,
}

impl PresenceTable {
    /// Create a table holding just the local peer
    pub fn new(local: ViewId) -> Self {
        let mut table = Self {
            local,
            peers: HashMap::new(),
        };
        let local = table.local.clone();
        table.ensure(&local);
        table
    }

    pub fn shared(local: ViewId) -> SharedPresenceTable {
        Arc::new(Mutex::new(Self::new(local)))
    }

    pub fn local_id(&self) -> &ViewId {
        &self.local
    }

    /// Idempotent creation
    pub fn ensure(&mut self, view_id: &ViewId) -> &mut LocalPeerState {
        self.peers
            .entry(view_id.clone())
            .or_insert_with(|| LocalPeerState::new(Instant::now()))
    }

    pub fn get(&self, view_id: &ViewId) -> Option<&LocalPeerState> {
        self.peers.get(view_id)
    }

    pub fn local(&self) -> Option<&LocalPeerState> {
        self.peers.get(&self.local)
    }

    /// Present and not provisionally departed
    pub fn is_known(&self, view_id: &ViewId) -> bool {
        self.peers.get(view_id).is_some_and(|state| !state.left)
    }

    pub fn mark_announce(&mut self, view_id: &ViewId, now: Instant) {
        self.ensure(view_id).last_announce = now;
    }

    /// Returns true if the flag changed
    pub fn mark_left(&mut self, view_id: &ViewId) -> bool {
        match self.peers.get_mut(view_id) {
            Some(state) if !state.left => {
                state.left = true;
                true
            }
            _ => false,
        }
    }

    pub fn clear_left(&mut self, view_id: &ViewId) {
        self.ensure(view_id).left = false;
    }

    /// Install a live track for a remote peer
    ///
    /// At most one track per kind per peer: a different track already in
    /// the slot is evicted and handed back so its consumers can be detached.
    pub fn register_track(
        &mut self,
        view_id: &ViewId,
        kind: MediaKind,
        track: TrackRef,
    ) -> RegisterOutcome {
        let state = self.ensure(view_id);
        state.left = false;

        let already = state
            .track(kind)
            .is_some_and(|known| same_track(known, &track));
        if already && !state.is_disabled(kind) {
            return RegisterOutcome::Unchanged;
        }

        let evicted = state.slot_mut(kind).replace(track).filter(|_| !already);
        state.set_disabled_flag(kind, false);
        state.recompute_published();
        debug!("Registered {} track for {}", kind, view_id);

        RegisterOutcome::Installed { evicted }
    }

    /// Clear a slot; `left` is untouched
    pub fn unregister_track(&mut self, view_id: &ViewId, kind: MediaKind) -> Option<TrackRef> {
        let state = self.peers.get_mut(view_id)?;
        let removed = state.slot_mut(kind).take();
        state.set_disabled_flag(kind, true);
        state.recompute_published();
        removed
    }

    /// Remove every track of a peer that is going away
    pub fn clear_tracks(&mut self, view_id: &ViewId) -> Vec<(MediaKind, TrackRef)> {
        let Some(state) = self.peers.get_mut(view_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for kind in MediaKind::ALL {
            if let Some(track) = state.slot_mut(kind).take() {
                removed.push((kind, track));
            }
            state.set_disabled_flag(kind, true);
        }
        state.recompute_published();
        removed
    }

    /// Swap the local peer's track without touching its enabled flag
    pub fn attach_local_track(&mut self, kind: MediaKind, track: TrackRef) -> Option<TrackRef> {
        let local = self.local.clone();
        let state = self.ensure(&local);
        let previous = state.slot_mut(kind).replace(track);
        state.recompute_published();
        previous
    }

    /// Record the actual enabled state of a local track
    pub fn set_local_disabled(&mut self, kind: MediaKind, disabled: bool) {
        let local = self.local.clone();
        let state = self.ensure(&local);
        state.set_disabled_flag(kind, disabled);
        state.recompute_published();
    }

    pub fn remove(&mut self, view_id: &ViewId) -> Option<LocalPeerState> {
        self.peers.remove(view_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ViewId> {
        self.peers.keys()
    }

    pub fn remote_ids(&self) -> Vec<ViewId> {
        self.peers
            .keys()
            .filter(|id| **id != self.local)
            .cloned()
            .collect()
    }

    /// Drop all remote state ahead of a transport reconnection
    ///
    /// The local entry keeps its tracks and enabled flags but is marked
    /// departed until the transport reports it connected again. Returns the
    /// remote tracks that were dropped.
    pub fn rebuild(&mut self) -> Vec<(ViewId, MediaKind, TrackRef)> {
        let mut dropped = Vec::new();
        for view_id in self.remote_ids() {
            if let Some(mut state) = self.peers.remove(&view_id) {
                for kind in MediaKind::ALL {
                    if let Some(track) = state.slot_mut(kind).take() {
                        dropped.push((view_id.clone(), kind, track));
                    }
                }
            }
        }
        let local = self.local.clone();
        self.ensure(&local).left = true;
        dropped
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaTrack;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct StubTrack {
        id: String,
        kind: MediaKind,
    }

    #[async_trait]
    impl MediaTrack for StubTrack {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> MediaKind {
            self.kind
        }

        async fn set_enabled(&self, _enabled: bool) -> crate::Result<()> {
            Ok(())
        }

        async fn set_muted(&self, _muted: bool) -> crate::Result<()> {
            Ok(())
        }
    }

    fn track(id: &str, kind: MediaKind) -> TrackRef {
        Arc::new(StubTrack {
            id: id.to_string(),
            kind,
        })
    }

    fn assert_invariant(state: &LocalPeerState) {
        let expected = MediaKind::ALL
            .iter()
            .any(|&k| state.track(k).is_some() && !state.is_disabled(k));
        assert_eq!(state.published(), expected);
    }

    #[test]
    fn test_new_table_has_local_peer() {
        let table = PresenceTable::new(ViewId::new("me"));
        assert!(table.is_known(&ViewId::new("me")));
        assert!(!table.local().unwrap().published());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_register_same_track_twice_is_noop() {
        let mut table = PresenceTable::new(ViewId::new("me"));
        let peer = ViewId::new("p");
        let t = track("t1", MediaKind::Audio);

        assert!(matches!(
            table.register_track(&peer, MediaKind::Audio, t.clone()),
            RegisterOutcome::Installed { evicted: None }
        ));
        assert!(matches!(
            table.register_track(&peer, MediaKind::Audio, t),
            RegisterOutcome::Unchanged
        ));
        let state = table.get(&peer).unwrap();
        assert!(state.published());
        assert!(!state.audio_disabled());
        assert_invariant(state);
    }

    #[test]
    fn test_register_different_track_evicts_old() {
        let mut table = PresenceTable::new(ViewId::new("me"));
        let peer = ViewId::new("p");
        table.register_track(&peer, MediaKind::Video, track("t1", MediaKind::Video));

        match table.register_track(&peer, MediaKind::Video, track("t2", MediaKind::Video)) {
            RegisterOutcome::Installed { evicted: Some(old) } => assert_eq!(old.id(), "t1"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(
            table.get(&peer).unwrap().track(MediaKind::Video).unwrap().id(),
            "t2"
        );
    }

    #[test]
    fn test_register_clears_left() {
        let mut table = PresenceTable::new(ViewId::new("me"));
        let peer = ViewId::new("p");
        table.ensure(&peer);
        assert!(table.mark_left(&peer));
        assert!(!table.mark_left(&peer));
        assert!(!table.is_known(&peer));

        table.register_track(&peer, MediaKind::Audio, track("t1", MediaKind::Audio));
        assert!(table.is_known(&peer));
    }

    #[test]
    fn test_unregister_recomputes_published() {
        let mut table = PresenceTable::new(ViewId::new("me"));
        let peer = ViewId::new("p");
        table.register_track(&peer, MediaKind::Audio, track("a", MediaKind::Audio));
        table.register_track(&peer, MediaKind::Video, track("v", MediaKind::Video));

        table.unregister_track(&peer, MediaKind::Audio);
        let state = table.get(&peer).unwrap();
        assert!(state.published());
        assert!(state.audio_disabled());
        assert_invariant(state);

        table.unregister_track(&peer, MediaKind::Video);
        table.mark_left(&peer);
        table.unregister_track(&peer, MediaKind::Video);
        let state = table.get(&peer).unwrap();
        assert!(!state.published());
        assert!(state.left());
        assert_invariant(state);
    }

    #[test]
    fn test_local_track_flags() {
        let mut table = PresenceTable::new(ViewId::new("me"));
        table.attach_local_track(MediaKind::Audio, track("mic", MediaKind::Audio));
        assert!(!table.local().unwrap().published());

        table.set_local_disabled(MediaKind::Audio, false);
        assert!(table.local().unwrap().published());

        let previous = table.attach_local_track(MediaKind::Audio, track("mic2", MediaKind::Audio));
        assert_eq!(previous.unwrap().id(), "mic");
        let local = table.local().unwrap();
        assert!(local.published());
        assert_invariant(local);

        table.set_local_disabled(MediaKind::Audio, true);
        assert_invariant(table.local().unwrap());
        assert!(!table.local().unwrap().published());
    }

    #[test]
    fn test_clear_tracks_returns_all() {
        let mut table = PresenceTable::new(ViewId::new("me"));
        let peer = ViewId::new("p");
        table.register_track(&peer, MediaKind::Audio, track("a", MediaKind::Audio));
        table.register_track(&peer, MediaKind::Video, track("v", MediaKind::Video));

        let removed = table.clear_tracks(&peer);
        assert_eq!(removed.len(), 2);
        let state = table.get(&peer).unwrap();
        assert!(!state.published());
        assert!(state.audio_disabled() && state.video_disabled());
    }

    #[test]
    fn test_rebuild_keeps_local_only() {
        let mut table = PresenceTable::new(ViewId::new("me"));
        table.attach_local_track(MediaKind::Video, track("cam", MediaKind::Video));
        table.set_local_disabled(MediaKind::Video, false);
        table.register_track(&ViewId::new("p"), MediaKind::Audio, track("a", MediaKind::Audio));
        table.ensure(&ViewId::new("q"));

        let dropped = table.rebuild();
        assert_eq!(dropped.len(), 1);
        assert_eq!(table.len(), 1);
        let local = table.local().unwrap();
        assert!(local.left());
        assert!(local.published());
        assert!(local.track(MediaKind::Video).is_some());
    }
}
