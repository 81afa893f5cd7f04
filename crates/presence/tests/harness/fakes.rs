//! Scripted stand-ins for the media transport, tracks and renderer

use async_trait::async_trait;
use parking_lot::Mutex;
use remotemedia_presence::{
    Error, MediaKind, MediaTrack, MediaTransport, RenderEvent, RenderSink, Result,
    SubscribeOutcome, TrackRef, ViewId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    pub enabled: AtomicBool,
    pub muted: AtomicBool,
}

#[async_trait]
impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<()> {
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }
}

pub fn track(id: &str, kind: MediaKind) -> TrackRef {
    Arc::new(FakeTrack {
        id: id.to_string(),
        kind,
        enabled: AtomicBool::new(true),
        muted: AtomicBool::new(false),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Join(String),
    Leave,
    Publish(String),
    Unpublish(String),
    Subscribe(ViewId, MediaKind),
    Unsubscribe(ViewId, MediaKind),
}

/// Media transport whose subscribe outcomes can be scripted per slot
///
/// Unscripted subscribes succeed with a track named `<peer>-<kind>`.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: Mutex<Vec<TransportCall>>,
    scripts: Mutex<HashMap<(ViewId, MediaKind), VecDeque<Result<SubscribeOutcome>>>>,
    stalled_publishes: AtomicBool,
}

impl ScriptedTransport {
    pub fn script(&self, peer: &ViewId, kind: MediaKind, outcomes: Vec<Result<SubscribeOutcome>>) {
        self.scripts
            .lock()
            .insert((peer.clone(), kind), outcomes.into_iter().collect());
    }

    /// Publishes from now on never complete
    pub fn stall_publishes(&self, stalled: bool) {
        self.stalled_publishes.store(stalled, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn subscribes(&self, peer: &ViewId, kind: MediaKind) -> usize {
        self.count(&TransportCall::Subscribe(peer.clone(), kind))
    }

    /// Whether the last join has not been followed by a leave
    pub fn is_joined(&self) -> bool {
        self.calls
            .lock()
            .iter()
            .rev()
            .find_map(|c| match c {
                TransportCall::Join(_) => Some(true),
                TransportCall::Leave => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }
}

pub fn failed(reason: &str) -> Result<SubscribeOutcome> {
    Err(Error::TransportError(reason.to_string()))
}

#[async_trait]
impl MediaTransport for ScriptedTransport {
    async fn join(&self, channel: &str, _id: &ViewId) -> Result<()> {
        self.calls.lock().push(TransportCall::Join(channel.to_string()));
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.calls.lock().push(TransportCall::Leave);
        Ok(())
    }

    async fn publish(&self, track: TrackRef) -> Result<()> {
        self.calls
            .lock()
            .push(TransportCall::Publish(track.id().to_string()));
        if self.stalled_publishes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn unpublish(&self, track: TrackRef) -> Result<()> {
        self.calls
            .lock()
            .push(TransportCall::Unpublish(track.id().to_string()));
        Ok(())
    }

    async fn subscribe(&self, peer: &ViewId, kind: MediaKind) -> Result<SubscribeOutcome> {
        self.calls
            .lock()
            .push(TransportCall::Subscribe(peer.clone(), kind));
        let scripted = self
            .scripts
            .lock()
            .get_mut(&(peer.clone(), kind))
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(SubscribeOutcome::Track(track(
                &format!("{}-{}", peer, kind),
                kind,
            )))
        })
    }

    async fn unsubscribe(&self, peer: &ViewId, kind: MediaKind) -> Result<()> {
        self.calls
            .lock()
            .push(TransportCall::Unsubscribe(peer.clone(), kind));
        Ok(())
    }
}

/// Render sink that keeps everything it is told
#[derive(Default)]
pub struct RecordingRenderer {
    events: Mutex<Vec<RenderEvent>>,
}

impl RecordingRenderer {
    pub fn events(&self) -> Vec<RenderEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn count(&self, predicate: impl Fn(&RenderEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl RenderSink for RecordingRenderer {
    fn notify(&self, event: RenderEvent) {
        self.events.lock().push(event);
    }
}
