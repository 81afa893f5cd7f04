//! Local media: intent versus publication
//!
//! A local track is published to the transport at most once per connection,
//! and only after the transport reports `Connected`. Mute and unmute after
//! that toggle the published track instead of republishing it. A publish
//! that fails or hangs past its timeout is retried after a fixed delay
//! until a mute, a source replacement or a disconnect supersedes it.

use super::transport::{ConnectionState, MediaTransport};
use crate::config::PresenceConfig;
use crate::presence::SharedPresenceTable;
use crate::render::{RenderEvent, RenderSink};
use crate::types::{MediaIntent, MediaKind, TrackRef};
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct LocalMedia {
    intent: HashMap<MediaKind, MediaIntent>,
    // id of the track currently published on the transport, per kind
    published: HashMap<MediaKind, String>,
    // claimed and awaiting the transport
    publishing: HashMap<MediaKind, String>,
    retries: HashMap<MediaKind, CancellationToken>,
    sending: bool,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self {
            intent: MediaKind::ALL
                .iter()
                .map(|&kind| (kind, MediaIntent::Unavailable))
                .collect(),
            published: HashMap::new(),
            publishing: HashMap::new(),
            retries: HashMap::new(),
            sending: false,
        }
    }
}

impl LocalMedia {
    fn wants(&self, kind: MediaKind) -> bool {
        self.intent.get(&kind) == Some(&MediaIntent::Unmuted)
    }

    fn cancel_retry(&mut self, kind: MediaKind) {
        if let Some(token) = self.retries.remove(&kind) {
            token.cancel();
        }
    }
}

struct LocalInner {
    publish_timeout: Duration,
    retry_delay: Duration,
    transport: Arc<dyn MediaTransport>,
    table: SharedPresenceTable,
    render: Arc<dyn RenderSink>,
    connection: watch::Receiver<ConnectionState>,
    state: Mutex<LocalMedia>,
    replace_guard: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

/// Drives this client's own tracks against the transport
#[derive(Clone)]
pub struct LocalMediaController {
    inner: Arc<LocalInner>,
}

impl LocalMediaController {
    pub fn new(
        config: &PresenceConfig,
        transport: Arc<dyn MediaTransport>,
        table: SharedPresenceTable,
        render: Arc<dyn RenderSink>,
        connection: watch::Receiver<ConnectionState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                publish_timeout: config.publish_timeout(),
                retry_delay: config.publish_retry_delay(),
                transport,
                table,
                render,
                connection,
                state: Mutex::new(LocalMedia::default()),
                replace_guard: tokio::sync::Mutex::new(()),
                shutdown,
            }),
        }
    }

    pub fn intent(&self, kind: MediaKind) -> MediaIntent {
        self.inner.intent(kind)
    }

    /// Whether a kind's current track is live on the transport
    pub fn is_published(&self, kind: MediaKind) -> bool {
        self.inner.is_published(kind)
    }

    /// At least one published track is enabled
    pub fn is_sending(&self) -> bool {
        self.inner.state.lock().sending
    }

    pub fn pending_retry(&self, kind: MediaKind) -> bool {
        self.inner.state.lock().retries.contains_key(&kind)
    }

    /// Install the capture track for a kind; starts muted until told otherwise
    pub async fn set_track(&self, kind: MediaKind, track: TrackRef) -> Result<()> {
        if track.kind() != kind {
            return Err(Error::InvalidState(format!(
                "{} track offered as {}",
                track.kind(),
                kind
            )));
        }
        let previous = self.inner.table.lock().attach_local_track(kind, track);
        if previous.is_some() {
            warn!("Local {} track replaced without unpublishing", kind);
        }
        let muted = self.inner.promote_available(kind).is_disabled();
        self.inner.ensure_mute_state(kind, muted).await
    }

    /// No input device for this kind
    pub fn set_unavailable(&self, kind: MediaKind) {
        let mut state = self.inner.state.lock();
        state.cancel_retry(kind);
        state.intent.insert(kind, MediaIntent::Unavailable);
    }

    /// Record intent and bring the transport in line with it
    pub async fn set_muted(&self, kind: MediaKind, muted: bool) -> Result<()> {
        if self.inner.current_track(kind).is_none() {
            debug!("No local {} track; {} stays unavailable", kind, kind);
            self.set_unavailable(kind);
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            state.cancel_retry(kind);
            state.intent.insert(kind, MediaIntent::from_muted(muted));
        }
        self.inner.ensure_mute_state(kind, muted).await
    }

    /// Swap the audio input source
    ///
    /// The old transport track is unpublished and the new one published in
    /// its place, keeping mute state and publication. Concurrent replacements
    /// run one after another; mute toggles never wait on them.
    pub async fn replace_source(&self, kind: MediaKind, track: TrackRef) -> Result<()> {
        if kind != MediaKind::Audio {
            return Err(Error::InvalidState(format!(
                "{} input cannot be replaced",
                kind
            )));
        }
        let inner = &self.inner;
        let _replacing = inner.replace_guard.lock().await;

        let was_published = inner.is_published(kind);
        let previous = inner.table.lock().attach_local_track(kind, track.clone());
        inner.state.lock().cancel_retry(kind);
        if was_published {
            inner.state.lock().published.remove(&kind);
            if let Some(old) = previous {
                if let Err(e) = inner.transport.unpublish(old).await {
                    warn!("Unpublishing replaced {} track failed: {}", kind, e);
                }
            }
        }

        let muted = inner.promote_available(kind).is_disabled();
        track.set_muted(muted).await?;
        inner.table.lock().set_local_disabled(kind, muted);

        if was_published {
            // a concurrent unmute may already have claimed the new track
            if inner.claim(kind, &track, false) {
                inner.publish_track(kind, track).await?;
            }
        } else if !muted {
            inner.ensure_mute_state(kind, false).await?;
        }
        inner.refresh_sending();
        Ok(())
    }

    /// Transport connected (first time or after a drop)
    ///
    /// Only clears this client's left mark; [`restore_intent`](Self::restore_intent)
    /// does the publishing.
    pub fn on_connected(&self) {
        let mut table = self.inner.table.lock();
        let local = table.local_id().clone();
        table.clear_left(&local);
    }

    /// Re-apply unmuted intent after a (re)connect
    pub async fn restore_intent(&self) {
        for kind in MediaKind::ALL {
            if self.intent(kind) == MediaIntent::Unmuted {
                if let Err(e) = self.inner.ensure_mute_state(kind, false).await {
                    warn!("Could not restore own {}: {}", kind, e);
                }
            }
        }
    }

    /// Transport dropped: tracks stay, publication must happen again
    pub fn on_disconnected(&self) {
        {
            let mut state = self.inner.state.lock();
            for (_, token) in state.retries.drain() {
                token.cancel();
            }
            state.published.clear();
            state.publishing.clear();
        }
        self.inner.refresh_sending();
    }
}

impl LocalInner {
    fn intent(&self, kind: MediaKind) -> MediaIntent {
        self.state
            .lock()
            .intent
            .get(&kind)
            .copied()
            .unwrap_or(MediaIntent::Unavailable)
    }

    fn is_published(&self, kind: MediaKind) -> bool {
        let Some(track) = self.current_track(kind) else {
            return false;
        };
        self.state.lock().published.get(&kind).map(String::as_str) == Some(track.id())
    }

    fn current_track(&self, kind: MediaKind) -> Option<TrackRef> {
        self.table
            .lock()
            .local()
            .and_then(|state| state.track(kind).cloned())
    }

    /// A track is present: `Unavailable` becomes `Muted`; returns the intent
    fn promote_available(&self, kind: MediaKind) -> MediaIntent {
        let mut state = self.state.lock();
        let intent = state.intent.entry(kind).or_insert(MediaIntent::Unavailable);
        if *intent == MediaIntent::Unavailable {
            *intent = MediaIntent::Muted;
        }
        *intent
    }

    /// Reserve `track` for publishing; false if it is published or already on its way
    ///
    /// With `require_unmuted` the claim also fails once intent is no longer unmuted.
    fn claim(&self, kind: MediaKind, track: &TrackRef, require_unmuted: bool) -> bool {
        let mut state = self.state.lock();
        if require_unmuted && !state.wants(kind) {
            return false;
        }
        let id = Some(track.id());
        if state.published.get(&kind).map(String::as_str) == id
            || state.publishing.get(&kind).map(String::as_str) == id
        {
            return false;
        }
        state.publishing.insert(kind, track.id().to_string());
        true
    }

    async fn ensure_mute_state(self: &Arc<Self>, kind: MediaKind, muted: bool) -> Result<()> {
        let Some(track) = self.current_track(kind) else {
            return Ok(());
        };

        match kind {
            MediaKind::Audio => track.set_muted(muted).await?,
            MediaKind::Video => track.set_enabled(!muted).await?,
        }
        self.table.lock().set_local_disabled(kind, muted);

        if !muted && !self.is_published(kind) {
            self.wait_connected().await?;

            // intent or track may have changed while waiting
            if let Some(track) = self.current_track(kind) {
                if self.claim(kind, &track, true) {
                    let published = self.publish_track(kind, track).await;
                    self.refresh_sending();
                    return published;
                }
            }
        }

        self.refresh_sending();
        Ok(())
    }

    async fn wait_connected(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let connected = tokio::select! {
            changed = connection.wait_for(ConnectionState::is_connected) => changed.is_ok(),
            _ = self.shutdown.cancelled() => false,
        };
        if connected {
            Ok(())
        } else {
            Err(Error::NotConnected(
                "transport connection closed before publishing".to_string(),
            ))
        }
    }

    /// Publish a track already claimed with [`claim`](Self::claim)
    async fn publish_track(self: &Arc<Self>, kind: MediaKind, track: TrackRef) -> Result<()> {
        let id = track.id().to_string();
        let outcome = tokio::time::timeout(self.publish_timeout, self.transport.publish(track))
            .await
            .unwrap_or_else(|_| {
                Err(Error::OperationTimeout(format!(
                    "publish still pending after {:?}",
                    self.publish_timeout
                )))
            });

        let claimed = {
            let mut state = self.state.lock();
            let claimed = state.publishing.get(&kind) == Some(&id);
            if claimed {
                state.publishing.remove(&kind);
                if outcome.is_ok() {
                    state.published.insert(kind, id.clone());
                }
            }
            claimed
        };

        let Err(e) = outcome else {
            if claimed {
                info!("Own {} published", kind);
            } else {
                debug!("Own {} published after its claim was dropped", kind);
            }
            return Ok(());
        };

        warn!("Publishing own {} failed: {}", kind, e);
        if e.is_retryable() {
            self.schedule_retry(kind);
        }
        Err(Error::PublishFailed(format!("own {}: {}", kind, e)))
    }

    fn schedule_retry(self: &Arc<Self>, kind: MediaKind) {
        let token = self.shutdown.child_token();
        {
            let mut state = self.state.lock();
            if !state.wants(kind) {
                return;
            }
            state.cancel_retry(kind);
            state.retries.insert(kind, token.clone());
        }

        info!("Retrying own {} publish in {:?}", kind, self.retry_delay);
        let this = self.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Own {} publish retry cancelled", kind);
                }
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut state = this.state.lock();
                        if token.is_cancelled() {
                            return;
                        }
                        state.retries.remove(&kind);
                    }
                    this.retry_publish(kind).await;
                }
            }
        });
    }

    // boxed: a failed retry schedules the next one from a spawned task
    fn retry_publish(self: Arc<Self>, kind: MediaKind) -> BoxFuture<'static, ()> {
        async move {
            if !self.state.lock().wants(kind) {
                return;
            }
            if let Err(e) = self.ensure_mute_state(kind, false).await {
                debug!("Own {} publish retry failed: {}", kind, e);
            }
        }
        .boxed()
    }

    fn refresh_sending(&self) {
        let sending = {
            let table = self.table.lock();
            let state = self.state.lock();
            table.local().is_some_and(|local| {
                MediaKind::ALL.iter().any(|&kind| {
                    !local.is_disabled(kind)
                        && local
                            .track(kind)
                            .is_some_and(|t| state.published.get(&kind).map(String::as_str) == Some(t.id()))
                })
            })
        };

        let changed = {
            let mut state = self.state.lock();
            let changed = state.sending != sending;
            state.sending = sending;
            changed
        };
        if changed {
            self.render.notify(RenderEvent::PublishStateChanged { published: sending });
        }
    }
}

impl std::fmt::Debug for LocalMediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaController")
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}
