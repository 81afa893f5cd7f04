//! Outbound notifications for the rendering layer
//!
//! The engine never draws anything. It tells a [`RenderSink`] what changed
//! and the sink owns all visual presentation.

use crate::model::PeerSnapshot;
use crate::types::{MediaKind, TrackRef, ViewId};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone)]
pub enum RenderEvent {
    PeerAdded {
        snapshot: PeerSnapshot,
    },
    PeerRemoved {
        view_id: ViewId,
    },
    TrackAttached {
        view_id: ViewId,
        kind: MediaKind,
        track: TrackRef,
    },
    TrackDetached {
        view_id: ViewId,
        kind: MediaKind,
    },
    ActivePeerChanged {
        view_id: Option<ViewId>,
    },
    ModeChanged {
        solo: bool,
    },
    HandRaisedChanged {
        view_id: ViewId,
        raising_hand: bool,
    },
    /// Intended state and observed transport state disagree (display only)
    MismatchFlagChanged {
        view_id: ViewId,
        mismatch: bool,
    },
    /// The local peer started or stopped sending media
    PublishStateChanged {
        published: bool,
    },
    /// Left the replicated session but still present on the transport
    PeerOfflineChanged {
        view_id: ViewId,
        offline: bool,
    },
}

/// Receiver of render notifications
pub trait RenderSink: Send + Sync {
    fn notify(&self, event: RenderEvent);
}

impl RenderSink for mpsc::UnboundedSender<RenderEvent> {
    fn notify(&self, event: RenderEvent) {
        if self.send(event).is_err() {
            trace!("Render receiver dropped");
        }
    }
}

/// Sink that discards everything (headless clients)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl RenderSink for NullRenderer {
    fn notify(&self, _event: RenderEvent) {}
}
