//! Media transport collaborator
//!
//! The out-of-band peer overlay that actually carries audio and video. Its
//! events arrive per client with no ordering guarantee relative to each
//! other or to the replicated model.

use crate::types::{MediaKind, TrackRef, ViewId};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of the local client on the media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}

/// Why a remote user left the transport channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    Quit,
    ServerTimeOut,
    /// Switched to receive-only; still present, just no longer sending
    BecomeAudience,
}

/// Transport-reported link quality, 0 (unknown) through 6 (down); 1 is excellent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkQuality {
    pub uplink: u8,
    pub downlink: u8,
}

impl NetworkQuality {
    pub const EXCELLENT: u8 = 1;

    /// Either direction known and worse than excellent
    pub fn is_degraded(&self) -> bool {
        self.uplink > Self::EXCELLENT || self.downlink > Self::EXCELLENT
    }
}

/// Events emitted by the media transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionStateChange {
        current: ConnectionState,
        previous: ConnectionState,
        reason: Option<String>,
    },
    UserPublished {
        peer: ViewId,
        kind: MediaKind,
    },
    UserUnpublished {
        peer: ViewId,
        kind: MediaKind,
    },
    UserLeft {
        peer: ViewId,
        reason: LeaveReason,
    },
    NetworkQuality(NetworkQuality),
    Exception {
        code: i32,
        message: String,
        peer: Option<ViewId>,
    },
}

impl TransportEvent {
    /// Remote peer the event concerns, if any
    pub fn peer(&self) -> Option<&ViewId> {
        match self {
            TransportEvent::UserPublished { peer, .. }
            | TransportEvent::UserUnpublished { peer, .. }
            | TransportEvent::UserLeft { peer, .. } => Some(peer),
            TransportEvent::Exception { peer, .. } => peer.as_ref(),
            _ => None,
        }
    }
}

/// Result of a subscribe call that did not raise
#[derive(Debug, Clone)]
pub enum SubscribeOutcome {
    /// The remote track is now being received
    Track(TrackRef),
    /// Subscribe succeeded but the track was already gone
    Vanished,
    /// Neither success nor failure was reported
    Inconclusive,
}

/// Operations the engine drives against the media transport
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn join(&self, channel: &str, id: &ViewId) -> Result<()>;

    async fn leave(&self) -> Result<()>;

    async fn publish(&self, track: TrackRef) -> Result<()>;

    async fn unpublish(&self, track: TrackRef) -> Result<()>;

    async fn subscribe(&self, peer: &ViewId, kind: MediaKind) -> Result<SubscribeOutcome>;

    async fn unsubscribe(&self, peer: &ViewId, kind: MediaKind) -> Result<()>;
}
