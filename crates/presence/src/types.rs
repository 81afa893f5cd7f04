//! Identifiers and handles shared by every layer

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a participant for the lifetime of its membership
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(String);

impl ViewId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random view ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ViewId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ViewId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer's self-reported state for one media kind
///
/// Advisory only; rendering always follows the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaIntent {
    Unmuted,
    Muted,
    /// No input device for this kind; compares as muted
    Unavailable,
}

impl MediaIntent {
    pub fn from_muted(muted: bool) -> Self {
        if muted {
            MediaIntent::Muted
        } else {
            MediaIntent::Unmuted
        }
    }

    pub fn is_disabled(&self) -> bool {
        !matches!(self, MediaIntent::Unmuted)
    }
}

/// Display identity supplied by a peer once it has joined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub nickname: String,
    pub initials: String,
    pub color: String,
    /// User-agent string, kept for diagnostics
    pub agent: String,
}

/// Per remote peer, the media kinds a client has confirmed receiving
pub type Subscriptions = BTreeMap<ViewId, BTreeSet<MediaKind>>;

/// A single live media stream owned by the transport
#[async_trait]
pub trait MediaTrack: Send + Sync + fmt::Debug {
    /// Transport-assigned identifier, unique per track instance
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Toggle capture without unpublishing (used for video)
    async fn set_enabled(&self, enabled: bool) -> crate::Result<()>;

    /// Toggle sending silence without unpublishing (used for audio)
    async fn set_muted(&self, muted: bool) -> crate::Result<()>;
}

/// Shared handle to a track
pub type TrackRef = Arc<dyn MediaTrack>;

/// Two handles refer to the same transport track
pub fn same_track(a: &TrackRef, b: &TrackRef) -> bool {
    a.id() == b.id()
}
