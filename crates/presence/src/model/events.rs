//! Event schema for the replicated session model
//!
//! Each event name has exactly one payload shape. Clients publish
//! [`ModelEvent`]s into the shared log; every replica answers with the same
//! sequence of [`ModelNotification`]s.

use super::{PeerLogEntry, PeerSnapshot};
use crate::types::{MediaIntent, PeerIdentity, Subscriptions, ViewId};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input events carried by the replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ModelEvent {
    /// Emitted by the model framework when a view joins the session
    ViewJoin { view_id: ViewId },

    /// Emitted by the model framework when a view leaves the session
    ViewExit { view_id: ViewId },

    PeerDetails {
        view_id: ViewId,
        identity: PeerIdentity,
        /// Coming back after a glitch rather than arriving fresh
        #[serde(default)]
        rejoining: bool,
    },

    PeerIntendedState {
        view_id: ViewId,
        audio: MediaIntent,
        video: MediaIntent,
    },

    PeerTrackSubscriptions {
        view_id: ViewId,
        subscribed: Subscriptions,
    },

    SetSolo { solo: bool },

    PeerHand { view_id: ViewId, raising_hand: bool },

    SetActivePeer { view_id: ViewId },

    /// Clear the active peer only if it is still `view_id`
    RemoveActivePeer { view_id: ViewId },

    PeerLog { view_id: ViewId, text: String },
}

impl ModelEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            ModelEvent::ViewJoin { .. } => "view-join",
            ModelEvent::ViewExit { .. } => "view-exit",
            ModelEvent::PeerDetails { .. } => "peer-details",
            ModelEvent::PeerIntendedState { .. } => "peer-intended-state",
            ModelEvent::PeerTrackSubscriptions { .. } => "peer-track-subscriptions",
            ModelEvent::SetSolo { .. } => "set-solo",
            ModelEvent::PeerHand { .. } => "peer-hand",
            ModelEvent::SetActivePeer { .. } => "set-active-peer",
            ModelEvent::RemoveActivePeer { .. } => "remove-active-peer",
            ModelEvent::PeerLog { .. } => "peer-log",
        }
    }

    /// Split into wire name and payload for `ModelTransport::publish`
    pub fn encode(&self) -> Result<(&'static str, Value)> {
        let mut value = serde_json::to_value(self)?;
        let payload = value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok((self.name(), payload))
    }

    /// Rebuild an event from its wire name and payload
    pub fn decode(name: &str, payload: Value) -> Result<Self> {
        let value = serde_json::json!({ "event": name, "data": payload });
        Ok(serde_json::from_value(value)?)
    }
}

/// Output events every replica publishes identically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ModelNotification {
    OnPeerDetails { snapshot: PeerSnapshot },

    OnPeerExit { view_id: ViewId },

    OnPeerIntendedState {
        view_id: ViewId,
        audio: MediaIntent,
        video: MediaIntent,
    },

    OnPeerTrackSubscriptions {
        view_id: ViewId,
        subscribed: Subscriptions,
    },

    UpdateSolo { solo: bool },

    UpdateActivePeer { view_id: Option<ViewId> },

    OnPeerHand { view_id: ViewId, raising_hand: bool },

    OnPeerLog { entry: PeerLogEntry },
}
