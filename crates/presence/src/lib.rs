//! Peer presence and media reconciliation for RemoteMedia sessions
//!
//! Small multi-party audio/video sessions have two sources of truth that
//! disagree in transit: a replicated session model (membership, display
//! mode, active speaker, announced intent) and a real-time media transport
//! (who is actually connected and publishing). This crate keeps one
//! client's view of the session consistent with both.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Replicated model (shared event log, one per session)    │
//! │  └─ SessionModel ── notifications ──┐                    │
//! │                                     ↓                    │
//! │  PresenceCoordinator (one per client)                    │
//! │  ├─ ModelLink (outgoing events, offline queue)           │
//! │  ├─ PresenceTable (transport-observed peer state)        │
//! │  ├─ RemoteTrackController (subscribe + retry)            │
//! │  ├─ LocalMediaController (publish + mute intent)         │
//! │  ├─ LivenessWatchdog / Reconciler / AnnounceSchedule     │
//! │  └─ SpeakerArbiter (active-speaker self-nomination)      │
//! │     ↑                         ↓                          │
//! │  MediaTransport events     RenderSink                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use remotemedia_presence::PresenceConfig;
//!
//! let config = PresenceConfig {
//!     channel: "standup".to_string(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.mode_election_peer_count, 3);
//! ```

#![warn(clippy::all)]

pub mod arbiter;
pub mod config;
pub mod error;
pub mod media;
pub mod model;
pub mod presence;
pub mod render;
pub mod session;
pub mod types;
pub mod watchdog;

pub use arbiter::{AudioLevelSource, Nomination, Silence, SpeakerArbiter};
pub use config::PresenceConfig;
pub use error::{Error, Result};
pub use media::{
    ConnectionState, LeaveReason, LocalMediaController, MediaTransport, NetworkQuality,
    RemoteTrackController, SubscribeOutcome, TrackPhase, TransportEvent,
};
pub use model::{
    EventLog, ModelEvent, ModelNotification, ModelSettings, ModelSnapshot, PeerSnapshot,
    Replica, SessionModel,
};
pub use presence::{LocalPeerState, PresenceTable, SharedPresenceTable};
pub use render::{NullRenderer, RenderEvent, RenderSink};
pub use session::{Collaborators, ModelLink, ModelTransport, PresenceCoordinator};
pub use types::{MediaIntent, MediaKind, MediaTrack, PeerIdentity, Subscriptions, TrackRef, ViewId};

/// Install a `tracing` subscriber honouring `RUST_LOG`
///
/// Defaults to `info` for this crate. Safe to call more than once; later
/// calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("remotemedia_presence=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
