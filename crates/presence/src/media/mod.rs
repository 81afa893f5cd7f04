//! Media track lifecycle
//!
//! [`RemoteTrackController`] subscribes to other peers' tracks with a
//! cancellable retry per (peer, kind). [`LocalMediaController`] publishes
//! this client's own tracks once the transport is connected and keeps them
//! in line with local mute intent.

pub mod local;
pub mod remote;
pub mod transport;

pub use local::LocalMediaController;
pub use remote::{RemoteTrackController, TrackPhase};
pub use transport::{
    ConnectionState, LeaveReason, MediaTransport, NetworkQuality, SubscribeOutcome,
    TransportEvent,
};
