//! Liveness watchdog and reconciliation timers
//!
//! - [`liveness`]: detects remote peers that went silent
//! - [`reconcile`]: compares announced intent against transport reality
//! - [`announce`]: paces this client's own intent announcements
//!
//! Everything here is pure bookkeeping driven by the coordinator's timers;
//! nothing in this module ever forces a correction.

pub mod announce;
pub mod liveness;
pub mod reconcile;

pub use announce::AnnounceSchedule;
pub use liveness::LivenessWatchdog;
pub use reconcile::{IntendedState, PeerCheckTicket, Reconciler};
