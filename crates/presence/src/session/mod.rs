//! Session coordination
//!
//! [`ModelLink`] is the outgoing side of the replicated model (with its
//! offline queue); [`PresenceCoordinator`] is the per-client brain that
//! consumes model notifications and transport events.

pub mod coordinator;
pub mod link;

pub use coordinator::{Collaborators, PresenceCoordinator};
pub use link::{ModelLink, ModelTransport};
