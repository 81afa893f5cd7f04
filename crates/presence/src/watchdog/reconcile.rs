//! Diagnostic reconciliation of announced intent against transport state
//!
//! An intended-state announcement is held back for a short while before it
//! is compared, giving a corresponding transport event the chance to land
//! first. Any transport event for the peer opens an ignore window and drops
//! whatever comparison was pending. Mismatches only ever raise a flag.

use crate::config::PresenceConfig;
use crate::presence::LocalPeerState;
use crate::types::{MediaIntent, MediaKind, ViewId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A peer's announced intent for both media kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntendedState {
    pub audio: MediaIntent,
    pub video: MediaIntent,
}

impl IntendedState {
    pub fn get(&self, kind: MediaKind) -> MediaIntent {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }
}

/// Handle for one deferred comparison
#[derive(Debug, Clone)]
pub struct PeerCheckTicket {
    pub view_id: ViewId,
    generation: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
struct PeerCheck {
    ignore_until: Option<Instant>,
    deferred: Option<(u64, CancellationToken)>,
    mismatch: bool,
}

impl PeerCheck {
    fn cancel_deferred(&mut self) {
        if let Some((_, token)) = self.deferred.take() {
            token.cancel();
        }
    }
}

#[derive(Debug)]
pub struct Reconciler {
    defer: Duration,
    ignore_window: Duration,
    checks: HashMap<ViewId, PeerCheck>,
    next_generation: u64,
}

impl Reconciler {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            defer: config.intended_state_defer(),
            ignore_window: config.transport_ignore_window(),
            checks: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn defer(&self) -> Duration {
        self.defer
    }

    /// A transport event arrived for the peer
    pub fn postpone(&mut self, view_id: &ViewId, now: Instant) {
        let check = self.checks.entry(view_id.clone()).or_default();
        check.cancel_deferred();
        check.ignore_until = Some(now + self.ignore_window);
    }

    /// An announcement arrived; returns a ticket if it should be checked later
    pub fn admit(
        &mut self,
        view_id: &ViewId,
        now: Instant,
        parent: &CancellationToken,
    ) -> Option<PeerCheckTicket> {
        let check = self.checks.entry(view_id.clone()).or_default();
        if check.ignore_until.is_some_and(|until| until > now) {
            debug!("Ignoring intended state from {} inside transport window", view_id);
            return None;
        }
        check.cancel_deferred();

        let generation = self.next_generation;
        self.next_generation += 1;
        let token = parent.child_token();
        check.deferred = Some((generation, token.clone()));

        Some(PeerCheckTicket {
            view_id: view_id.clone(),
            generation,
            token,
        })
    }

    /// The ticket's delay elapsed; true if it was not superseded meanwhile
    pub fn complete(&mut self, ticket: &PeerCheckTicket) -> bool {
        let Some(check) = self.checks.get_mut(&ticket.view_id) else {
            return false;
        };
        match &check.deferred {
            Some((generation, _)) if *generation == ticket.generation => {
                check.deferred = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_pending(&self, view_id: &ViewId) -> bool {
        self.checks
            .get(view_id)
            .is_some_and(|check| check.deferred.is_some())
    }

    /// Compare intent against observed state; true on any disagreement
    pub fn compare(view_id: &ViewId, intended: IntendedState, observed: &LocalPeerState) -> bool {
        let mut mismatch = false;
        for kind in MediaKind::ALL {
            let reported = intended.get(kind).is_disabled();
            let actual = observed.is_disabled(kind);
            if reported != actual {
                warn!(
                    "{} {} state mismatch: reporting {}, but transport is {}",
                    view_id,
                    kind,
                    mute_str(reported),
                    mute_str(actual)
                );
                mismatch = true;
            }
        }
        mismatch
    }

    /// Store the flag; true if it changed
    pub fn record_mismatch(&mut self, view_id: &ViewId, mismatch: bool) -> bool {
        let check = self.checks.entry(view_id.clone()).or_default();
        let changed = check.mismatch != mismatch;
        check.mismatch = mismatch;
        changed
    }

    pub fn mismatch(&self, view_id: &ViewId) -> bool {
        self.checks.get(view_id).is_some_and(|check| check.mismatch)
    }

    pub fn forget(&mut self, view_id: &ViewId) {
        if let Some(mut check) = self.checks.remove(view_id) {
            check.cancel_deferred();
        }
    }

    pub fn clear(&mut self) {
        for check in self.checks.values_mut() {
            check.cancel_deferred();
        }
        self.checks.clear();
    }
}

fn mute_str(disabled: bool) -> &'static str {
    if disabled {
        "muted"
    } else {
        "unmuted"
    }
}
