use crate::config::PresenceConfig;
use crate::presence::PresenceTable;
use crate::types::ViewId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Marks silent, unpublished remote peers as departed
#[derive(Debug, Clone)]
pub struct LivenessWatchdog {
    timeout: Duration,
}

impl LivenessWatchdog {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            timeout: config.liveness_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One sweep over every remote peer
    ///
    /// Returns the peers newly marked `left`; the caller provisionally
    /// removes them.
    pub fn sweep(&self, table: &mut PresenceTable, now: Instant) -> Vec<ViewId> {
        let mut stalled = Vec::new();
        for view_id in table.remote_ids() {
            let Some(state) = table.get(&view_id) else {
                continue;
            };
            if state.left() || state.published() {
                continue;
            }
            let silent = now.saturating_duration_since(state.last_announce());
            if silent >= self.timeout {
                warn!(
                    "Peer {} silent for {}ms while unpublished; presuming departed",
                    view_id,
                    silent.as_millis()
                );
                table.mark_left(&view_id);
                stalled.push(view_id);
            }
        }
        stalled
    }
}
