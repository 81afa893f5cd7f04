use crate::config::PresenceConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Paces the periodic re-announcement of this client's intended state
///
/// While published every tick announces. While unpublished an announcement
/// still goes out once the minimum gap has passed, so remote watchdogs keep
/// seeing a liveness signal.
#[derive(Debug, Clone)]
pub struct AnnounceSchedule {
    interval: Duration,
    unpublished_min_gap: Duration,
}

impl AnnounceSchedule {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            interval: config.announce_interval(),
            unpublished_min_gap: config.unpublished_announce_min_gap(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn due(&self, published: bool, last_announce: Option<Instant>, now: Instant) -> bool {
        if published {
            return true;
        }
        match last_announce {
            Some(last) => now.saturating_duration_since(last) >= self.unpublished_min_gap,
            None => true,
        }
    }
}
