//! Configuration types for presence coordination
//!
//! Every threshold here was tuned empirically against a live media
//! transport; they are kept configurable rather than hard-coded.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a [`PresenceCoordinator`](crate::PresenceCoordinator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Media transport channel to join (default: "presence")
    pub channel: String,

    /// Scope under which replicated-model events are published
    pub session_scope: String,

    /// Silence after which an unpublished remote peer is presumed gone (default: 35000ms)
    pub liveness_timeout_ms: u64,

    /// Watchdog sweep interval (default: 1000ms)
    pub watchdog_interval_ms: u64,

    /// Delay before retrying a failed subscribe (default: 2000ms)
    pub subscribe_retry_delay_ms: u64,

    /// A subscribe that has not settled after this long counts as inconclusive (default: 10000ms)
    pub subscribe_timeout_ms: u64,

    /// Bound on publishing one of this client's own tracks (default: 10000ms)
    pub publish_timeout_ms: u64,

    /// Delay before retrying a failed own-track publish (default: 2000ms)
    pub publish_retry_delay_ms: u64,

    /// Bound on one replicated-model send; exceeding it takes the link offline (default: 10000ms)
    pub model_send_timeout_ms: u64,

    /// Delay before an intended-state announcement is checked (default: 2000ms)
    pub intended_state_defer_ms: u64,

    /// Window after a transport event in which announcements are ignored (default: 2000ms)
    pub transport_ignore_window_ms: u64,

    /// Interval between own intended-state announcements (default: 5000ms)
    pub announce_interval_ms: u64,

    /// Minimum gap between announcements while unpublished (default: 14000ms)
    pub unpublished_announce_min_gap_ms: u64,

    /// Minimum model time between active-peer publications (default: 1000ms)
    pub active_peer_debounce_ms: u64,

    /// Active-speaker poll interval (default: 200ms)
    pub arbiter_poll_interval_ms: u64,

    /// Minimum gap between own active-speaker requests (default: 1500ms)
    pub arbiter_request_cooldown_ms: u64,

    /// Audio level needed to take over from a muted active peer (default: 0.10)
    pub speaker_threshold_muted_active: f32,

    /// Audio level needed to take over from an unmuted active peer (default: 0.30)
    pub speaker_threshold_speaking_active: f32,

    /// Identified-peer count that switches the group out of solo mode (default: 3)
    pub mode_election_peer_count: usize,

    /// Model time an exited peer record is retained (default: 24h)
    pub exited_peer_retention_ms: u64,

    /// Delay after transport connection before arbitration and announcements start (default: 5000ms)
    pub settle_delay_ms: u64,

    /// Delay before leaving the transport once alone (default: 1000ms)
    pub alone_disconnect_delay_ms: u64,

    /// Capacity of the replicated peer-log ring (default: 100)
    pub peer_log_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            channel: "presence".to_string(),
            session_scope: "session".to_string(),
            liveness_timeout_ms: 35_000,
            watchdog_interval_ms: 1_000,
            subscribe_retry_delay_ms: 2_000,
            subscribe_timeout_ms: 10_000,
            publish_timeout_ms: 10_000,
            publish_retry_delay_ms: 2_000,
            model_send_timeout_ms: 10_000,
            intended_state_defer_ms: 2_000,
            transport_ignore_window_ms: 2_000,
            announce_interval_ms: 5_000,
            unpublished_announce_min_gap_ms: 14_000,
            active_peer_debounce_ms: 1_000,
            arbiter_poll_interval_ms: 200,
            arbiter_request_cooldown_ms: 1_500,
            speaker_threshold_muted_active: 0.10,
            speaker_threshold_speaking_active: 0.30,
            mode_election_peer_count: 3,
            exited_peer_retention_ms: 24 * 60 * 60 * 1000,
            settle_delay_ms: 5_000,
            alone_disconnect_delay_ms: 1_000,
            peer_log_capacity: 100,
        }
    }
}

impl PresenceConfig {
    /// Parse a configuration from TOML; missing keys take their defaults
    ///
    /// # Example
    ///
    /// ```
    /// use remotemedia_presence::PresenceConfig;
    ///
    /// let config = PresenceConfig::from_toml_str("liveness_timeout_ms = 20000").unwrap();
    /// assert_eq!(config.liveness_timeout_ms, 20000);
    /// assert_eq!(config.watchdog_interval_ms, 1000);
    /// ```
    pub fn from_toml_str(source: &str) -> crate::Result<Self> {
        let config: PresenceConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - any interval or window is zero
    /// - a speaker threshold is outside 0.0-1.0
    /// - the muted-active threshold exceeds the speaking-active threshold
    /// - `mode_election_peer_count` is below 2
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.channel.is_empty() {
            return Err(Error::InvalidConfig("channel must not be empty".to_string()));
        }

        let intervals = [
            ("liveness_timeout_ms", self.liveness_timeout_ms),
            ("watchdog_interval_ms", self.watchdog_interval_ms),
            ("subscribe_retry_delay_ms", self.subscribe_retry_delay_ms),
            ("subscribe_timeout_ms", self.subscribe_timeout_ms),
            ("publish_timeout_ms", self.publish_timeout_ms),
            ("publish_retry_delay_ms", self.publish_retry_delay_ms),
            ("model_send_timeout_ms", self.model_send_timeout_ms),
            ("intended_state_defer_ms", self.intended_state_defer_ms),
            ("transport_ignore_window_ms", self.transport_ignore_window_ms),
            ("announce_interval_ms", self.announce_interval_ms),
            ("active_peer_debounce_ms", self.active_peer_debounce_ms),
            ("arbiter_poll_interval_ms", self.arbiter_poll_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        for (name, value) in [
            ("speaker_threshold_muted_active", self.speaker_threshold_muted_active),
            ("speaker_threshold_speaking_active", self.speaker_threshold_speaking_active),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be in range 0.0-1.0, got {}",
                    name, value
                )));
            }
        }

        if self.speaker_threshold_muted_active > self.speaker_threshold_speaking_active {
            return Err(Error::InvalidConfig(format!(
                "speaker_threshold_muted_active ({}) must not exceed speaker_threshold_speaking_active ({})",
                self.speaker_threshold_muted_active, self.speaker_threshold_speaking_active
            )));
        }

        if self.mode_election_peer_count < 2 {
            return Err(Error::InvalidConfig(format!(
                "mode_election_peer_count must be at least 2, got {}",
                self.mode_election_peer_count
            )));
        }

        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn subscribe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_retry_delay_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    pub fn model_send_timeout(&self) -> Duration {
        Duration::from_millis(self.model_send_timeout_ms)
    }

    pub fn intended_state_defer(&self) -> Duration {
        Duration::from_millis(self.intended_state_defer_ms)
    }

    pub fn transport_ignore_window(&self) -> Duration {
        Duration::from_millis(self.transport_ignore_window_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn unpublished_announce_min_gap(&self) -> Duration {
        Duration::from_millis(self.unpublished_announce_min_gap_ms)
    }

    pub fn arbiter_poll_interval(&self) -> Duration {
        Duration::from_millis(self.arbiter_poll_interval_ms)
    }

    pub fn arbiter_request_cooldown(&self) -> Duration {
        Duration::from_millis(self.arbiter_request_cooldown_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn alone_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.alone_disconnect_delay_ms)
    }
}
