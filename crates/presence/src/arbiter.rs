//! Client-side active-speaker heuristic
//!
//! Decides whether this client should *ask* to become the active speaker.
//! A nomination is only a request: the replicated model adjudicates, and the
//! result comes back to every client as an active-peer update.

use crate::config::PresenceConfig;
use crate::types::ViewId;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Local audio input level, 0.0 (silence) to 1.0
pub trait AudioLevelSource: Send + Sync {
    fn level(&self) -> f32;
}

/// Source for clients without a level meter
#[derive(Debug, Default, Clone, Copy)]
pub struct Silence;

impl AudioLevelSource for Silence {
    fn level(&self) -> f32 {
        0.0
    }
}

/// Combined state of one known peer, as the arbiter sees it
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAudio {
    pub view_id: ViewId,
    pub published: bool,
    pub audio_disabled: bool,
}

/// Snapshot of everything one poll cycle looks at
#[derive(Debug, Clone)]
pub struct ArbiterInputs {
    pub local_id: ViewId,
    /// Media transport connected and the replicated model attached
    pub online: bool,
    pub foreground: bool,
    /// Every known peer, the local one included
    pub peers: Vec<PeerAudio>,
    pub displayed_active: Option<ViewId>,
    pub audio_level: f32,
}

impl ArbiterInputs {
    fn local(&self) -> Option<&PeerAudio> {
        self.peers.iter().find(|p| p.view_id == self.local_id)
    }
}

/// Why this client asks to be the active speaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Nomination {
    OnlyPublished,
    OnlyUnmuted,
    AudioLevel { level: f32, threshold: f32 },
}

impl fmt::Display for Nomination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nomination::OnlyPublished => f.write_str("only peer published"),
            Nomination::OnlyUnmuted => f.write_str("only peer unmuted"),
            Nomination::AudioLevel { level, threshold } => {
                write!(f, "audio level={} > {}", level, threshold)
            }
        }
    }
}

/// Poll-driven nomination state
#[derive(Debug, Clone)]
pub struct SpeakerArbiter {
    min_peers: usize,
    cooldown: Duration,
    threshold_muted_active: f32,
    threshold_speaking_active: f32,
    last_request: Option<Instant>,
}

impl SpeakerArbiter {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            min_peers: config.mode_election_peer_count,
            cooldown: config.arbiter_request_cooldown(),
            threshold_muted_active: config.speaker_threshold_muted_active,
            threshold_speaking_active: config.speaker_threshold_speaking_active,
            last_request: None,
        }
    }

    pub fn last_request(&self) -> Option<Instant> {
        self.last_request
    }

    pub fn record_request(&mut self, now: Instant) {
        self.last_request = Some(now);
    }

    /// Run one poll cycle; `Some` means a request should be sent now
    pub fn evaluate(&self, inputs: &ArbiterInputs, now: Instant) -> Option<Nomination> {
        let local = inputs.local()?;

        let cooling_down = self
            .last_request
            .is_some_and(|last| now.duration_since(last) < self.cooldown);

        if !inputs.online
            || !inputs.foreground
            || inputs.peers.len() < self.min_peers
            || !local.published
            || cooling_down
            || inputs.displayed_active.as_ref() == Some(&inputs.local_id)
        {
            return None;
        }

        if inputs.peers.iter().filter(|p| p.published).count() == 1 {
            return Some(Nomination::OnlyPublished);
        }

        if local.audio_disabled {
            return None;
        }

        if inputs.peers.iter().filter(|p| !p.audio_disabled).count() == 1 {
            return Some(Nomination::OnlyUnmuted);
        }

        let active_muted = inputs
            .displayed_active
            .as_ref()
            .and_then(|id| inputs.peers.iter().find(|p| &p.view_id == id))
            .map_or(true, |p| p.audio_disabled);
        let threshold = if active_muted {
            self.threshold_muted_active
        } else {
            self.threshold_speaking_active
        };

        let level = (inputs.audio_level * 100.0).round() / 100.0;
        if level > threshold {
            Some(Nomination::AudioLevel { level, threshold })
        } else {
            None
        }
    }
}
