//! Ordered event log and replicas that replay it
//!
//! The log is the serialization point: entries carry a sequence number and a
//! model timestamp, and a [`Replica`] consumes them strictly in order. Two
//! replicas fed the same log always end in the same state having emitted the
//! same notifications.

use super::{ModelEvent, ModelNotification, ModelSettings, ModelTime, SessionModel};
use serde::{Deserialize, Serialize};

/// One entry of the replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub time: ModelTime,
    pub event: ModelEvent,
}

/// Append-only, totally ordered event log
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Vec<LogEntry>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event; timestamps never run backwards
    pub fn append(&mut self, time: ModelTime, event: ModelEvent) -> u64 {
        let time = self
            .entries
            .last()
            .map_or(time, |last| time.max(last.time));
        let seq = self.entries.len() as u64;
        self.entries.push(LogEntry { seq, time, event });
        seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries from `seq` onwards
    pub fn since(&self, seq: u64) -> &[LogEntry] {
        let start = (seq as usize).min(self.entries.len());
        &self.entries[start..]
    }
}

/// A model instance plus its position in the log
#[derive(Debug, Clone)]
pub struct Replica {
    model: SessionModel,
    cursor: u64,
}

impl Replica {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            model: SessionModel::new(settings),
            cursor: 0,
        }
    }

    pub fn model(&self) -> &SessionModel {
        &self.model
    }

    /// Sequence number of the next entry this replica will apply
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Apply every entry not yet seen
    pub fn catch_up(&mut self, log: &EventLog) -> Vec<ModelNotification> {
        let mut out = Vec::new();
        for entry in log.since(self.cursor) {
            out.extend(self.model.apply(entry.time, &entry.event));
            self.cursor = entry.seq + 1;
        }
        out
    }

    /// Let model time pass without new entries (fires scheduled publications)
    pub fn advance_to(&mut self, now: ModelTime) -> Vec<ModelNotification> {
        self.model.advance_to(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerIdentity, ViewId};

    fn details(id: &str) -> ModelEvent {
        ModelEvent::PeerDetails {
            view_id: ViewId::new(id),
            identity: PeerIdentity {
                nickname: id.to_string(),
                initials: id.to_uppercase(),
                color: "#abcdef".to_string(),
                agent: "test".to_string(),
            },
            rejoining: false,
        }
    }

    fn sample_log() -> EventLog {
        let mut log = EventLog::new();
        for (t, id) in [(0, "a"), (100, "b"), (200, "c")] {
            log.append(t, ModelEvent::ViewJoin { view_id: ViewId::new(id) });
            log.append(t + 10, details(id));
        }
        log.append(400, ModelEvent::SetActivePeer { view_id: ViewId::new("a") });
        log.append(700, ModelEvent::SetActivePeer { view_id: ViewId::new("b") });
        log.append(1_900, ModelEvent::ViewExit { view_id: ViewId::new("c") });
        log
    }

    #[test]
    fn test_append_clamps_time() {
        let mut log = EventLog::new();
        log.append(500, ModelEvent::SetSolo { solo: false });
        log.append(100, ModelEvent::SetSolo { solo: true });
        assert_eq!(log.entries()[1].time, 500);
        assert_eq!(log.entries()[1].seq, 1);
    }

    #[test]
    fn test_replicas_converge() {
        let log = sample_log();

        let mut first = Replica::new(ModelSettings::default());
        let all_at_once = first.catch_up(&log);

        let mut second = Replica::new(ModelSettings::default());
        let mut piecemeal = Vec::new();
        let mut partial = EventLog::new();
        for entry in log.entries() {
            partial.append(entry.time, entry.event.clone());
            piecemeal.extend(second.catch_up(&partial));
        }

        assert_eq!(all_at_once, piecemeal);
        assert_eq!(first.model().snapshot(), second.model().snapshot());
        assert_eq!(first.cursor(), log.len() as u64);
    }

    #[test]
    fn test_scheduled_publication_replays_identically() {
        let log = sample_log();
        let mut replica = Replica::new(ModelSettings::default());
        let out = replica.catch_up(&log);

        // c's election at 210 published; a (400) and b (700) coalesce into 1210
        let updates: Vec<Option<ViewId>> = out
            .iter()
            .filter_map(|n| match n {
                ModelNotification::UpdateActivePeer { view_id } => Some(view_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            updates,
            vec![Some(ViewId::new("c")), Some(ViewId::new("b"))]
        );
        assert!(replica.model().solo());
    }
}
