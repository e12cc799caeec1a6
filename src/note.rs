use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    On,
    Off,
}

/// Which adapter a note came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LocalDevice,
    NetworkPeer,
}

/// A canonical note event, validated once at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteEvent {
    pub timestamp: Instant,
    pub note: u8,
    pub velocity: u8,
    pub channel: u8,
    pub kind: NoteKind,
    /// Device or peer name.
    pub source_id: String,
}

impl NoteEvent {
    /// Build an event stamped now. Returns `None` for out-of-range data.
    pub fn new(
        kind: NoteKind,
        channel: u8,
        note: u8,
        velocity: u8,
        source_id: impl Into<String>,
    ) -> Option<Self> {
        Self::at(Instant::now(), kind, channel, note, velocity, source_id)
    }

    pub fn at(
        timestamp: Instant,
        kind: NoteKind,
        channel: u8,
        note: u8,
        velocity: u8,
        source_id: impl Into<String>,
    ) -> Option<Self> {
        if note > 127 || velocity > 127 || channel > 15 {
            return None;
        }
        Some(Self {
            timestamp,
            note,
            velocity,
            channel,
            kind,
            source_id: source_id.into(),
        })
    }

    /// Decode a raw channel message. Anything but note on/off is `None`.
    pub fn from_midi(message: &[u8], source_id: &str) -> Option<Self> {
        if message.len() < 3 {
            return None;
        }
        let status = message[0] & 0xF0;
        let channel = message[0] & 0x0F;
        let note = message[1];
        let velocity = message[2];

        match status {
            0x90 if velocity > 0 => Self::new(NoteKind::On, channel, note, velocity, source_id),
            // note on with velocity 0 is a release
            0x90 | 0x80 => Self::new(NoteKind::Off, channel, note, velocity, source_id),
            _ => None,
        }
    }

    /// True when this event starts a sounding note.
    pub fn starts_note(&self) -> bool {
        self.kind == NoteKind::On && self.velocity > 0
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            kind: self.kind,
            channel: self.channel,
            note: self.note,
            velocity: self.velocity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub kind: NoteKind,
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
}

/// A note event once it has entered the unified stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedEvent {
    pub event: NoteEvent,
    pub source: SourceKind,
    pub key: DedupKey,
    pub processed: bool,
}

impl UnifiedEvent {
    pub fn new(source: SourceKind, event: NoteEvent) -> Self {
        Self {
            key: event.dedup_key(),
            event,
            source,
            processed: false,
        }
    }
}

/// One entry in the globally sounding set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveNoteRecord {
    pub note: u8,
    pub source: SourceKind,
    pub source_id: String,
    pub timestamp: Instant,
    pub velocity: u8,
    pub channel: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_note_messages() {
        let on = NoteEvent::from_midi(&[0x91, 60, 100], "kbd").unwrap();
        assert_eq!(on.kind, NoteKind::On);
        assert_eq!(on.channel, 1);
        assert_eq!(on.source_id, "kbd");

        let off = NoteEvent::from_midi(&[0x80, 60, 64], "kbd").unwrap();
        assert_eq!(off.kind, NoteKind::Off);
        assert_eq!(off.velocity, 64);
    }

    #[test]
    fn zero_velocity_on_is_off() {
        let ev = NoteEvent::from_midi(&[0x90, 60, 0], "kbd").unwrap();
        assert_eq!(ev.kind, NoteKind::Off);
        assert!(!ev.starts_note());
    }

    #[test]
    fn ignores_other_messages() {
        assert!(NoteEvent::from_midi(&[0xB0, 64, 127], "kbd").is_none());
        assert!(NoteEvent::from_midi(&[0xE0, 0, 64], "kbd").is_none());
        assert!(NoteEvent::from_midi(&[0x90, 60], "kbd").is_none());
        assert!(NoteEvent::from_midi(&[0x90, 200, 10], "kbd").is_none());
    }

    #[test]
    fn dedup_key_ignores_source() {
        let a = NoteEvent::new(NoteKind::On, 0, 60, 100, "a").unwrap();
        let b = NoteEvent::new(NoteKind::On, 0, 60, 100, "b").unwrap();
        assert_eq!(a.dedup_key(), b.dedup_key());
        let c = NoteEvent::new(NoteKind::Off, 0, 60, 100, "a").unwrap();
        assert_ne!(a.dedup_key(), c.dedup_key());
    }
}
