use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::note::NoteKind;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("malformed MIDI data: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One note message as the file parser reports it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub time_ms: f64,
    pub note: u8,
    pub velocity: u8,
    #[serde(rename = "type")]
    pub kind: NoteKind,
}

/// Output of the MIDI file parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedMidi {
    pub events: Vec<ParsedEvent>,
    /// Length of the file in milliseconds.
    pub duration: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Turns a file on disk into note events. Implemented outside the core.
pub trait MidiFileParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedMidi, ParseError>;
}

/// Reads the parser output shape from a JSON file.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTimelineParser;

impl MidiFileParser for JsonTimelineParser {
    fn parse(&self, path: &Path) -> Result<ParsedMidi, ParseError> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ParseError::NotFound(path.to_path_buf()),
            _ => ParseError::Io(e),
        })?;
        serde_json::from_str(&content).map_err(|e| ParseError::Malformed(e.to_string()))
    }
}

/// A note with its onset and length, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimelineNote {
    pub onset: f64,
    pub note: u8,
    pub velocity: u8,
    pub duration: f64,
}

impl TimelineNote {
    pub fn end(&self) -> f64 {
        self.onset + self.duration
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    notes: Vec<TimelineNote>,
    duration: f64,
    metadata: BTreeMap<String, String>,
}

impl Timeline {
    /// Pair note-ons with their note-offs.
    ///
    /// Offs close the oldest open note of the same pitch; stray offs are
    /// dropped and notes still open at the end run to the timeline's end.
    pub fn from_parsed(parsed: ParsedMidi) -> Self {
        let mut events = parsed.events;
        events.retain(|e| e.note <= 127 && e.time_ms.is_finite() && e.time_ms >= 0.0);
        events.sort_by(|a, b| a.time_ms.total_cmp(&b.time_ms));

        let last_event_ms = events.last().map_or(0.0, |e| e.time_ms);
        let end_ms = parsed.duration.max(last_event_ms);

        let mut open: HashMap<u8, VecDeque<(f64, u8)>> = HashMap::new();
        let mut notes = Vec::with_capacity(events.len() / 2);

        for event in events {
            let starts = event.kind == NoteKind::On && event.velocity > 0;
            if starts {
                open.entry(event.note)
                    .or_default()
                    .push_back((event.time_ms, event.velocity));
                continue;
            }
            match open.get_mut(&event.note).and_then(VecDeque::pop_front) {
                Some((onset_ms, velocity)) => notes.push(TimelineNote {
                    onset: onset_ms / 1000.0,
                    note: event.note,
                    velocity,
                    duration: (event.time_ms - onset_ms) / 1000.0,
                }),
                None => log::debug!("note-off for {} without a note-on", event.note),
            }
        }

        for (note, pending) in open {
            for (onset_ms, velocity) in pending {
                notes.push(TimelineNote {
                    onset: onset_ms / 1000.0,
                    note,
                    velocity,
                    duration: (end_ms - onset_ms) / 1000.0,
                });
            }
        }

        notes.sort_by(|a, b| a.onset.total_cmp(&b.onset).then(a.note.cmp(&b.note)));
        let last_end = notes.iter().map(TimelineNote::end).fold(0.0, f64::max);
        let duration = (end_ms / 1000.0).max(last_end);

        Self {
            notes,
            duration,
            metadata: parsed.metadata,
        }
    }

    pub fn notes(&self) -> &[TimelineNote] {
        &self.notes
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Index of the first note whose onset is at or after `time`.
    pub fn first_at_or_after(&self, time: f64) -> usize {
        self.notes.partition_point(|n| n.onset < time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(time_ms: f64, note: u8, velocity: u8, kind: NoteKind) -> ParsedEvent {
        ParsedEvent {
            time_ms,
            note,
            velocity,
            kind,
        }
    }

    #[test]
    fn pairs_on_and_off() {
        let parsed = ParsedMidi {
            events: vec![
                ev(600.0, 64, 90, NoteKind::On),
                ev(0.0, 60, 100, NoteKind::On),
                ev(500.0, 60, 0, NoteKind::Off),
                ev(1100.0, 64, 0, NoteKind::Off),
            ],
            duration: 1100.0,
            metadata: BTreeMap::new(),
        };
        let timeline = Timeline::from_parsed(parsed);
        let notes = timeline.notes();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].note, 60);
        assert!((notes[0].duration - 0.5).abs() < 1e-9);
        assert_eq!(notes[1].note, 64);
        assert!((notes[1].onset - 0.6).abs() < 1e-9);
        assert!((timeline.duration() - 1.1).abs() < 1e-9);
    }

    #[test]
    fn zero_velocity_on_closes_note() {
        let parsed = ParsedMidi {
            events: vec![ev(0.0, 60, 100, NoteKind::On), ev(250.0, 60, 0, NoteKind::On)],
            duration: 1000.0,
            metadata: BTreeMap::new(),
        };
        let timeline = Timeline::from_parsed(parsed);
        assert_eq!(timeline.notes().len(), 1);
        assert!((timeline.notes()[0].duration - 0.25).abs() < 1e-9);
    }

    #[test]
    fn unclosed_notes_run_to_the_end() {
        let parsed = ParsedMidi {
            events: vec![
                ev(0.0, 60, 100, NoteKind::On),
                ev(100.0, 60, 80, NoteKind::On),
                ev(200.0, 60, 0, NoteKind::Off),
                ev(300.0, 62, 0, NoteKind::Off),
            ],
            duration: 2000.0,
            metadata: BTreeMap::new(),
        };
        let timeline = Timeline::from_parsed(parsed);
        let notes = timeline.notes();
        assert_eq!(notes.len(), 2);
        // the first note-on was closed by the off
        assert!((notes[0].duration - 0.2).abs() < 1e-9);
        assert_eq!(notes[1].velocity, 80);
        assert!((notes[1].end() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn json_parser_reports_missing_and_malformed() {
        let missing = JsonTimelineParser.parse(Path::new("/nonexistent/song.json"));
        assert!(matches!(missing, Err(ParseError::NotFound(_))));

        let path = std::env::temp_dir().join(format!("piano-lights-tl-{}.json", std::process::id()));
        fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(
            JsonTimelineParser.parse(&path),
            Err(ParseError::Malformed(_))
        ));

        fs::write(
            &path,
            r#"{ "events": [ { "time_ms": 0, "note": 60, "velocity": 100, "type": "on" } ],
                 "duration": 500 }"#,
        )
        .unwrap();
        let parsed = JsonTimelineParser.parse(&path).unwrap();
        assert_eq!(parsed.events.len(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn first_at_or_after_uses_onsets() {
        let parsed = ParsedMidi {
            events: vec![
                ev(0.0, 60, 100, NoteKind::On),
                ev(100.0, 60, 0, NoteKind::Off),
                ev(1000.0, 62, 100, NoteKind::On),
                ev(1100.0, 62, 0, NoteKind::Off),
            ],
            duration: 1100.0,
            metadata: BTreeMap::new(),
        };
        let timeline = Timeline::from_parsed(parsed);
        assert_eq!(timeline.first_at_or_after(0.0), 0);
        assert_eq!(timeline.first_at_or_after(0.5), 1);
        assert_eq!(timeline.first_at_or_after(2.0), 2);
    }
}
