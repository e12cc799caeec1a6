//! MIDI note to LED index translation.
//!
//! Every table is built once from the settings and then only read, so
//! lookups on the live path are a slice index.

use serde_json::Value;

use crate::config::{MappingMode, MappingSettings, PianoSpec, Settings};

const NOTE_COUNT: usize = 128;

#[derive(Debug, Clone)]
pub struct KeyMapper {
    piano: PianoSpec,
    num_leds: usize,
    reversed: bool,
    mode: MappingMode,
    table: Vec<Vec<usize>>,
    positions: Vec<Option<usize>>,
}

impl KeyMapper {
    pub fn new(settings: &Settings) -> Self {
        Self::from_parts(
            settings.piano.spec(),
            settings.led.count,
            settings.led.reversed,
            &settings.mapping,
        )
    }

    pub fn from_parts(
        piano: PianoSpec,
        num_leds: usize,
        reversed: bool,
        mapping: &MappingSettings,
    ) -> Self {
        let table = match mapping.mode {
            MappingMode::Linear => linear_table(piano, num_leds, reversed),
            MappingMode::Auto => auto_table(
                piano,
                num_leds,
                reversed,
                mapping.base_offset,
                mapping.leds_per_key,
            ),
            MappingMode::Manual => manual_table(&mapping.manual, num_leds),
        };
        let positions = density_positions(piano, num_leds, reversed, mapping);

        let mapped = table.iter().filter(|leds| !leds.is_empty()).count();
        log::debug!(
            "key map built: {:?} mode, {} notes over {} LEDs",
            mapping.mode,
            mapped,
            num_leds
        );

        Self {
            piano,
            num_leds,
            reversed,
            mode: mapping.mode,
            table,
            positions,
        }
    }

    /// LEDs lit by `note`, ascending. Empty when the note has no mapping.
    pub fn leds_for(&self, note: u8) -> &[usize] {
        self.table.get(note as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn primary_led(&self, note: u8) -> Option<usize> {
        self.leds_for(note).first().copied()
    }

    /// Single LED under a note using the strip-density model.
    pub fn note_position(&self, note: u8) -> Option<usize> {
        self.positions.get(note as usize).copied().flatten()
    }

    pub fn num_leds(&self) -> usize {
        self.num_leds
    }

    pub fn piano(&self) -> PianoSpec {
        self.piano
    }

    pub fn mode(&self) -> MappingMode {
        self.mode
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }
}

fn empty_table() -> Vec<Vec<usize>> {
    vec![Vec::new(); NOTE_COUNT]
}

fn linear_table(piano: PianoSpec, num_leds: usize, reversed: bool) -> Vec<Vec<usize>> {
    let mut table = empty_table();
    if num_leds == 0 {
        return table;
    }
    let span = piano.max_note.saturating_sub(piano.min_note) as f64;
    let last = num_leds - 1;

    for note in piano.min_note..=piano.max_note {
        let index = if span == 0.0 {
            0
        } else {
            let raw = ((note - piano.min_note) as f64 * last as f64 / span).round();
            (raw as usize).min(last)
        };
        let index = if reversed { last - index } else { index };
        // custom ranges may run past the MIDI note range
        if let Some(slot) = table.get_mut(note as usize) {
            *slot = vec![index];
        }
    }
    table
}

fn auto_table(
    piano: PianoSpec,
    num_leds: usize,
    reversed: bool,
    base_offset: usize,
    leds_per_key: Option<usize>,
) -> Vec<Vec<usize>> {
    let mut table = empty_table();
    let usable = num_leds.saturating_sub(base_offset);
    let keys = piano.key_count.max(1);
    let (share, remainder) = match leds_per_key {
        Some(fixed) => (fixed, 0),
        None => (usable / keys, usable % keys),
    };

    let mut next = base_offset;
    for (key, note) in (piano.min_note..=piano.max_note).take(keys).enumerate() {
        let count = share + usize::from(key < remainder);
        let end = (next + count).min(num_leds);
        let mut leds: Vec<usize> = (next..end).collect();
        next = end;

        if reversed {
            // mirror inside [base_offset, num_leds) and keep ascending order
            for led in leds.iter_mut() {
                *led = base_offset + (num_leds - 1) - *led;
            }
            leds.reverse();
        }
        if let Some(slot) = table.get_mut(note as usize) {
            *slot = leds;
        }
    }
    table
}

fn manual_table(manual: &serde_json::Map<String, Value>, num_leds: usize) -> Vec<Vec<usize>> {
    let mut table = empty_table();
    for (key, value) in manual {
        let Ok(note) = key.trim().parse::<u8>() else {
            log::warn!("manual mapping: '{key}' is not a note number, skipped");
            continue;
        };
        if note as usize >= NOTE_COUNT {
            log::warn!("manual mapping: note {note} out of range, skipped");
            continue;
        }
        let leds = match value {
            Value::Number(n) => n.as_u64().map(|i| vec![i]),
            Value::Array(items) => items.iter().map(Value::as_u64).collect(),
            _ => None,
        };
        let Some(leds) = leds else {
            log::warn!("manual mapping: note {note} has an invalid entry {value}, skipped");
            continue;
        };
        let mut leds: Vec<usize> = leds
            .into_iter()
            .map(|i| i as usize)
            .filter(|i| {
                let ok = *i < num_leds;
                if !ok {
                    log::warn!("manual mapping: LED {i} for note {note} is past the strip");
                }
                ok
            })
            .collect();
        leds.sort_unstable();
        leds.dedup();
        table[note as usize] = leds;
    }
    table
}

fn density_positions(
    piano: PianoSpec,
    num_leds: usize,
    reversed: bool,
    mapping: &MappingSettings,
) -> Vec<Option<usize>> {
    let density = num_leds as f64 / piano.key_count.max(1) as f64;

    (0..NOTE_COUNT as u8)
        .map(|note| {
            let threshold_shift: i32 = mapping
                .note_offsets
                .iter()
                .filter(|(threshold, _)| note > *threshold)
                .map(|(_, shift)| *shift)
                .sum();
            let note_offset = (threshold_shift + mapping.shift) as f64;
            let raw = (density * (note as f64 - 20.0) - note_offset).floor() as i64;
            let pos = if reversed {
                num_leds as i64 - 1 - raw
            } else {
                raw
            };
            (0..num_leds as i64).contains(&pos).then_some(pos as usize)
        })
        .collect()
}
