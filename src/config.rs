use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LightsError, Result};
use crate::led::ChannelOrder;

/// Everything the core reads at construction or on reconfiguration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub piano: PianoSize,
    pub led: LedSettings,
    pub mapping: MappingSettings,
    pub unifier: UnifierSettings,
    pub playback: PlaybackSettings,
    pub live: LiveSettings,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let spec = self.piano.spec();
        if spec.min_note > spec.max_note || spec.max_note > 127 {
            return Err(LightsError::config(format!(
                "bad MIDI range {}..={}",
                spec.min_note, spec.max_note
            )));
        }
        if spec.key_count == 0 {
            return Err(LightsError::config("piano needs at least one key"));
        }
        if self.led.count == 0 {
            return Err(LightsError::config("LED count must be positive"));
        }
        if self.mapping.base_offset >= self.led.count {
            return Err(LightsError::config(format!(
                "base offset {} leaves no LEDs out of {}",
                self.mapping.base_offset, self.led.count
            )));
        }
        if self.unifier.buffer_capacity == 0 {
            return Err(LightsError::config("unifier buffer needs room for one event"));
        }
        if self.playback.tempo_min <= 0.0 || self.playback.tempo_min > self.playback.tempo_max {
            return Err(LightsError::config("tempo range must be positive and ordered"));
        }
        Ok(())
    }
}

/// Key count plus the MIDI range it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PianoSpec {
    pub key_count: usize,
    pub min_note: u8,
    pub max_note: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PianoSize {
    #[default]
    Keys88,
    Keys76,
    Keys73,
    Keys61,
    Keys49,
    Keys37,
    Keys25,
    Custom(PianoSpec),
}

impl PianoSize {
    pub fn spec(&self) -> PianoSpec {
        let (key_count, min_note, max_note) = match *self {
            PianoSize::Keys88 => (88, 21, 108),
            PianoSize::Keys76 => (76, 28, 103),
            PianoSize::Keys73 => (73, 28, 100),
            PianoSize::Keys61 => (61, 36, 96),
            PianoSize::Keys49 => (49, 36, 84),
            PianoSize::Keys37 => (37, 41, 77),
            PianoSize::Keys25 => (25, 48, 72),
            PianoSize::Custom(spec) => return spec,
        };
        PianoSpec {
            key_count,
            min_note,
            max_note,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedSettings {
    pub count: usize,
    pub reversed: bool,
    pub brightness: f32,
    pub driver: DriverSettings,
}

impl Default for LedSettings {
    fn default() -> Self {
        Self {
            count: 176,
            reversed: false,
            brightness: 1.0,
            driver: DriverSettings::Simulated,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverSettings {
    #[default]
    Simulated,
    Ws281x {
        pin: i32,
        dma: i32,
        #[serde(default)]
        order: ChannelOrder,
    },
    Spi {
        device: PathBuf,
        #[serde(default)]
        order: ChannelOrder,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    /// One LED per note spread linearly over the strip.
    Linear,
    /// LEDs divided between keys, remainder to the lowest keys.
    #[default]
    Auto,
    /// Explicit table from the settings.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSettings {
    pub mode: MappingMode,
    /// Fixed LEDs per key in auto mode instead of an even split.
    pub leds_per_key: Option<usize>,
    pub base_offset: usize,
    /// Note (as string key) to LED index or list of indices.
    pub manual: serde_json::Map<String, serde_json::Value>,
    /// `(threshold, shift)`: notes above `threshold` move by `shift` LEDs.
    pub note_offsets: Vec<(u8, i32)>,
    pub shift: i32,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            mode: MappingMode::Auto,
            leds_per_key: None,
            base_offset: 0,
            manual: serde_json::Map::new(),
            note_offsets: Vec::new(),
            shift: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifierSettings {
    pub dedup_window_ms: u64,
    pub buffer_capacity: usize,
}

impl Default for UnifierSettings {
    fn default() -> Self {
        Self {
            dedup_window_ms: 50,
            buffer_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub tick_ms: u64,
    pub render_hz: f64,
    pub status_hz: f64,
    pub onset_window_ms: u64,
    pub tempo_min: f64,
    pub tempo_max: f64,
    pub stop_timeout_ms: u64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            tick_ms: 5,
            render_hz: 60.0,
            status_hz: 4.0,
            onset_window_ms: 20,
            tempo_min: 0.1,
            tempo_max: 4.0,
            stop_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Substring of the MIDI port to open; first available when unset.
    pub device: Option<String>,
    pub max_peers: usize,
    pub udp_bind: Option<SocketAddr>,
    pub stop_timeout_ms: u64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            device: None,
            max_peers: 8,
            udp_bind: None,
            stop_timeout_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.piano.spec().key_count, 88);
        assert_eq!(settings.unifier.dedup_window_ms, 50);
        settings.validate().unwrap();
    }

    #[test]
    fn parses_driver_and_piano() {
        let json = r#"{
            "piano": "keys61",
            "led": { "count": 122, "reversed": true,
                     "driver": { "kind": "ws281x", "pin": 18, "dma": 10 } },
            "mapping": { "mode": "manual", "manual": { "60": [3, 4] } }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.piano.spec().min_note, 36);
        assert!(settings.led.reversed);
        assert_eq!(
            settings.led.driver,
            DriverSettings::Ws281x {
                pin: 18,
                dma: 10,
                order: ChannelOrder::Grb
            }
        );
        assert_eq!(settings.mapping.mode, MappingMode::Manual);
    }

    #[test]
    fn custom_piano_range() {
        let json = r#"{ "piano": { "custom": { "key_count": 12, "min_note": 60, "max_note": 71 } } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.piano.spec().max_note, 71);
    }

    #[test]
    fn rejects_offset_past_strip() {
        let mut settings = Settings::default();
        settings.mapping.base_offset = settings.led.count;
        assert!(matches!(settings.validate(), Err(LightsError::Config(_))));
    }

    #[test]
    fn load_reports_bad_json() {
        let path = std::env::temp_dir().join(format!("piano-lights-cfg-{}.json", std::process::id()));
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(LightsError::Json(_))));
        let _ = fs::remove_file(&path);
    }
}
