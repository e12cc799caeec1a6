use serde::{Deserialize, Serialize};

/// One pixel, 0-255 per channel in canonical RGB order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn is_black(&self) -> bool {
        *self == Self::BLACK
    }

    /// Multiply every channel by `factor`, clamped to [0, 1].
    pub fn scale(self, factor: f32) -> Self {
        let factor = factor.clamp(0.0, 1.0);
        let apply = |c: u8| (c as f32 * factor).round() as u8;
        Self::new(apply(self.r), apply(self.g), apply(self.b))
    }

    /// rs_ws281x expects `[b, g, r, w]` per LED.
    pub fn to_bgrw(self) -> [u8; 4] {
        [self.b, self.g, self.r, 0]
    }
}

/// Strip-native byte order used on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    #[default]
    Grb,
    Brg,
    Bgr,
}

impl ChannelOrder {
    pub fn arrange(self, c: Rgb) -> [u8; 3] {
        match self {
            ChannelOrder::Rgb => [c.r, c.g, c.b],
            ChannelOrder::Grb => [c.g, c.r, c.b],
            ChannelOrder::Brg => [c.b, c.r, c.g],
            ChannelOrder::Bgr => [c.b, c.g, c.r],
        }
    }
}

/// Twelve hues, 30 degrees apart, starting at red for C.
const CHROMATIC_WHEEL: [Rgb; 12] = [
    Rgb::new(255, 0, 0),   // C
    Rgb::new(255, 127, 0), // C#
    Rgb::new(255, 255, 0), // D
    Rgb::new(127, 255, 0), // D#
    Rgb::new(0, 255, 0),   // E
    Rgb::new(0, 255, 127), // F
    Rgb::new(0, 255, 255), // F#
    Rgb::new(0, 127, 255), // G
    Rgb::new(0, 0, 255),   // G#
    Rgb::new(127, 0, 255), // A
    Rgb::new(255, 0, 255), // A#
    Rgb::new(255, 0, 127), // B
];

const MIN_BRIGHTNESS: f32 = 0.1;

/// Fixed palette colour for a note, chosen by pitch class.
pub fn wheel_color(note: u8) -> Rgb {
    CHROMATIC_WHEEL[(note % 12) as usize]
}

/// Linear velocity to brightness map, floored so soft notes stay visible.
pub fn velocity_brightness(velocity: u8) -> f32 {
    let v = velocity.min(127) as f32 / 127.0;
    MIN_BRIGHTNESS + (1.0 - MIN_BRIGHTNESS) * v
}

/// Colour for a sounding note: wheel hue scaled by its velocity.
pub fn note_color(note: u8, velocity: u8) -> Rgb {
    wheel_color(note).scale(velocity_brightness(velocity))
}
