//! WS2812B single-wire waveform.
//!
//! Every data bit is one high/low pulse pair, the ratio encodes the value.
//! Bytes go out MSB-first in the strip's native channel order and a frame is
//! latched by holding the line low for the reset period.

use super::color::{ChannelOrder, Rgb};

pub const T0H_NS: u32 = 400;
pub const T0L_NS: u32 = 850;
pub const T1H_NS: u32 = 800;
pub const T1L_NS: u32 = 450;
pub const RESET_NS: u32 = 80_000;

/// SPI clock that makes one WS2812 bit three SPI bits wide.
pub const SPI_BIT_NS: u32 = 417;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub high_ns: u32,
    pub low_ns: u32,
}

impl Pulse {
    pub const ONE: Pulse = Pulse {
        high_ns: T1H_NS,
        low_ns: T1L_NS,
    };
    pub const ZERO: Pulse = Pulse {
        high_ns: T0H_NS,
        low_ns: T0L_NS,
    };
    pub const RESET: Pulse = Pulse {
        high_ns: 0,
        low_ns: RESET_NS,
    };

    pub fn for_bit(bit: bool) -> Self {
        if bit {
            Self::ONE
        } else {
            Self::ZERO
        }
    }

    pub fn duration_ns(&self) -> u64 {
        self.high_ns as u64 + self.low_ns as u64
    }
}

/// Serialize a frame into its pulse train, reset pulse included.
pub fn encode_frame(frame: &[Rgb], order: ChannelOrder) -> Vec<Pulse> {
    let mut pulses = Vec::with_capacity(frame.len() * 24 + 1);
    for pixel in frame {
        for byte in order.arrange(*pixel) {
            for bit in (0..8).rev() {
                pulses.push(Pulse::for_bit(byte & (1 << bit) != 0));
            }
        }
    }
    pulses.push(Pulse::RESET);
    pulses
}

/// Total time on the wire for a pulse train.
pub fn transmit_time_ns(pulses: &[Pulse]) -> u64 {
    pulses.iter().map(Pulse::duration_ns).sum()
}

/// Quantise a pulse train onto a fixed-rate bit clock (MSB-first bytes).
///
/// Each high and low phase becomes the nearest whole number of clock bits.
/// Data phases never round down to nothing, the reset high phase (0 ns) does.
pub fn pack_spi(pulses: &[Pulse], bit_ns: u32) -> Vec<u8> {
    let bits_for = |ns: u32| -> usize {
        if ns == 0 {
            0
        } else {
            ((ns as f64 / bit_ns as f64).round() as usize).max(1)
        }
    };

    let mut writer = BitWriter::default();
    for pulse in pulses {
        writer.push_run(true, bits_for(pulse.high_ns));
        writer.push_run(false, bits_for(pulse.low_ns));
    }
    writer.finish()
}

#[derive(Default)]
struct BitWriter {
    out: Vec<u8>,
    acc: u8,
    filled: u8,
}

impl BitWriter {
    fn push_run(&mut self, bit: bool, count: usize) {
        for _ in 0..count {
            self.acc = (self.acc << 1) | bit as u8;
            self.filled += 1;
            if self.filled == 8 {
                self.out.push(self.acc);
                self.acc = 0;
                self.filled = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.filled != 0 {
            self.acc <<= 8 - self.filled;
            self.out.push(self.acc);
        }
        self.out
    }
}
