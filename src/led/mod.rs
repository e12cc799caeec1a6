//! Pixel framebuffer shared by every LED writer.
//!
//! The frame lives behind one mutex inside [`LedRenderer`]; writers never
//! hold it across a flush of another writer. Nothing here arbitrates
//! *between* writers, that is what [`OutputArbiter`] is for.

pub mod color;
pub mod driver;
pub mod ws2812;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

pub use color::{note_color, velocity_brightness, wheel_color, ChannelOrder, Rgb};
pub use driver::{open_driver, SimulatedStrip, SpiStrip, StripDriver};

use crate::config::LedSettings;

struct Frame {
    pixels: Vec<Rgb>,
    driver: Box<dyn StripDriver>,
    brightness: f32,
    released: bool,
}

impl Frame {
    /// Stage a pixel on the driver. A failing pixel is logged and skipped.
    fn stage(&mut self, index: usize, color: Rgb) {
        let scaled = color.scale(self.brightness);
        if let Err(e) = self.driver.set_pixel(index, scaled) {
            log::warn!("skipping pixel {index}: {e}");
        }
    }
}

pub struct LedRenderer {
    frame: Mutex<Frame>,
    writes: AtomicU64,
}

impl LedRenderer {
    pub fn new(count: usize, brightness: f32, driver: Box<dyn StripDriver>) -> Self {
        Self {
            frame: Mutex::new(Frame {
                pixels: vec![Rgb::BLACK; count],
                driver,
                brightness: brightness.clamp(0.0, 1.0),
                released: false,
            }),
            writes: AtomicU64::new(0),
        }
    }

    /// Renderer on the configured driver, simulated if the hardware is absent.
    pub fn open(settings: &LedSettings) -> Self {
        Self::new(settings.count, settings.brightness, open_driver(settings))
    }

    pub fn simulated(count: usize) -> Self {
        Self::new(count, 1.0, Box::new(SimulatedStrip::new(count)))
    }

    fn lock(&self) -> MutexGuard<'_, Frame> {
        // a panicking writer cannot leave the frame half-typed, keep going
        self.frame.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn num_pixels(&self) -> usize {
        self.lock().pixels.len()
    }

    pub fn is_hardware(&self) -> bool {
        let frame = self.lock();
        !frame.released && frame.driver.is_hardware()
    }

    pub fn pixel(&self, index: usize) -> Option<Rgb> {
        self.lock().pixels.get(index).copied()
    }

    /// Copy of the whole in-memory frame.
    pub fn frame(&self) -> Vec<Rgb> {
        self.lock().pixels.clone()
    }

    /// Number of transmissions issued so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Set one pixel and show it. Returns false without touching the
    /// hardware if the index is out of range or the colour is unchanged.
    pub fn set_pixel(&self, index: usize, color: Rgb) -> bool {
        let mut frame = self.lock();
        match frame.pixels.get(index) {
            Some(current) if *current != color => {}
            Some(_) => return false,
            None => {
                log::debug!("ignoring write to pixel {index}");
                return false;
            }
        }
        frame.pixels[index] = color;
        frame.stage(index, color);
        self.show(&mut frame);
        true
    }

    /// Apply a batch of pixel changes and flush once. Unchanged pixels and
    /// out-of-range indices are skipped; returns how many pixels changed.
    pub fn set_many<I>(&self, changes: I) -> usize
    where
        I: IntoIterator<Item = (usize, Rgb)>,
    {
        let mut frame = self.lock();
        let mut changed = 0;
        for (index, color) in changes {
            match frame.pixels.get(index) {
                Some(current) if *current == color => continue,
                Some(_) => {}
                None => {
                    log::debug!("ignoring write to pixel {index}");
                    continue;
                }
            }
            frame.pixels[index] = color;
            frame.stage(index, color);
            changed += 1;
        }
        if changed > 0 {
            self.show(&mut frame);
        }
        changed
    }

    /// Replace the whole frame; pixels past the end of `target` go dark.
    pub fn render_frame(&self, target: &[Rgb]) -> usize {
        let count = self.num_pixels();
        self.set_many((0..count).map(|i| (i, target.get(i).copied().unwrap_or_default())))
    }

    /// Push the current frame to the strip.
    pub fn flush(&self) {
        let mut frame = self.lock();
        self.show(&mut frame);
    }

    /// Blank every pixel and flush.
    pub fn clear(&self) {
        let mut frame = self.lock();
        Self::blank(&mut frame);
        self.show(&mut frame);
    }

    /// Blank, flush and release the hardware. Later calls are no-ops.
    pub fn cleanup(&self) {
        let mut frame = self.lock();
        if frame.released {
            return;
        }
        Self::blank(&mut frame);
        self.show(&mut frame);
        frame.driver.release();
        frame.released = true;
        log::info!("LED driver '{}' released", frame.driver.name());
    }

    fn blank(frame: &mut Frame) {
        for index in 0..frame.pixels.len() {
            frame.pixels[index] = Rgb::BLACK;
            frame.stage(index, Rgb::BLACK);
        }
    }

    fn show(&self, frame: &mut Frame) {
        if frame.released {
            return;
        }
        if let Err(e) = frame.driver.show() {
            log::error!("LED flush failed: {e}");
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decides which writer owns the strip.
///
/// Playback takes exclusive ownership while a session is playing or
/// paused; the live local-device path only draws when it holds the strip.
#[derive(Debug, Default)]
pub struct OutputArbiter {
    playback: AtomicBool,
}

impl OutputArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim_for_playback(&self) {
        if !self.playback.swap(true, Ordering::SeqCst) {
            log::info!("playback took over the LED strip");
        }
    }

    pub fn release_to_live(&self) {
        if self.playback.swap(false, Ordering::SeqCst) {
            log::info!("LED strip returned to live input");
        }
    }

    pub fn live_may_render(&self) -> bool {
        !self.playback.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LightsError, Result};

    #[test]
    fn same_color_write_is_skipped() {
        let renderer = LedRenderer::simulated(10);
        let red = Rgb::new(255, 0, 0);

        assert!(renderer.set_pixel(3, red));
        assert_eq!(renderer.write_count(), 1);
        assert!(!renderer.set_pixel(3, red));
        assert_eq!(renderer.write_count(), 1);
        assert_eq!(renderer.pixel(3), Some(red));
    }

    #[test]
    fn out_of_range_is_ignored() {
        let renderer = LedRenderer::simulated(4);
        assert!(!renderer.set_pixel(4, Rgb::new(1, 1, 1)));
        assert_eq!(renderer.set_many([(9, Rgb::new(1, 1, 1))]), 0);
        assert_eq!(renderer.write_count(), 0);
        assert_eq!(renderer.frame().len(), 4);
    }

    #[test]
    fn batch_flushes_once() {
        let renderer = LedRenderer::simulated(16);
        let blue = Rgb::new(0, 0, 255);
        let changed = renderer.set_many((0..8).map(|i| (i, blue)));
        assert_eq!(changed, 8);
        assert_eq!(renderer.write_count(), 1);

        // repeating the same batch is a no-op
        assert_eq!(renderer.set_many((0..8).map(|i| (i, blue))), 0);
        assert_eq!(renderer.write_count(), 1);
    }

    #[test]
    fn render_frame_blanks_the_rest() {
        let renderer = LedRenderer::simulated(6);
        renderer.set_many((0..6).map(|i| (i, Rgb::new(9, 9, 9))));
        renderer.render_frame(&[Rgb::new(1, 2, 3)]);
        let frame = renderer.frame();
        assert_eq!(frame[0], Rgb::new(1, 2, 3));
        assert!(frame[1..].iter().all(Rgb::is_black));
    }

    struct FlakyStrip {
        staged: Vec<usize>,
    }

    impl StripDriver for FlakyStrip {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn is_hardware(&self) -> bool {
            true
        }

        fn set_pixel(&mut self, index: usize, _color: Rgb) -> Result<()> {
            if index == 2 {
                return Err(LightsError::Driver("stuck pixel".into()));
            }
            self.staged.push(index);
            Ok(())
        }

        fn show(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn pixel_failure_does_not_abort_batch() {
        let renderer = LedRenderer::new(5, 1.0, Box::new(FlakyStrip { staged: vec![] }));
        let changed = renderer.set_many((0..5).map(|i| (i, Rgb::new(10, 0, 0))));
        assert_eq!(changed, 5);
        assert_eq!(renderer.write_count(), 1);
        assert!(renderer.frame().iter().all(|p| *p == Rgb::new(10, 0, 0)));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let renderer = LedRenderer::simulated(3);
        renderer.set_pixel(0, Rgb::new(5, 5, 5));
        renderer.cleanup();
        let writes = renderer.write_count();
        assert!(renderer.frame().iter().all(Rgb::is_black));
        renderer.cleanup();
        assert_eq!(renderer.write_count(), writes);
        assert!(!renderer.is_hardware());
    }

    #[test]
    fn arbiter_hands_strip_back() {
        let arbiter = OutputArbiter::new();
        assert!(arbiter.live_may_render());
        arbiter.claim_for_playback();
        assert!(!arbiter.live_may_render());
        arbiter.release_to_live();
        assert!(arbiter.live_may_render());
    }
}
