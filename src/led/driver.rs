use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::color::{ChannelOrder, Rgb};
use super::ws2812::{encode_frame, pack_spi, SPI_BIT_NS};
use crate::config::{DriverSettings, LedSettings};
use crate::error::{LightsError, Result};

/// Backend that puts pixels on a physical (or pretend) strip.
///
/// `set_pixel` stages a value, `show` transmits everything staged and
/// blocks until the strip has latched it.
pub trait StripDriver: Send {
    fn name(&self) -> &'static str;

    fn is_hardware(&self) -> bool;

    fn set_pixel(&mut self, index: usize, color: Rgb) -> Result<()>;

    fn show(&mut self) -> Result<()>;

    fn release(&mut self) {}
}

/// Headless strip: keeps pixels in memory and counts transmissions.
pub struct SimulatedStrip {
    pixels: Vec<Rgb>,
    shows: Arc<AtomicUsize>,
}

impl SimulatedStrip {
    pub fn new(count: usize) -> Self {
        Self {
            pixels: vec![Rgb::BLACK; count],
            shows: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handle that keeps counting after the strip is boxed away.
    pub fn show_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.shows)
    }
}

impl StripDriver for SimulatedStrip {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) -> Result<()> {
        let slot = self
            .pixels
            .get_mut(index)
            .ok_or_else(|| LightsError::Driver(format!("pixel {index} out of range")))?;
        *slot = color;
        Ok(())
    }

    fn show(&mut self) -> Result<()> {
        self.shows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Bit-banged output through an SPI device node (MOSI wired to DIN).
pub struct SpiStrip {
    path: PathBuf,
    device: Option<File>,
    pixels: Vec<Rgb>,
    order: ChannelOrder,
}

impl SpiStrip {
    pub fn open(path: &Path, count: usize, order: ChannelOrder) -> Result<Self> {
        let device = OpenOptions::new().write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            device: Some(device),
            pixels: vec![Rgb::BLACK; count],
            order,
        })
    }
}

impl StripDriver for SpiStrip {
    fn name(&self) -> &'static str {
        "spi"
    }

    fn is_hardware(&self) -> bool {
        true
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) -> Result<()> {
        let slot = self
            .pixels
            .get_mut(index)
            .ok_or_else(|| LightsError::Driver(format!("pixel {index} out of range")))?;
        *slot = color;
        Ok(())
    }

    fn show(&mut self) -> Result<()> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        let stream = pack_spi(&encode_frame(&self.pixels, self.order), SPI_BIT_NS);
        device
            .write_all(&stream)
            .and_then(|_| device.flush())
            .map_err(|e| LightsError::Driver(format!("{}: {e}", self.path.display())))
    }

    fn release(&mut self) {
        self.device = None;
    }
}

#[cfg(feature = "hardware")]
pub use self::ws281x::Ws281xStrip;

#[cfg(feature = "hardware")]
mod ws281x {
    use super::*;

    pub struct Ws281xStrip {
        controller: Option<rs_ws281x::Controller>,
    }

    // The controller wraps raw pointers into the DMA buffers. The renderer
    // only ever touches it behind its own mutex.
    unsafe impl Send for Ws281xStrip {}

    impl Ws281xStrip {
        pub fn open(pin: i32, dma: i32, count: usize, order: ChannelOrder) -> Result<Self> {
            let strip_type = match order {
                ChannelOrder::Rgb => rs_ws281x::StripType::Ws2811Rgb,
                ChannelOrder::Grb => rs_ws281x::StripType::Ws2811Grb,
                ChannelOrder::Brg => rs_ws281x::StripType::Ws2811Brg,
                ChannelOrder::Bgr => rs_ws281x::StripType::Ws2811Bgr,
            };
            let channel = rs_ws281x::ChannelBuilder::new()
                .pin(pin)
                .count(count as i32)
                .brightness(255)
                .strip_type(strip_type)
                .build();

            let controller = rs_ws281x::ControllerBuilder::new()
                .freq(800_000)
                .dma(dma)
                .channel(0, channel)
                .build()
                .map_err(|e| LightsError::Driver(format!("{e:?}")))?;

            Ok(Self {
                controller: Some(controller),
            })
        }
    }

    impl StripDriver for Ws281xStrip {
        fn name(&self) -> &'static str {
            "ws281x"
        }

        fn is_hardware(&self) -> bool {
            true
        }

        fn set_pixel(&mut self, index: usize, color: Rgb) -> Result<()> {
            let Some(controller) = self.controller.as_mut() else {
                return Ok(());
            };
            let leds = controller.leds_mut(0);
            let slot = leds
                .get_mut(index)
                .ok_or_else(|| LightsError::Driver(format!("pixel {index} out of range")))?;
            *slot = color.to_bgrw();
            Ok(())
        }

        fn show(&mut self) -> Result<()> {
            match self.controller.as_mut() {
                Some(controller) => controller
                    .render()
                    .map_err(|e| LightsError::Driver(format!("{e:?}"))),
                None => Ok(()),
            }
        }

        fn release(&mut self) {
            // dropping the controller runs ws2811_fini
            self.controller = None;
        }
    }
}

/// Open the configured driver, falling back to simulation when the
/// hardware is missing or refuses to initialise.
pub fn open_driver(settings: &LedSettings) -> Box<dyn StripDriver> {
    match try_open(settings) {
        Ok(driver) => {
            log::info!("LED driver '{}' ready for {} pixels", driver.name(), settings.count);
            driver
        }
        Err(e) => {
            log::warn!("LED hardware unavailable ({e}), running in simulation mode");
            Box::new(SimulatedStrip::new(settings.count))
        }
    }
}

fn try_open(settings: &LedSettings) -> Result<Box<dyn StripDriver>> {
    match &settings.driver {
        DriverSettings::Simulated => Ok(Box::new(SimulatedStrip::new(settings.count))),
        DriverSettings::Spi { device, order } => {
            Ok(Box::new(SpiStrip::open(device, settings.count, *order)?))
        }
        #[cfg(feature = "hardware")]
        DriverSettings::Ws281x { pin, dma, order } => Ok(Box::new(Ws281xStrip::open(
            *pin,
            *dma,
            settings.count,
            *order,
        )?)),
        #[cfg(not(feature = "hardware"))]
        DriverSettings::Ws281x { .. } => Err(LightsError::Driver(
            "built without the `hardware` feature".into(),
        )),
    }
}
