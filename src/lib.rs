//! Piano-driven LED strip core.
//!
//! Live notes from a local MIDI device and from network peers are merged
//! by the [`unifier`], drawn on the strip through the [`led`] renderer and
//! mixed with timeline [`playback`]. [`context::LightsContext`] owns all of
//! it and exposes a command API plus an event feed.

pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod keymap;
pub mod led;
pub mod note;
pub mod playback;
pub mod source;
pub mod unifier;

pub use config::Settings;
pub use context::{Command, LightsContext};
pub use error::{LightsError, Result};
pub use hub::{CoreEvent, EventHub};
