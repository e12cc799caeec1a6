use crate::playback::timeline::ParseError;

/// Result alias carrying [`LightsError`].
pub type Result<T> = std::result::Result<T, LightsError>;

/// Errors surfaced by the LED core to its callers.
///
/// Recoverable faults inside the live path (overflowing buffers, bad
/// messages, single pixel write failures) are logged where they happen and
/// never show up here.
#[derive(Debug, thiserror::Error)]
pub enum LightsError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MIDI device error: {0}")]
    Device(String),

    #[error("no MIDI input device available")]
    NoDevice,

    #[error("source is already running")]
    AlreadyRunning,

    #[error("peer limit of {0} reached")]
    PeerLimit(usize),

    #[error("failed to load timeline: {0}")]
    Load(#[from] ParseError),

    #[error("no timeline loaded")]
    NotLoaded,

    #[error("playback is in the error state, load a new file first")]
    PlaybackFailed,

    #[error("LED driver error: {0}")]
    Driver(String),
}

impl LightsError {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }
}
