//! Outgoing events for the transport layer.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::note::{SourceKind, UnifiedEvent};
use crate::playback::PlaybackStatus;

const HUB_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum CoreEvent {
    Note(UnifiedEvent),
    Playback(PlaybackStatus),
    Source(SourceStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source: SourceKind,
    pub state: SourceState,
    /// Device name, peer count or error text.
    pub detail: Option<String>,
}

/// Broadcast fan-out. Publishing never blocks; a subscriber that falls
/// behind sees `RecvError::Lagged` and skips ahead.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn source_status(&self, source: SourceKind, state: SourceState, detail: Option<String>) {
        self.publish(CoreEvent::Source(SourceStatus {
            source,
            state,
            detail,
        }));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
