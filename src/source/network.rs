//! Notes arriving from network peers.
//!
//! Session handling (discovery, handshakes, the wire protocol) belongs to a
//! [`PeerService`]. The adapter only keeps the peer registry and turns
//! decoded notes into [`NoteEvent`]s for the unifier. It never writes to the
//! strip itself.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::Serialize;

use crate::error::{LightsError, Result};
use crate::hub::{EventHub, SourceState};
use crate::note::{NoteEvent, NoteKind, SourceKind};
use crate::unifier::EventUnifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Connected,
    /// At least one note received.
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSession {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub status: PeerStatus,
    pub connected_at: SystemTime,
}

/// A note command as decoded by the session collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerNote {
    pub kind: NoteKind,
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
}

impl PeerNote {
    pub fn on(note: u8, velocity: u8) -> Self {
        Self {
            kind: NoteKind::On,
            channel: 0,
            note,
            velocity,
        }
    }

    pub fn off(note: u8) -> Self {
        Self {
            kind: NoteKind::Off,
            channel: 0,
            note,
            velocity: 0,
        }
    }
}

/// The session collaborator feeding a [`NetworkPeerAdapter`].
pub trait PeerService: Send {
    fn name(&self) -> &str;

    /// Begin accepting peers. Must run inside a tokio runtime.
    fn start(&mut self, adapter: Arc<NetworkPeerAdapter>) -> Result<()>;

    /// Stop accepting peers and disconnect the ones this service added.
    fn stop(&mut self);
}

pub struct NetworkPeerAdapter {
    sessions: RwLock<BTreeMap<String, PeerSession>>,
    max_peers: AtomicUsize,
    unifier: Arc<EventUnifier>,
    hub: EventHub,
}

impl NetworkPeerAdapter {
    pub fn new(max_peers: usize, unifier: Arc<EventUnifier>, hub: EventHub) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            max_peers: AtomicUsize::new(max_peers),
            unifier,
            hub,
        }
    }

    /// Register a peer. Reconnecting a known name updates its address.
    ///
    /// Fails with [`LightsError::PeerLimit`], changing nothing, when the
    /// registry is full.
    pub fn connect_peer(&self, name: &str, address: IpAddr, port: u16) -> Result<()> {
        let count = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = sessions.get_mut(name) {
                existing.address = address;
                existing.port = port;
                return Ok(());
            }
            let max = self.max_peers();
            if sessions.len() >= max {
                log::warn!("rejecting peer {name}: limit of {max} reached");
                return Err(LightsError::PeerLimit(max));
            }
            sessions.insert(
                name.to_owned(),
                PeerSession {
                    name: name.to_owned(),
                    address,
                    port,
                    status: PeerStatus::Connected,
                    connected_at: SystemTime::now(),
                },
            );
            sessions.len()
        };
        log::info!("peer {name} connected from {address}:{port}");
        self.publish_count(count);
        Ok(())
    }

    /// Remove a peer. Returns false if it was not registered.
    pub fn disconnect_peer(&self, name: &str) -> bool {
        let (removed, count) = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            (sessions.remove(name).is_some(), sessions.len())
        };
        if removed {
            log::info!("peer {name} disconnected");
            self.publish_count(count);
        }
        removed
    }

    /// Forward a decoded note from `peer` to the unifier. Notes from
    /// unregistered peers and out-of-range values are dropped.
    pub fn on_note(&self, peer: &str, note: PeerNote) -> bool {
        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            let Some(session) = sessions.get_mut(peer) else {
                log::debug!("note from unknown peer {peer} dropped");
                return false;
            };
            session.status = PeerStatus::Active;
        }
        let Some(event) = NoteEvent::new(note.kind, note.channel, note.note, note.velocity, peer)
        else {
            log::debug!("invalid note {note:?} from {peer} dropped");
            return false;
        };
        log::debug!("{peer}: {:?} {} vel {}", event.kind, event.note, event.velocity);
        self.unifier.ingest(SourceKind::NetworkPeer, event);
        true
    }

    pub fn peers(&self) -> Vec<PeerSession> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().cloned().collect()
    }

    pub fn is_connected(&self, name: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.contains_key(name)
    }

    pub fn peer_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers.load(Ordering::Relaxed)
    }

    /// Change the cap. Peers already connected stay even if over it.
    pub fn set_max_peers(&self, max: usize) {
        self.max_peers.store(max, Ordering::Relaxed);
    }

    fn publish_count(&self, count: usize) {
        let state = if count == 0 {
            SourceState::Idle
        } else {
            SourceState::Running
        };
        let detail = format!("{count} peer{}", if count == 1 { "" } else { "s" });
        self.hub
            .source_status(SourceKind::NetworkPeer, state, Some(detail));
    }
}
