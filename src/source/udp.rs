//! Plain-text UDP peers.
//!
//! Each datagram carries one or more `"<note> <velocity>;"` commands. A
//! velocity of 0 releases the note. The sender's address is the peer name
//! and is registered with the adapter on its first datagram.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::str;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::network::{NetworkPeerAdapter, PeerNote, PeerService};
use crate::error::Result;

const MAX_DATAGRAM: usize = 512;

/// Decode the commands in a datagram. Malformed commands are skipped.
pub fn parse_datagram(bytes: &[u8]) -> Vec<PeerNote> {
    let Ok(text) = str::from_utf8(bytes) else {
        return Vec::new();
    };
    text.split(';')
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .filter_map(|command| {
            let mut parts = command.split_whitespace();
            let note = parts.next()?.parse::<u8>().ok()?;
            let velocity = parts.next()?.parse::<u8>().ok()?;
            if parts.next().is_some() || note > 127 || velocity > 127 {
                log::debug!("ignoring UDP command '{command}'");
                return None;
            }
            Some(if velocity == 0 {
                PeerNote::off(note)
            } else {
                PeerNote::on(note, velocity)
            })
        })
        .collect()
}

pub struct UdpPeerService {
    bind: SocketAddr,
    local_addr: Option<SocketAddr>,
    registered: Arc<Mutex<HashSet<String>>>,
    adapter: Option<Arc<NetworkPeerAdapter>>,
    task: Option<JoinHandle<()>>,
}

impl UdpPeerService {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            local_addr: None,
            registered: Arc::new(Mutex::new(HashSet::new())),
            adapter: None,
            task: None,
        }
    }

    /// Bound address once started; useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl PeerService for UdpPeerService {
    fn name(&self) -> &str {
        "udp"
    }

    fn start(&mut self, adapter: Arc<NetworkPeerAdapter>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let socket = std::net::UdpSocket::bind(self.bind)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        let local_addr = socket.local_addr()?;
        log::info!("listening for UDP notes on {local_addr}");

        let listener = Listener {
            socket,
            adapter: Arc::clone(&adapter),
            registered: Arc::clone(&self.registered),
        };
        self.task = Some(tokio::spawn(listener.run()));
        self.local_addr = Some(local_addr);
        self.adapter = Some(adapter);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let names: Vec<String> = self
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if let Some(adapter) = self.adapter.take() {
            for name in names {
                adapter.disconnect_peer(&name);
            }
        }
        self.local_addr = None;
    }
}

impl Drop for UdpPeerService {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Listener {
    socket: UdpSocket,
    adapter: Arc<NetworkPeerAdapter>,
    registered: Arc<Mutex<HashSet<String>>>,
}

impl Listener {
    async fn run(self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("UDP receive failed: {e}");
                    continue;
                }
            };
            let notes = parse_datagram(&buf[..len]);
            if notes.is_empty() {
                log::debug!("no notes in datagram from {from}");
                continue;
            }
            let peer = from.to_string();
            if !self.adapter.is_connected(&peer) {
                if self
                    .adapter
                    .connect_peer(&peer, from.ip(), from.port())
                    .is_err()
                {
                    continue;
                }
                self.registered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(peer.clone());
            }
            for note in notes {
                self.adapter.on_note(&peer, note);
            }
        }
    }
}
