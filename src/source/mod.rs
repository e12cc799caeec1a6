//! Live note sources.

pub mod local;
pub mod network;
pub mod udp;

pub use local::{default_backend, DeviceBackend, DeviceConnection, LocalDeviceAdapter, NoDeviceBackend};
pub use network::{NetworkPeerAdapter, PeerNote, PeerService, PeerSession, PeerStatus};
pub use udp::UdpPeerService;
