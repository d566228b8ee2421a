//! Peer management module
//!
//! Per-peer protocol state and the connection task that drives it.

pub mod bitfield;
pub mod connection;
pub mod state;

// Re-export main types
pub use bitfield::Bitfield;
pub use connection::{PeerCommand, PeerConfig, PeerConnection, PeerEvent, PeerEventKind};
pub use state::{HandshakeStatus, Peer, PeerState, PeerStats};
