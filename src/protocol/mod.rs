//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol: handshake, messages and
//! frame reassembly.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LENGTH, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, FrameBuffer, WireProtocol, MAX_FRAME_LENGTH};
