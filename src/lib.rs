//! torrent-fetch
//!
//! A BitTorrent retrieval engine: UDP tracker discovery, the peer wire
//! protocol, rarest-first piece selection with SHA1 verification, and a
//! coordinator that writes verified pieces to storage.

pub mod cli;
pub mod download;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use error::TorrentError;

pub use cli::{CliArgs, Config};
pub use download::{CoordinatorConfig, DownloadCoordinator, DownloadSummary};
pub use peer::{Bitfield, PeerConnection, PeerState};
pub use protocol::{Handshake, Message, MessageId};
pub use storage::{FileStorage, MemoryStorage, PieceManager, PieceStatus, StorageBackend};
pub use torrent::{TorrentInfo, TorrentParser};
pub use tracker::{AnnounceResponse, TrackerClient, TrackerEvent};
