//! Torrent metadata module
//!
//! Decodes `.torrent` files into the descriptor the rest of the engine reads.

pub mod parser;
pub mod info;

pub use parser::TorrentParser;
pub use info::{TorrentInfo, TorrentFile};
