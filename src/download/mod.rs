//! Download orchestration
//!
//! Ties tracker discovery, peer connections, the piece manager and storage
//! together for one torrent.

pub mod coordinator;

pub use coordinator::{CoordinatorConfig, DownloadCoordinator, DownloadSummary};
