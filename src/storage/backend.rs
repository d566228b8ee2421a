//! Storage backend abstraction for torrent downloads
//!
//! The coordinator writes each verified piece through this trait at its
//! absolute offset in the torrent's byte stream. Backends decide how that
//! stream maps onto files or memory.

use async_trait::async_trait;
use bytes::Bytes;
use anyhow::Result;

/// Abstract storage backend for torrent data
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepare the destination (directories, pre-sized files)
    async fn initialize(&self) -> Result<()>;

    /// Write bytes at an absolute stream offset
    ///
    /// Called once per verified piece; the range never overlaps another
    /// piece's range.
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Read `length` bytes at an absolute stream offset
    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>>;
}

