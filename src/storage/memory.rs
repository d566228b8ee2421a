//! In-memory storage backend
//!
//! Keeps the whole torrent in one buffer and records every write, which is
//! what tests and dry runs want.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::TorrentError;
use crate::storage::backend::StorageBackend;

#[derive(Debug)]
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
    writes: Mutex<Vec<(u64, usize)>>,
    fail_writes: AtomicBool,
    write_delay: Duration,
}

impl MemoryStorage {
    pub fn new(total_size: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; total_size as usize]),
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            write_delay: Duration::ZERO,
        }
    }

    /// Make every write take `delay` before it lands or fails
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// A backend whose writes fail, for exercising the fatal path
    pub fn failing(total_size: u64) -> Self {
        let storage = Self::new(total_size);
        storage.fail_writes.store(true, Ordering::SeqCst);
        storage
    }

    /// `(offset, length)` of every successful write, in order
    pub async fn writes(&self) -> Vec<(u64, usize)> {
        self.writes.lock().await.clone()
    }

    pub async fn contents(&self) -> Vec<u8> {
        self.data.lock().await.clone()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TorrentError::storage_error_with_path("Write refused", format!("memory@{}", offset)).into());
        }

        let mut buffer = self.data.lock().await;
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.len() {
            return Err(TorrentError::storage_error(format!(
                "Write of {} bytes at {} past end of {}-byte buffer",
                data.len(),
                offset,
                buffer.len()
            ))
            .into());
        }
        buffer[start..end].copy_from_slice(&data);
        self.writes.lock().await.push((offset, data.len()));
        trace!("Stored {} bytes at {}", data.len(), offset);
        Ok(())
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let buffer = self.data.lock().await;
        let start = offset as usize;
        buffer
            .get(start..start + length)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| TorrentError::storage_error(format!("Read of {} bytes at {} out of range", length, offset)).into())
    }
}
