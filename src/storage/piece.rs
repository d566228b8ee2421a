//! Piece storage module
//!
//! Block table, assembly buffer and SHA1 check for a single piece.

use std::collections::HashSet;
use std::net::SocketAddr;

use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::time::{Duration, Instant};

use crate::error::TorrentError;

/// Default block size requested from peers
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Status of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PieceStatus {
    /// Nothing usable held
    #[default]
    Missing,
    /// At least one block requested or received
    InProgress,
    /// Hash matched; data handed off to storage
    Verified,
    /// Hash mismatch, about to be discarded
    FailedVerify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Pending,
    Requested,
    Received,
}

/// Address of a block on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Represents a block within a piece
#[derive(Debug, Clone)]
pub struct Block {
    /// Piece index this block belongs to
    pub piece_index: u32,
    /// Offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
    pub status: BlockStatus,
    /// Peer holding the request, while Requested
    pub owner: Option<SocketAddr>,
    pub requested_at: Option<Instant>,
}

impl Block {
    pub fn request(&self) -> BlockRequest {
        BlockRequest {
            index: self.piece_index,
            begin: self.offset,
            length: self.length,
        }
    }

    fn reset(&mut self) {
        self.status = BlockStatus::Pending;
        self.owner = None;
        self.requested_at = None;
    }
}

/// Result of storing one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Stored,
    Duplicate,
}

/// Represents a piece of the torrent
#[derive(Debug, Clone)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Expected SHA1 hash
    pub hash: [u8; 20],
    /// Length in bytes; only the last piece may be short
    pub length: u32,
    pub status: PieceStatus,
    /// Assembly buffer, allocated on the first block
    pub buffer: Option<Vec<u8>>,
    /// Peers known to own this piece
    pub owners: HashSet<SocketAddr>,
    pub blocks: Vec<Block>,
    received: usize,
    /// Peers whose blocks went into the current copy
    contributors: HashSet<SocketAddr>,
    /// Failed hash checks so far
    pub failures: u32,
    /// Every peer that contributed to a copy that failed its hash check
    pub corrupt_contributors: HashSet<SocketAddr>,
}

impl Piece {
    /// Create a new piece
    pub fn new(index: u32, length: u32, hash: [u8; 20], block_size: u32) -> Self {
        let blocks = (0..length.div_ceil(block_size))
            .map(|i| {
                let offset = i * block_size;
                Block {
                    piece_index: index,
                    offset,
                    length: block_size.min(length - offset),
                    status: BlockStatus::Pending,
                    owner: None,
                    requested_at: None,
                }
            })
            .collect();

        Self {
            index,
            hash,
            length,
            status: PieceStatus::Missing,
            buffer: None,
            owners: HashSet::new(),
            blocks,
            received: 0,
            contributors: HashSet::new(),
            failures: 0,
            corrupt_contributors: HashSet::new(),
        }
    }

    /// Locate the block a (begin, length) pair refers to
    ///
    /// Anything that is not exactly one of our blocks is a protocol error.
    pub fn block_position(&self, begin: u32, length: usize) -> Result<usize> {
        let position = self.blocks.iter().position(|b| b.offset == begin);
        match position {
            Some(pos) if self.blocks[pos].length as usize == length => Ok(pos),
            _ => Err(TorrentError::protocol_error_with_source(
                "Block does not match piece geometry",
                format!("piece {} begin {} length {}", self.index, begin, length),
            )
            .into()),
        }
    }

    /// Copy a received block into the assembly buffer
    pub fn store_block(&mut self, begin: u32, data: &[u8], from: SocketAddr) -> Result<StoreResult> {
        let pos = self.block_position(begin, data.len())?;
        if self.status == PieceStatus::Verified || self.blocks[pos].status == BlockStatus::Received {
            return Ok(StoreResult::Duplicate);
        }

        let length = self.length as usize;
        let buffer = self.buffer.get_or_insert_with(|| vec![0u8; length]);
        let start = begin as usize;
        buffer[start..start + data.len()].copy_from_slice(data);

        let block = &mut self.blocks[pos];
        block.status = BlockStatus::Received;
        block.owner = None;
        block.requested_at = None;
        self.received += 1;
        self.contributors.insert(from);
        self.status = PieceStatus::InProgress;
        Ok(StoreResult::Stored)
    }

    /// Check if all blocks are received
    pub fn is_complete(&self) -> bool {
        self.received == self.blocks.len()
    }

    /// Verify the piece hash
    ///
    /// On mismatch the piece moves to FailedVerify and the contributing peers
    /// are remembered; callers then `discard` it.
    pub fn verify(&mut self) -> bool {
        let matches = match &self.buffer {
            Some(buffer) if self.is_complete() => {
                let digest: [u8; 20] = Sha1::digest(buffer).into();
                digest == self.hash
            }
            _ => false,
        };

        if matches {
            self.status = PieceStatus::Verified;
        } else {
            self.status = PieceStatus::FailedVerify;
            self.failures += 1;
            self.corrupt_contributors.extend(self.contributors.iter().copied());
        }
        matches
    }

    /// Drop all partial data and return the piece to Missing
    pub fn discard(&mut self) {
        self.buffer = None;
        for block in &mut self.blocks {
            block.reset();
        }
        self.received = 0;
        self.contributors.clear();
        self.status = PieceStatus::Missing;
    }

    /// Move the verified bytes out of the piece
    pub fn take_data(&mut self) -> Bytes {
        self.buffer.take().map(Bytes::from).unwrap_or_default()
    }

    /// Whether any block still needs to be requested
    pub fn has_pending(&self) -> bool {
        self.status != PieceStatus::Verified && self.blocks.iter().any(|b| b.status == BlockStatus::Pending)
    }

    /// Return a peer's Requested blocks to Pending
    pub fn release_peer(&mut self, addr: SocketAddr) -> Vec<BlockRequest> {
        let mut released = Vec::new();
        for block in &mut self.blocks {
            if block.status == BlockStatus::Requested && block.owner == Some(addr) {
                released.push(block.request());
                block.reset();
            }
        }
        self.settle_status();
        released
    }

    /// Return one block Requested from `addr` to Pending
    pub fn release_block(&mut self, addr: SocketAddr, begin: u32) -> bool {
        let Some(block) = self.blocks.iter_mut().find(|b| b.offset == begin) else {
            return false;
        };
        if block.status != BlockStatus::Requested || block.owner != Some(addr) {
            return false;
        }
        block.reset();
        self.settle_status();
        true
    }

    /// Return Requested blocks older than `timeout` to Pending
    pub fn reclaim_expired(&mut self, now: Instant, timeout: Duration) -> Vec<(SocketAddr, BlockRequest)> {
        let mut expired = Vec::new();
        for block in &mut self.blocks {
            if block.status != BlockStatus::Requested {
                continue;
            }
            let stale = block.requested_at.is_some_and(|at| now.saturating_duration_since(at) >= timeout);
            if stale {
                if let Some(owner) = block.owner {
                    expired.push((owner, block.request()));
                }
                block.reset();
            }
        }
        self.settle_status();
        expired
    }

    /// Number of blocks received into the current copy
    pub fn received_blocks(&self) -> usize {
        self.received
    }

    fn settle_status(&mut self) {
        if self.status == PieceStatus::InProgress
            && self.received == 0
            && self.blocks.iter().all(|b| b.status == BlockStatus::Pending)
        {
            self.status = PieceStatus::Missing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_block_table_with_short_tail() {
        let piece = Piece::new(0, 40_000, [0u8; 20], BLOCK_SIZE);
        let lengths: Vec<u32> = piece.blocks.iter().map(|b| b.length).collect();
        assert_eq!(lengths, vec![16384, 16384, 7232]);
        assert_eq!(piece.blocks[2].offset, 32768);
    }

    #[test]
    fn test_verify_good_piece() {
        let data = vec![3u8; 20];
        let hash: [u8; 20] = Sha1::digest(&data).into();
        let mut piece = Piece::new(1, 20, hash, 8);

        assert_eq!(piece.store_block(0, &data[..8], addr(1)).unwrap(), StoreResult::Stored);
        assert_eq!(piece.store_block(8, &data[8..16], addr(1)).unwrap(), StoreResult::Stored);
        assert_eq!(piece.store_block(8, &data[8..16], addr(2)).unwrap(), StoreResult::Duplicate);
        assert!(!piece.is_complete());
        piece.store_block(16, &data[16..], addr(2)).unwrap();

        assert!(piece.verify());
        assert_eq!(piece.status, PieceStatus::Verified);
        assert_eq!(&piece.take_data()[..], &data[..]);
    }

    #[test]
    fn test_failed_piece_is_discarded_completely() {
        let mut piece = Piece::new(0, 16, [9u8; 20], 8);
        piece.store_block(0, &[1u8; 8], addr(1)).unwrap();
        piece.store_block(8, &[1u8; 8], addr(2)).unwrap();

        assert!(!piece.verify());
        assert_eq!(piece.status, PieceStatus::FailedVerify);
        piece.discard();

        assert_eq!(piece.status, PieceStatus::Missing);
        assert!(piece.buffer.is_none());
        assert_eq!(piece.received_blocks(), 0);
        assert!(piece.blocks.iter().all(|b| b.status == BlockStatus::Pending));
        assert_eq!(piece.failures, 1);
        assert_eq!(piece.corrupt_contributors.len(), 2);
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let mut piece = Piece::new(0, 16, [0u8; 20], 8);
        assert!(piece.store_block(4, &[0u8; 8], addr(1)).is_err());
        assert!(piece.store_block(0, &[0u8; 7], addr(1)).is_err());
        assert!(piece.store_block(16, &[0u8; 8], addr(1)).is_err());
    }

    #[test]
    fn test_release_and_reclaim() {
        let mut piece = Piece::new(0, 16, [0u8; 20], 8);
        let start = Instant::now();
        for block in &mut piece.blocks {
            block.status = BlockStatus::Requested;
            block.owner = Some(addr(1));
            block.requested_at = Some(start);
        }
        piece.status = PieceStatus::InProgress;

        assert!(piece.reclaim_expired(start + Duration::from_secs(59), Duration::from_secs(60)).is_empty());
        let expired = piece.reclaim_expired(start + Duration::from_secs(60), Duration::from_secs(60));
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].0, addr(1));
        assert_eq!(piece.status, PieceStatus::Missing);
        assert!(piece.release_peer(addr(1)).is_empty());
    }
}
