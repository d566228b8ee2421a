//! Piece manager
//!
//! Tracks which peers own which pieces, hands out block requests
//! rarest-first, assembles received blocks and verifies completed pieces.
//! The manager is plain synchronous state: the download coordinator is its
//! only owner and applies peer events to it one at a time.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::Bitfield;
use crate::storage::piece::{BlockRequest, BlockStatus, Piece, PieceStatus, StoreResult, BLOCK_SIZE};
use crate::torrent::TorrentInfo;

#[derive(Debug, Clone)]
pub struct PieceManagerConfig {
    pub block_size: u32,
    /// Requested blocks one peer may hold at once
    pub max_pipeline: usize,
    /// Requested blocks older than this go back to Pending
    pub request_timeout: Duration,
    /// Distinct peers in failed copies before corruption is reported as persistent
    pub corrupt_peer_limit: usize,
}

impl Default for PieceManagerConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            max_pipeline: 5,
            request_timeout: Duration::from_secs(60),
            corrupt_peer_limit: 5,
        }
    }
}

/// A piece that passed its hash check, ready to be written
#[derive(Debug, Clone)]
pub struct VerifiedPiece {
    pub index: u32,
    /// Absolute offset in the torrent's byte stream
    pub offset: u64,
    pub data: Bytes,
}

/// What happened to a received block
#[derive(Debug, Clone)]
pub enum BlockOutcome {
    /// Stored; the piece still has blocks outstanding
    Stored,
    /// Already had it
    Duplicate,
    Verified(VerifiedPiece),
    /// The completed piece failed its hash check and was discarded
    Corrupt { index: u32, persistent: bool },
}

/// Piece and block state for one torrent
#[derive(Debug)]
pub struct PieceManager {
    pieces: Vec<Piece>,
    piece_length: u64,
    config: PieceManagerConfig,
    /// Requested blocks held per peer
    in_flight: HashMap<SocketAddr, usize>,
    verified: usize,
    failed_verifications: u64,
    bytes_verified: u64,
    total_length: u64,
}

impl PieceManager {
    pub fn new(info: &TorrentInfo, config: PieceManagerConfig) -> Self {
        let pieces = info
            .pieces
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let length = info.piece_size(index).unwrap_or(0) as u32;
                Piece::new(index as u32, length, *hash, config.block_size)
            })
            .collect::<Vec<_>>();

        info!(
            "Piece manager ready: {} pieces of {} bytes, {} bytes total",
            pieces.len(),
            info.piece_length,
            info.total_size()
        );

        Self {
            pieces,
            piece_length: info.piece_length,
            config,
            in_flight: HashMap::new(),
            verified: 0,
            failed_verifications: 0,
            bytes_verified: 0,
            total_length: info.total_size(),
        }
    }

    /// Record every piece in a peer's bitfield; true if it owns something we need
    pub fn peer_bitfield(&mut self, addr: SocketAddr, bitfield: &Bitfield) -> bool {
        for index in bitfield.available_pieces() {
            if let Some(piece) = self.pieces.get_mut(index) {
                piece.owners.insert(addr);
            }
        }
        self.is_interesting(addr)
    }

    /// Record a `have`; true if the piece is one we still need
    pub fn peer_has(&mut self, addr: SocketAddr, index: u32) -> bool {
        match self.pieces.get_mut(index as usize) {
            Some(piece) => {
                piece.owners.insert(addr);
                piece.status != PieceStatus::Verified
            }
            None => false,
        }
    }

    /// Whether the peer owns any piece not yet verified
    pub fn is_interesting(&self, addr: SocketAddr) -> bool {
        self.pieces
            .iter()
            .any(|p| p.status != PieceStatus::Verified && p.owners.contains(&addr))
    }

    /// Number of known owners of a piece
    pub fn owner_count(&self, index: u32) -> usize {
        self.pieces.get(index as usize).map_or(0, |p| p.owners.len())
    }

    pub fn is_owner(&self, addr: SocketAddr, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.owners.contains(&addr))
    }

    /// Forget a peer entirely, returning its Requested blocks to Pending
    pub fn peer_disconnected(&mut self, addr: SocketAddr) -> usize {
        let mut released = 0;
        for piece in &mut self.pieces {
            piece.owners.remove(&addr);
            released += piece.release_peer(addr).len();
        }
        self.in_flight.remove(&addr);
        if released > 0 {
            debug!("Returned {} blocks held by {} to the pool", released, addr);
        }
        released
    }

    /// A choke discards the peer's pending requests
    pub fn peer_choked(&mut self, addr: SocketAddr) -> usize {
        let released: usize = self.pieces.iter_mut().map(|p| p.release_peer(addr).len()).sum();
        self.in_flight.remove(&addr);
        released
    }

    /// Pick blocks for a peer, rarest piece first
    ///
    /// Candidates are the unverified pieces the peer owns that still have
    /// Pending blocks, ordered by owner count and then index. Blocks are taken
    /// in offset order until the peer holds `max_pipeline` requests.
    pub fn next_requests(&mut self, addr: SocketAddr) -> Vec<BlockRequest> {
        let held = self.in_flight.get(&addr).copied().unwrap_or(0);
        let mut budget = self.config.max_pipeline.saturating_sub(held);
        if budget == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(usize, usize)> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.owners.contains(&addr) && p.has_pending())
            .map(|(i, p)| (p.owners.len(), i))
            .collect();
        candidates.sort_unstable();

        let now = Instant::now();
        let mut requests = Vec::with_capacity(budget);
        for (_, i) in candidates {
            let piece = &mut self.pieces[i];
            for block in piece.blocks.iter_mut().filter(|b| b.status == BlockStatus::Pending) {
                block.status = BlockStatus::Requested;
                block.owner = Some(addr);
                block.requested_at = Some(now);
                requests.push(block.request());
                budget -= 1;
                if budget == 0 {
                    break;
                }
            }
            piece.status = PieceStatus::InProgress;
            if budget == 0 {
                break;
            }
        }

        if !requests.is_empty() {
            *self.in_flight.entry(addr).or_insert(0) += requests.len();
            trace!("Assigned {} blocks to {}", requests.len(), addr);
        }
        requests
    }

    /// Peer currently holding the request for a block, if it is Requested
    ///
    /// When a block arrives from someone else, this is the peer whose
    /// request should be cancelled.
    pub fn requested_from(&self, index: u32, begin: u32) -> Option<SocketAddr> {
        self.pieces
            .get(index as usize)?
            .blocks
            .iter()
            .find(|b| b.offset == begin && b.status == BlockStatus::Requested)?
            .owner
    }

    /// Undo an assignment the peer's connection did not send
    pub fn release_request(&mut self, addr: SocketAddr, request: BlockRequest) -> bool {
        let released = self
            .pieces
            .get_mut(request.index as usize)
            .is_some_and(|p| p.release_block(addr, request.begin));
        if released {
            if let Some(count) = self.in_flight.get_mut(&addr) {
                *count = count.saturating_sub(1);
            }
            trace!("{} gave back {}@{}", addr, request.index, request.begin);
        }
        released
    }

    /// Store a block and verify its piece once complete
    pub fn on_block(&mut self, addr: SocketAddr, index: u32, begin: u32, data: &[u8]) -> Result<BlockOutcome> {
        let piece = self.pieces.get_mut(index as usize).ok_or_else(|| {
            TorrentError::protocol_error_with_source("Block for unknown piece", format!("index {} from {}", index, addr))
        })?;

        let pos = piece.block_position(begin, data.len())?;
        let block = &piece.blocks[pos];
        if block.status == BlockStatus::Requested {
            if let Some(owner) = block.owner {
                if let Some(count) = self.in_flight.get_mut(&owner) {
                    *count = count.saturating_sub(1);
                }
            }
        }

        if piece.store_block(begin, data, addr)? == StoreResult::Duplicate {
            trace!("Duplicate block {}@{} from {}", index, begin, addr);
            return Ok(BlockOutcome::Duplicate);
        }

        if !piece.is_complete() {
            return Ok(BlockOutcome::Stored);
        }

        if piece.verify() {
            let data = piece.take_data();
            self.verified += 1;
            self.bytes_verified += data.len() as u64;
            debug!("Piece {} verified ({}/{})", index, self.verified, self.pieces.len());
            return Ok(BlockOutcome::Verified(VerifiedPiece {
                index,
                offset: index as u64 * self.piece_length,
                data,
            }));
        }

        self.failed_verifications += 1;
        let persistent = piece.corrupt_contributors.len() >= self.config.corrupt_peer_limit;
        let err = TorrentError::verification_error(index, "hash mismatch")
            .with_context(format!("attempt {}, last block from {}", piece.failures, addr));
        if persistent {
            error!("{}: copies from {} peers failed", err, piece.corrupt_contributors.len());
        } else {
            warn!("{}", err);
        }
        piece.discard();

        Ok(BlockOutcome::Corrupt { index, persistent })
    }

    /// Return timed-out requests to Pending, reporting previous holders
    pub fn reclaim_expired(&mut self, now: Instant) -> Vec<(SocketAddr, BlockRequest)> {
        let timeout = self.config.request_timeout;
        let expired: Vec<_> = self
            .pieces
            .iter_mut()
            .flat_map(|p| p.reclaim_expired(now, timeout))
            .collect();

        for (owner, _) in &expired {
            if let Some(count) = self.in_flight.get_mut(owner) {
                *count = count.saturating_sub(1);
            }
        }
        if !expired.is_empty() {
            debug!("Reclaimed {} timed-out block requests", expired.len());
        }
        expired
    }

    pub fn is_complete(&self) -> bool {
        self.verified == self.pieces.len()
    }

    pub fn is_verified(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.status == PieceStatus::Verified)
    }

    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn verified_count(&self) -> usize {
        self.verified
    }

    pub fn bytes_left(&self) -> u64 {
        self.total_length - self.bytes_verified
    }

    pub fn failed_verifications(&self) -> u64 {
        self.failed_verifications
    }

    /// Requested blocks currently held by a peer
    pub fn in_flight(&self, addr: SocketAddr) -> usize {
        self.in_flight.get(&addr).copied().unwrap_or(0)
    }
}
