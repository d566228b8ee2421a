//! Peer state module
//!
//! Per-connection protocol state: handshake progress, choke/interest flags,
//! the pieces the remote side owns and the requests we have outstanding.

use std::collections::VecDeque;
use std::net::SocketAddr;

use anyhow::Result;
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::error::TorrentError;
use crate::peer::bitfield::Bitfield;
use crate::storage::BlockRequest;

/// Progress of the opening handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandshakeStatus {
    Pending,
    Ok,
    Failed,
}

/// Represents the state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PeerState {
    /// No socket yet
    #[default]
    Disconnected,
    /// Socket open, handshake in progress
    Handshaking,
    /// Handshake verified, messages flowing
    Established,
    /// Torn down; terminal
    Closed,
}

impl PeerState {
    pub fn is_established(&self) -> bool {
        matches!(self, PeerState::Established)
    }
}

/// Represents a peer with its state and statistics
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier, known after the handshake
    pub peer_id: Option<[u8; 20]>,
    pub handshake: HandshakeStatus,
    pub state: PeerState,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Pieces they have
    pub bitfield: Bitfield,
    /// Requests sent and not yet answered, oldest first
    pub in_flight: VecDeque<BlockRequest>,
    /// Upper bound on `in_flight`
    pub max_in_flight: usize,
    /// Last time any message arrived, keep-alives included
    pub last_activity: Instant,
    /// Blocks received from this peer
    pub blocks_received: u64,
}

impl Peer {
    /// Create a new peer
    pub fn new(addr: SocketAddr, piece_count: usize, max_in_flight: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            handshake: HandshakeStatus::Pending,
            state: PeerState::Disconnected,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(piece_count),
            in_flight: VecDeque::with_capacity(max_in_flight),
            max_in_flight,
            last_activity: Instant::now(),
            blocks_received: 0,
        }
    }

    pub fn set_state(&mut self, state: PeerState) {
        self.state = state;
    }

    /// Record a verified handshake
    pub fn complete_handshake(&mut self, peer_id: [u8; 20]) {
        self.peer_id = Some(peer_id);
        self.handshake = HandshakeStatus::Ok;
        self.state = PeerState::Established;
        self.last_activity = Instant::now();
    }

    pub fn fail_handshake(&mut self) {
        self.handshake = HandshakeStatus::Failed;
        self.state = PeerState::Closed;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Instant after which the connection counts as idle
    pub fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        self.last_activity + idle_timeout
    }

    /// Replace the owned-piece set from a `bitfield` payload
    pub fn apply_bitfield(&mut self, payload: &[u8]) -> Result<&Bitfield> {
        let piece_count = self.bitfield.piece_count();
        self.bitfield = Bitfield::from_payload(payload, piece_count)?;
        Ok(&self.bitfield)
    }

    /// Record a `have` announcement
    pub fn apply_have(&mut self, piece_index: u32) -> Result<()> {
        self.check_piece_index(piece_index)?;
        self.bitfield.set_piece(piece_index as usize);
        Ok(())
    }

    /// Fail if the peer referenced a piece that doesn't exist
    pub fn check_piece_index(&self, piece_index: u32) -> Result<()> {
        if piece_index as usize >= self.bitfield.piece_count() {
            return Err(TorrentError::protocol_error_with_source(
                "Piece index out of range",
                format!("index {} of {} pieces", piece_index, self.bitfield.piece_count()),
            )
            .into());
        }
        Ok(())
    }

    pub fn has_piece(&self, piece_index: usize) -> bool {
        self.bitfield.has_piece(piece_index)
    }

    /// Queue a request; false when the pipeline is full
    pub fn push_request(&mut self, request: BlockRequest) -> bool {
        if self.in_flight.len() >= self.max_in_flight {
            return false;
        }
        self.in_flight.push_back(request);
        true
    }

    /// Drop the in-flight request matching a received or cancelled block
    pub fn remove_request(&mut self, index: u32, begin: u32) -> Option<BlockRequest> {
        let pos = self
            .in_flight
            .iter()
            .position(|r| r.index == index && r.begin == begin)?;
        self.in_flight.remove(pos)
    }

    /// Forget every in-flight request, returning them
    pub fn clear_requests(&mut self) -> Vec<BlockRequest> {
        self.in_flight.drain(..).collect()
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested && self.state.is_established()
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            addr: self.addr,
            peer_id: self.peer_id.map(hex::encode),
            state: self.state,
            handshake: self.handshake,
            peer_choking: self.peer_choking,
            am_interested: self.am_interested,
            pieces_owned: self.bitfield.count(),
            blocks_received: self.blocks_received,
        }
    }
}

/// Snapshot of a connection, reported when it closes
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub peer_id: Option<String>,
    pub state: PeerState,
    pub handshake: HandshakeStatus,
    pub peer_choking: bool,
    pub am_interested: bool,
    pub pieces_owned: usize,
    pub blocks_received: u64,
}
