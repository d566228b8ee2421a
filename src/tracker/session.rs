//! UDP tracker session state
//!
//! Builds BEP 15 connect and announce requests and validates the replies
//! against the transaction in flight. A reply that does not belong to the
//! current transaction is a protocol error and leaves the session untouched.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::tracker::response::{parse_compact_peers, AnnounceResponse, TrackerEvent};

pub const PROTOCOL_ID: u64 = 0x41727101980;
pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;

/// How long a connection id may be used after it was issued
pub const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

pub const CONNECT_REQUEST_LEN: usize = 16;
pub const ANNOUNCE_REQUEST_LEN: usize = 98;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    Idle,
    Connecting,
    Connected,
    Announcing,
    Done,
    Failed,
}

/// Fields of an announce that come from the caller
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: TrackerEvent,
    pub key: u32,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct TrackerSession {
    /// Transaction id of the request in flight
    pub transaction_id: u32,
    pub connection_id: Option<u64>,
    pub connected_at: Option<Instant>,
    /// Retransmissions of the current request
    pub retry_count: u32,
    pub phase: TrackerPhase,
}

impl Default for TrackerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerSession {
    pub fn new() -> Self {
        Self {
            transaction_id: 0,
            connection_id: None,
            connected_at: None,
            retry_count: 0,
            phase: TrackerPhase::Idle,
        }
    }

    /// Whether the connection id can still be used at `now`
    pub fn connection_valid(&self, now: Instant) -> bool {
        match (self.connection_id, self.connected_at) {
            (Some(_), Some(at)) => now.saturating_duration_since(at) < CONNECTION_ID_TTL,
            _ => false,
        }
    }

    /// Start a connect exchange with a fresh transaction id
    pub fn begin_connect(&mut self) -> Vec<u8> {
        self.transaction_id = rand::random();
        self.retry_count = 0;
        self.phase = TrackerPhase::Connecting;
        self.connect_request()
    }

    /// The 16-byte connect request for the current transaction id
    pub fn connect_request(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(CONNECT_REQUEST_LEN);
        buf.put_u64(PROTOCOL_ID);
        buf.put_u32(ACTION_CONNECT);
        buf.put_u32(self.transaction_id);
        buf.to_vec()
    }

    /// Validate a connect reply; on success store the connection id
    pub fn handle_connect_response(&mut self, data: &[u8]) -> Result<u64> {
        let mut body = self.check_header(data, ACTION_CONNECT)?;
        if body.remaining() != 8 {
            return Err(TorrentError::protocol_error_with_source(
                "Connect response must be 16 bytes",
                format!("{} bytes", data.len()),
            )
            .into());
        }

        let connection_id = body.get_u64();
        self.connection_id = Some(connection_id);
        self.connected_at = Some(Instant::now());
        self.phase = TrackerPhase::Connected;
        debug!("Tracker connection id {:#x}", connection_id);
        Ok(connection_id)
    }

    /// Start an announce exchange with a fresh transaction id
    pub fn begin_announce(&mut self, params: &AnnounceParams) -> Result<Vec<u8>> {
        let connection_id = self
            .connection_id
            .ok_or_else(|| TorrentError::tracker_error("Announce attempted without a connection id"))?;
        self.transaction_id = rand::random();
        self.retry_count = 0;
        self.phase = TrackerPhase::Announcing;

        let mut buf = BytesMut::with_capacity(ANNOUNCE_REQUEST_LEN);
        buf.put_u64(connection_id);
        buf.put_u32(ACTION_ANNOUNCE);
        buf.put_u32(self.transaction_id);
        buf.put_slice(&params.info_hash);
        buf.put_slice(&params.peer_id);
        buf.put_u64(params.downloaded);
        buf.put_u64(params.left);
        buf.put_u64(params.uploaded);
        buf.put_u32(params.event.as_udp_id());
        buf.put_u32(0); // ip: let the tracker use the source address
        buf.put_u32(params.key);
        buf.put_i32(-1); // num_want: tracker default
        buf.put_u16(params.port);
        Ok(buf.to_vec())
    }

    /// Validate an announce reply and decode the peer list
    pub fn handle_announce_response(&mut self, data: &[u8]) -> Result<AnnounceResponse> {
        let mut body = self.check_header(data, ACTION_ANNOUNCE)?;
        if body.remaining() < 12 {
            return Err(TorrentError::protocol_error_with_source(
                "Announce response too short",
                format!("{} bytes", data.len()),
            )
            .into());
        }

        let interval = body.get_u32();
        let leechers = body.get_u32();
        let seeders = body.get_u32();
        let peers = parse_compact_peers(body);
        self.phase = TrackerPhase::Done;

        Ok(AnnounceResponse { interval, leechers, seeders, peers })
    }

    /// Check action and transaction id, returning the bytes after them
    ///
    /// An error action carrying our transaction id is a tracker rejection;
    /// everything else that doesn't match is a protocol error.
    fn check_header<'a>(&self, data: &'a [u8], expected_action: u32) -> Result<&'a [u8]> {
        if data.len() < 8 {
            return Err(TorrentError::protocol_error_with_source(
                "Tracker response too short",
                format!("{} bytes", data.len()),
            )
            .into());
        }

        let mut header = &data[..8];
        let action = header.get_u32();
        let transaction_id = header.get_u32();

        if transaction_id != self.transaction_id {
            return Err(TorrentError::protocol_error_with_source(
                "Transaction id mismatch",
                format!("expected {:#010x}, got {:#010x}", self.transaction_id, transaction_id),
            )
            .into());
        }

        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&data[8..]).to_string();
            return Err(TorrentError::tracker_error(message).into());
        }

        if action != expected_action {
            return Err(TorrentError::protocol_error_with_source(
                "Unexpected tracker action",
                format!("expected {}, got {}", expected_action, action),
            )
            .into());
        }

        trace!("Tracker reply for transaction {:#010x}, action {}", transaction_id, action);
        Ok(&data[8..])
    }
}
