//! Peer connection module
//!
//! One TCP connection to one remote peer. After the handshake the
//! connection runs as its own task: it decodes frames, keeps the per-peer
//! protocol state, reports what it learns as `PeerEvent`s and executes the
//! `PeerCommand`s the coordinator sends back.

use std::net::SocketAddr;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::bitfield::Bitfield;
use crate::peer::state::{Peer, PeerState, PeerStats};
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};
use crate::storage::BlockRequest;

/// Timing and pipelining knobs for a connection
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Budget for TCP connect and for the handshake exchange, each
    pub connect_timeout: Duration,
    /// Close after this long without any inbound message
    pub idle_timeout: Duration,
    /// Send a keep-alive this often
    pub keepalive_interval: Duration,
    /// Maximum outstanding requests
    pub max_pipeline: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(60),
            max_pipeline: 5,
        }
    }
}

/// Something a connection learned, tagged with the peer it came from
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub addr: SocketAddr,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Handshake verified
    Connected { peer_id: [u8; 20] },
    Choke,
    Unchoke,
    Have(u32),
    Bitfield(Bitfield),
    Block { index: u32, begin: u32, data: Bytes },
    /// A request command that was not put on the wire
    Rejected(BlockRequest),
    /// Always the last event of a connection
    Closed { reason: String, stats: PeerStats },
}

/// Instructions from the coordinator
#[derive(Debug, Clone)]
pub enum PeerCommand {
    Request(BlockRequest),
    Cancel(BlockRequest),
    Send(Message),
    Shutdown,
}

/// Represents a connected peer
pub struct PeerConnection {
    /// Peer information
    pub peer: Peer,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    wire: BitTorrentWire,
    config: PeerConfig,
}

impl PeerConnection {
    /// Connect to a peer and run it until it closes
    ///
    /// Emits `Connected` after a good handshake and always finishes with
    /// exactly one `Closed`, including when the connect or handshake fails.
    pub async fn session(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
        config: PeerConfig,
        events: mpsc::Sender<PeerEvent>,
        mut commands: mpsc::Receiver<PeerCommand>,
    ) {
        let mut connection = match Self::connect(addr, info_hash, our_peer_id, num_pieces, config.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!("Peer {} not usable: {}", addr, e);
                let mut peer = Peer::new(addr, num_pieces, config.max_pipeline);
                peer.fail_handshake();
                let closed = PeerEventKind::Closed { reason: e.to_string(), stats: peer.stats() };
                let _ = events.send(PeerEvent { addr, kind: closed }).await;
                return;
            }
        };

        let peer_id = connection.peer.peer_id.unwrap_or_default();
        let reason = if events.send(PeerEvent { addr, kind: PeerEventKind::Connected { peer_id } }).await.is_err() {
            "coordinator gone".to_string()
        } else {
            match connection.run(&events, &mut commands).await {
                Ok(reason) => reason,
                Err(e) => {
                    warn!("Dropping peer {}: {}", addr, e);
                    e.to_string()
                }
            }
        };

        connection.peer.set_state(PeerState::Closed);
        info!("Closed connection to peer {}: {}", addr, reason);
        let closed = PeerEventKind::Closed { reason, stats: connection.peer.stats() };
        let _ = events.send(PeerEvent { addr, kind: closed }).await;
    }

    /// Connect to a peer at the given address and perform handshake
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
        config: PeerConfig,
    ) -> Result<Self> {
        info!("Connecting to peer: {}", addr);

        let socket = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|e| {
                warn!("Connection timeout to {}", addr);
                TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        let handshake_timeout = config.connect_timeout;
        let mut connection = Self::from_stream(socket, addr, num_pieces, config);
        connection.peer.set_state(PeerState::Handshaking);

        match timeout(handshake_timeout, connection.perform_handshake(info_hash, our_peer_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                connection.peer.fail_handshake();
                return Err(e);
            }
            Err(e) => {
                connection.peer.fail_handshake();
                return Err(TorrentError::peer_error_full("Handshake timeout", addr.to_string(), e.to_string()).into());
            }
        }

        info!("Successfully connected and handshaked with peer: {}", addr);
        Ok(connection)
    }

    fn from_stream(socket: TcpStream, addr: SocketAddr, num_pieces: usize, config: PeerConfig) -> Self {
        let (reader, writer) = socket.into_split();
        Self {
            peer: Peer::new(addr, num_pieces, config.max_pipeline),
            reader,
            writer,
            wire: BitTorrentWire::new(),
            config,
        }
    }

    /// Perform the BitTorrent handshake
    async fn perform_handshake(&mut self, info_hash: [u8; 20], our_peer_id: [u8; 20]) -> Result<()> {
        let addr = self.peer.addr;
        debug!("Sending handshake to peer: {}", addr);
        self.wire
            .write_handshake(&mut self.writer, &Handshake::new(info_hash, our_peer_id))
            .await
            .map_err(|e| TorrentError::peer_error_full("Failed to send handshake", addr.to_string(), e.to_string()))?;

        let theirs = self
            .wire
            .read_handshake(&mut self.reader)
            .await
            .map_err(|e| TorrentError::peer_error_full("Failed to read handshake", addr.to_string(), e.to_string()))?;

        if !theirs.validate(&info_hash) {
            error!("Handshake validation failed with peer {}: info hash mismatch", addr);
            return Err(TorrentError::protocol_error_with_source(
                "Handshake info hash mismatch",
                addr.to_string(),
            )
            .into());
        }

        self.peer.complete_handshake(theirs.peer_id);
        debug!("Handshake completed with peer {} ({})", addr, hex::encode(theirs.peer_id));
        Ok(())
    }

    /// Message loop; returns the close reason on an orderly stop
    pub async fn run(&mut self, events: &mpsc::Sender<PeerEvent>, commands: &mut mpsc::Receiver<PeerCommand>) -> Result<String> {
        let addr = self.peer.addr;
        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let idle_deadline = self.peer.idle_deadline(self.config.idle_timeout);

            tokio::select! {
                message = self.wire.read_message(&mut self.reader) => {
                    let message = message?;
                    self.peer.touch();
                    if let Some(kind) = self.handle_message(message)? {
                        if events.send(PeerEvent { addr, kind }).await.is_err() {
                            return Ok("coordinator gone".to_string());
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(PeerCommand::Shutdown) | None => return Ok("shutdown".to_string()),
                        Some(command) => {
                            if let Some(kind) = self.handle_command(command).await? {
                                if events.send(PeerEvent { addr, kind }).await.is_err() {
                                    return Ok("coordinator gone".to_string());
                                }
                            }
                        }
                    }
                }
                _ = keepalive.tick() => {
                    trace!("Sending KeepAlive to peer: {}", addr);
                    self.send(&Message::KeepAlive).await?;
                }
                _ = sleep_until(idle_deadline) => {
                    return Err(TorrentError::peer_error_with_peer(
                        format!("idle for {:?}", self.config.idle_timeout),
                        addr.to_string(),
                    )
                    .into());
                }
            }
        }
    }

    /// Apply an inbound message to the peer state
    ///
    /// Errors are fatal for this connection.
    fn handle_message(&mut self, message: Message) -> Result<Option<PeerEventKind>> {
        let addr = self.peer.addr;
        trace!("Received {:?} from peer {}", message.message_id(), addr);

        let kind = match message {
            Message::KeepAlive => None,
            Message::Choke => {
                self.peer.peer_choking = true;
                let dropped = self.peer.clear_requests();
                debug!("Peer {} choked us, {} requests discarded", addr, dropped.len());
                Some(PeerEventKind::Choke)
            }
            Message::Unchoke => {
                self.peer.peer_choking = false;
                debug!("Peer {} unchoked us", addr);
                Some(PeerEventKind::Unchoke)
            }
            Message::Interested => {
                self.peer.peer_interested = true;
                None
            }
            Message::NotInterested => {
                self.peer.peer_interested = false;
                None
            }
            Message::Have { piece_index } => {
                self.peer.apply_have(piece_index)?;
                Some(PeerEventKind::Have(piece_index))
            }
            Message::Bitfield { bitfield } => {
                let bitfield = self.peer.apply_bitfield(&bitfield)?.clone();
                debug!("Peer {} owns {}/{} pieces", addr, bitfield.count(), bitfield.piece_count());
                Some(PeerEventKind::Bitfield(bitfield))
            }
            Message::Piece { index, begin, block } => {
                self.peer.check_piece_index(index)?;
                if self.peer.remove_request(index, begin).is_none() {
                    debug!("Peer {} sent unrequested block {}@{}", addr, index, begin);
                }
                self.peer.blocks_received += 1;
                Some(PeerEventKind::Block { index, begin, data: block })
            }
            Message::Request { index, begin, length } => {
                debug!("Ignoring request {}@{}+{} from peer {}: not seeding", index, begin, length, addr);
                None
            }
            Message::Cancel { index, begin, .. } => {
                trace!("Peer {} cancelled {}@{}", addr, index, begin);
                None
            }
            Message::Port { listen_port } => {
                trace!("Peer {} announced DHT port {}", addr, listen_port);
                None
            }
        };

        Ok(kind)
    }

    /// Execute a coordinator command
    ///
    /// A request that cannot be sent comes back as `Rejected` so the
    /// coordinator can hand the block to someone else.
    async fn handle_command(&mut self, command: PeerCommand) -> Result<Option<PeerEventKind>> {
        match command {
            PeerCommand::Request(request) => {
                if !self.peer.can_request() {
                    debug!("Not requesting {}@{} from peer {}: choked or uninterested", request.index, request.begin, self.peer.addr);
                    return Ok(Some(PeerEventKind::Rejected(request)));
                }
                if !self.peer.push_request(request) {
                    debug!("Pipeline to peer {} full, rejecting request {}@{}", self.peer.addr, request.index, request.begin);
                    return Ok(Some(PeerEventKind::Rejected(request)));
                }
                self.send(&Message::Request { index: request.index, begin: request.begin, length: request.length }).await?;
            }
            PeerCommand::Cancel(request) => {
                if self.peer.remove_request(request.index, request.begin).is_some() {
                    self.send(&Message::Cancel { index: request.index, begin: request.begin, length: request.length }).await?;
                }
            }
            PeerCommand::Send(message) => {
                match message {
                    Message::Interested => self.peer.am_interested = true,
                    Message::NotInterested => self.peer.am_interested = false,
                    Message::Choke => self.peer.am_choking = true,
                    Message::Unchoke => self.peer.am_choking = false,
                    _ => {}
                }
                self.send(&message).await?;
            }
            PeerCommand::Shutdown => {}
        }
        Ok(None)
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        let addr = self.peer.addr;
        self.wire.write_message(&mut self.writer, message).await.map_err(|e| {
            TorrentError::peer_error_full("Failed to send message", addr.to_string(), e.to_string()).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [7u8; 20];

    async fn read_frame(socket: &mut TcpStream, frames: &mut FrameBuffer) -> Message {
        loop {
            if let Some(message) = frames.next_message().unwrap() {
                return message;
            }
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed early");
            frames.extend(&buf[..n]);
        }
    }

    async fn connected_pair(num_pieces: usize) -> (PeerConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut connection = PeerConnection::from_stream(client.unwrap(), addr, num_pieces, PeerConfig::default());
        connection.peer.complete_handshake([1u8; 20]);
        (connection, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_closes_before_any_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut theirs = [0u8; 68];
            socket.read_exact(&mut theirs).await.unwrap();
            let wrong = Handshake::new([8u8; 20], [2u8; 20]).serialize();
            socket.write_all(&wrong).await.unwrap();
            let _ = socket.write_all(&Message::Unchoke.serialize()).await;
            let _ = socket.write_all(&Message::Have { piece_index: 0 }.serialize()).await;
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_commands_tx, commands_rx) = mpsc::channel(16);
        PeerConnection::session(addr, INFO_HASH, [1u8; 20], 4, PeerConfig::default(), events_tx, commands_rx).await;

        let event = events_rx.recv().await.unwrap();
        match event.kind {
            PeerEventKind::Closed { stats, .. } => {
                assert_eq!(stats.handshake, crate::peer::HandshakeStatus::Failed);
            }
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_session_reports_events_and_sends_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let seeder = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut theirs = [0u8; 68];
            socket.read_exact(&mut theirs).await.unwrap();
            socket.write_all(&Handshake::new(INFO_HASH, [2u8; 20]).serialize()).await.unwrap();
            socket
                .write_all(&Message::Bitfield { bitfield: Bytes::from_static(&[0b1000_0000]) }.serialize())
                .await
                .unwrap();
            socket.write_all(&Message::Unchoke.serialize()).await.unwrap();

            let mut frames = FrameBuffer::new();
            assert_eq!(read_frame(&mut socket, &mut frames).await, Message::Interested);
            let request = read_frame(&mut socket, &mut frames).await;
            assert_eq!(request, Message::Request { index: 0, begin: 0, length: 4 });
            socket
                .write_all(&Message::Piece { index: 0, begin: 0, block: Bytes::from_static(b"abcd") }.serialize())
                .await
                .unwrap();
            // stay open until the client hangs up
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let session = tokio::spawn(PeerConnection::session(
            addr,
            INFO_HASH,
            [1u8; 20],
            4,
            PeerConfig::default(),
            events_tx,
            commands_rx,
        ));

        let kinds: Vec<_> = [
            events_rx.recv().await.unwrap().kind,
            events_rx.recv().await.unwrap().kind,
            events_rx.recv().await.unwrap().kind,
        ]
        .into();
        assert!(matches!(kinds[0], PeerEventKind::Connected { peer_id } if peer_id == [2u8; 20]));
        assert!(matches!(&kinds[1], PeerEventKind::Bitfield(bf) if bf.has_piece(0) && bf.count() == 1));
        assert!(matches!(kinds[2], PeerEventKind::Unchoke));

        commands_tx.send(PeerCommand::Send(Message::Interested)).await.unwrap();
        commands_tx
            .send(PeerCommand::Request(BlockRequest { index: 0, begin: 0, length: 4 }))
            .await
            .unwrap();

        match events_rx.recv().await.unwrap().kind {
            PeerEventKind::Block { index, begin, data } => {
                assert_eq!((index, begin), (0, 0));
                assert_eq!(&data[..], b"abcd");
            }
            other => panic!("expected Block, got {:?}", other),
        }

        commands_tx.send(PeerCommand::Shutdown).await.unwrap();
        match events_rx.recv().await.unwrap().kind {
            PeerEventKind::Closed { reason, stats } => {
                assert_eq!(reason, "shutdown");
                assert_eq!(stats.blocks_received, 1);
            }
            other => panic!("expected Closed, got {:?}", other),
        }
        session.await.unwrap();
        seeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_peer_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut theirs = [0u8; 68];
            socket.read_exact(&mut theirs).await.unwrap();
            socket.write_all(&Handshake::new(INFO_HASH, [2u8; 20]).serialize()).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let config = PeerConfig {
            idle_timeout: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(60),
            ..PeerConfig::default()
        };
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_commands_tx, commands_rx) = mpsc::channel(16);
        PeerConnection::session(addr, INFO_HASH, [1u8; 20], 4, config, events_tx, commands_rx).await;

        assert!(matches!(events_rx.recv().await.unwrap().kind, PeerEventKind::Connected { .. }));
        match events_rx.recv().await.unwrap().kind {
            PeerEventKind::Closed { reason, .. } => assert!(reason.contains("idle")),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_choke_clears_in_flight() {
        let (mut connection, _remote) = connected_pair(4).await;
        connection.peer.push_request(BlockRequest { index: 1, begin: 0, length: 16384 });
        connection.peer.push_request(BlockRequest { index: 1, begin: 16384, length: 16384 });

        let kind = connection.handle_message(Message::Choke).unwrap();
        assert!(matches!(kind, Some(PeerEventKind::Choke)));
        assert!(connection.peer.in_flight.is_empty());
        assert!(connection.peer.peer_choking);
    }

    #[tokio::test]
    async fn test_out_of_range_indices_are_fatal() {
        let (mut connection, _remote) = connected_pair(4).await;
        assert!(connection.handle_message(Message::Have { piece_index: 4 }).is_err());
        assert!(connection
            .handle_message(Message::Piece { index: 9, begin: 0, block: Bytes::from_static(b"x") })
            .is_err());
        assert!(connection
            .handle_message(Message::Bitfield { bitfield: Bytes::from_static(&[0xF0, 0x00]) })
            .is_err());
        assert!(connection.handle_message(Message::Have { piece_index: 3 }).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_request_while_choked_is_rejected() {
        let (mut connection, _remote) = connected_pair(4).await;
        connection.peer.am_interested = true;
        let request = BlockRequest { index: 0, begin: 0, length: 16384 };

        let kind = connection.handle_command(PeerCommand::Request(request)).await.unwrap();
        assert!(matches!(kind, Some(PeerEventKind::Rejected(r)) if r == request));
        assert!(connection.peer.in_flight.is_empty());

        connection.peer.peer_choking = false;
        let kind = connection.handle_command(PeerCommand::Request(request)).await.unwrap();
        assert!(kind.is_none());
        assert_eq!(connection.peer.in_flight.len(), 1);
    }

    #[tokio::test]
    async fn test_request_beyond_pipeline_is_rejected() {
        let (mut connection, mut remote) = connected_pair(4).await;
        connection.peer.am_interested = true;
        connection.peer.peer_choking = false;

        let max = connection.config.max_pipeline as u32;
        for i in 0..max {
            let request = BlockRequest { index: 0, begin: i * 16384, length: 16384 };
            assert!(connection.handle_command(PeerCommand::Request(request)).await.unwrap().is_none());
        }
        let extra = BlockRequest { index: 1, begin: 0, length: 16384 };
        let kind = connection.handle_command(PeerCommand::Request(extra)).await.unwrap();
        assert!(matches!(kind, Some(PeerEventKind::Rejected(r)) if r == extra));
        assert_eq!(connection.peer.in_flight.len(), max as usize);

        let mut frames = FrameBuffer::new();
        for i in 0..max {
            let sent = read_frame(&mut remote, &mut frames).await;
            assert_eq!(sent, Message::Request { index: 0, begin: i * 16384, length: 16384 });
        }
    }
}
