//! Download coordinator
//!
//! Owns the piece manager and drives one download: tracker discovery, a
//! bounded pool of peer connections, request dispatch, flushing verified
//! pieces to storage, and teardown. Every connection reports through one
//! event channel, so all piece state changes happen on this task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{interval_at, sleep_until, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::TorrentError;
use crate::peer::{PeerCommand, PeerConfig, PeerConnection, PeerEvent, PeerEventKind};
use crate::protocol::{Handshake, Message};
use crate::storage::{BlockOutcome, BlockRequest, PieceManager, PieceManagerConfig, StorageBackend, VerifiedPiece};
use crate::torrent::TorrentInfo;
use crate::tracker::{AnnounceResponse, AnnounceStats, TrackerClient, TrackerConfig, TrackerEvent};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Concurrent peer connections
    pub max_connections: usize,
    /// How often timed-out requests are swept
    pub sweep_interval: Duration,
    /// Send a `completed` announce when done
    pub announce_completed: bool,
    /// Grace period for connections to close on teardown
    pub shutdown_grace: Duration,
    pub peer: PeerConfig,
    pub pieces: PieceManagerConfig,
    pub tracker: TrackerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_connections: 30,
            sweep_interval: Duration::from_secs(5),
            announce_completed: true,
            shutdown_grace: Duration::from_secs(5),
            peer: PeerConfig::default(),
            pieces: PieceManagerConfig::default(),
            tracker: TrackerConfig { port: 6881, ..TrackerConfig::default() },
        }
    }
}

/// Outcome of a run, printed by `--json`
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub name: String,
    pub info_hash: String,
    pub total_bytes: u64,
    pub pieces: usize,
    pub verified_pieces: usize,
    pub failed_verifications: u64,
    pub peers_discovered: usize,
    pub peers_connected: usize,
    pub tracker: Option<String>,
    pub elapsed_secs: f64,
    pub complete: bool,
}

/// Coordinator-side view of one connection
struct PeerHandle {
    commands: mpsc::Sender<PeerCommand>,
    established: bool,
    unchoked: bool,
    interested: bool,
}

impl PeerHandle {
    fn send(&self, command: PeerCommand) {
        if let Err(e) = self.commands.try_send(command) {
            debug!("Command dropped: {}", e);
        }
    }
}

/// State of one `download_from` run
struct Swarm {
    connections: HashMap<SocketAddr, PeerHandle>,
    backlog: VecDeque<SocketAddr>,
    sessions: JoinSet<()>,
    /// Peer served by each session task
    session_peers: HashMap<task::Id, SocketAddr>,
    flushes: JoinSet<Result<u32>>,
    events_tx: mpsc::Sender<PeerEvent>,
    fatal: Option<anyhow::Error>,
}

impl Swarm {
    fn new(events_tx: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            connections: HashMap::new(),
            backlog: VecDeque::new(),
            sessions: JoinSet::new(),
            session_peers: HashMap::new(),
            flushes: JoinSet::new(),
            events_tx,
            fatal: None,
        }
    }
}

pub struct DownloadCoordinator {
    info: Arc<TorrentInfo>,
    storage: Arc<dyn StorageBackend>,
    config: CoordinatorConfig,
    peer_id: [u8; 20],
    manager: PieceManager,
    tracker: Option<TrackerClient>,
    next_announce_at: Option<Instant>,
    discovered: HashSet<SocketAddr>,
    peers_connected: usize,
}

impl DownloadCoordinator {
    pub fn new(info: Arc<TorrentInfo>, storage: Arc<dyn StorageBackend>, config: CoordinatorConfig) -> Self {
        let manager = PieceManager::new(&info, config.pieces.clone());
        Self {
            info,
            storage,
            config,
            peer_id: Handshake::generate_peer_id(),
            manager,
            tracker: None,
            next_announce_at: None,
            discovered: HashSet::new(),
            peers_connected: 0,
        }
    }

    pub fn manager(&self) -> &PieceManager {
        &self.manager
    }

    /// Run the whole download
    pub async fn start(&mut self) -> Result<DownloadSummary> {
        let started = Instant::now();
        info!(
            "Starting download of '{}' ({} bytes, {} pieces, info hash {})",
            self.info.name,
            self.info.total_size(),
            self.info.piece_count(),
            self.info.info_hash_hex()
        );

        self.storage.initialize().await?;

        if !self.manager.is_complete() {
            let response = self.discover(TrackerEvent::None).await?;
            self.download_from(response.peers).await?;
        }

        if self.config.announce_completed && self.tracker.is_some() {
            if let Err(e) = self.discover(TrackerEvent::Completed).await {
                warn!("Completed announce failed: {}", e);
            }
        }

        let summary = self.summary(started.elapsed());
        info!(
            "Download finished: {}/{} pieces in {:.1}s",
            summary.verified_pieces, summary.pieces, summary.elapsed_secs
        );
        Ok(summary)
    }

    /// Announce to the first tracker that answers
    ///
    /// Once a tracker has answered it is reused for later announces.
    pub async fn discover(&mut self, event: TrackerEvent) -> Result<AnnounceResponse> {
        let stats = AnnounceStats {
            downloaded: self.info.total_size() - self.manager.bytes_left(),
            left: self.manager.bytes_left(),
            uploaded: 0,
        };

        if let Some(tracker) = self.tracker.as_mut() {
            let response = tracker.announce(self.info.info_hash, stats, event).await?;
            self.record_announce(&response);
            return Ok(response);
        }

        let urls = self.info.announce_list.clone();
        let mut last_error = None;
        for url in &urls {
            if !url.starts_with("udp://") {
                debug!("Skipping non-UDP tracker {}", url);
                continue;
            }

            let attempt = async {
                let mut tracker = TrackerClient::bind(url, self.peer_id, self.config.tracker.clone()).await?;
                let response = tracker.announce(self.info.info_hash, stats, event).await?;
                Ok::<_, anyhow::Error>((tracker, response))
            };

            match attempt.await {
                Ok((tracker, response)) => {
                    self.tracker = Some(tracker);
                    self.record_announce(&response);
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Tracker {} unusable: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TorrentError::config_error_with_field("Torrent lists no UDP tracker", "announce").into()
        }))
    }

    fn record_announce(&mut self, response: &AnnounceResponse) {
        // a zero interval must not turn an empty swarm into an announce loop
        let interval = Duration::from_secs(response.interval as u64).max(self.config.tracker.retry.base_timeout);
        self.next_announce_at = Some(Instant::now() + interval);
        self.discovered.extend(response.peers.iter().copied());
    }

    /// Download from the given peers until complete or a fatal error
    pub async fn download_from(&mut self, peers: Vec<SocketAddr>) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let mut swarm = Swarm::new(events_tx);
        self.enqueue(&mut swarm, peers);
        self.fill_pool(&mut swarm);

        let period = self.config.sweep_interval;
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if swarm.flushes.is_empty() && (swarm.fatal.is_some() || self.manager.is_complete()) {
                break;
            }

            // pending flushes are settled first, so a write failure is never
            // hidden behind the tracker interval
            if swarm.fatal.is_none()
                && !self.manager.is_complete()
                && swarm.connections.is_empty()
                && swarm.backlog.is_empty()
                && swarm.flushes.is_empty()
            {
                if let Err(e) = self.reannounce(&mut swarm).await {
                    error!("No peers left and re-announce failed: {}", e);
                    swarm.fatal = Some(e);
                }
                continue;
            }

            tokio::select! {
                Some(event) = events_rx.recv() => self.handle_event(&mut swarm, event),
                Some(flushed) = swarm.flushes.join_next(), if !swarm.flushes.is_empty() => {
                    match flushed {
                        Ok(Ok(index)) => debug!("Piece {} flushed to storage", index),
                        Ok(Err(e)) => self.abort(&mut swarm, e),
                        Err(e) => self.abort(&mut swarm, TorrentError::storage_error(format!("Flush task failed: {}", e)).into()),
                    }
                }
                Some(joined) = swarm.sessions.join_next_with_id(), if !swarm.sessions.is_empty() => {
                    self.session_ended(&mut swarm, joined);
                }
                _ = sweep.tick() => self.sweep(&mut swarm),
            }
        }

        self.teardown(&mut swarm, &mut events_rx).await;

        match swarm.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait out the tracker interval, then ask for more peers
    async fn reannounce(&mut self, swarm: &mut Swarm) -> Result<()> {
        if let Some(at) = self.next_announce_at {
            info!("Out of peers, re-announcing in {:?}", at.saturating_duration_since(Instant::now()));
            sleep_until(at).await;
        }
        let response = self.discover(TrackerEvent::None).await?;
        self.enqueue(swarm, response.peers);
        self.fill_pool(swarm);
        Ok(())
    }

    fn enqueue(&self, swarm: &mut Swarm, peers: Vec<SocketAddr>) {
        for addr in peers {
            if !swarm.connections.contains_key(&addr) && !swarm.backlog.contains(&addr) {
                swarm.backlog.push_back(addr);
            }
        }
    }

    fn fill_pool(&mut self, swarm: &mut Swarm) {
        if swarm.fatal.is_some() {
            return;
        }
        while swarm.connections.len() < self.config.max_connections {
            let Some(addr) = swarm.backlog.pop_front() else { break };
            let (commands_tx, commands_rx) = mpsc::channel(64);
            let session = swarm.sessions.spawn(PeerConnection::session(
                addr,
                self.info.info_hash,
                self.peer_id,
                self.info.piece_count(),
                self.config.peer.clone(),
                swarm.events_tx.clone(),
                commands_rx,
            ));
            swarm.session_peers.insert(session.id(), addr);
            swarm.connections.insert(
                addr,
                PeerHandle { commands: commands_tx, established: false, unchoked: false, interested: false },
            );
        }
        debug!("{} connections open, {} peers waiting", swarm.connections.len(), swarm.backlog.len());
    }

    fn handle_event(&mut self, swarm: &mut Swarm, event: PeerEvent) {
        let addr = event.addr;
        match event.kind {
            PeerEventKind::Connected { .. } => {
                self.peers_connected += 1;
                if let Some(handle) = swarm.connections.get_mut(&addr) {
                    handle.established = true;
                }
            }
            PeerEventKind::Bitfield(bitfield) => {
                let interesting = self.manager.peer_bitfield(addr, &bitfield);
                self.update_interest(swarm, addr, interesting);
                self.dispatch(swarm, addr);
            }
            PeerEventKind::Have(index) => {
                let interesting = self.manager.peer_has(addr, index);
                self.update_interest(swarm, addr, interesting);
                self.dispatch(swarm, addr);
            }
            PeerEventKind::Unchoke => {
                if let Some(handle) = swarm.connections.get_mut(&addr) {
                    handle.unchoked = true;
                }
                self.dispatch(swarm, addr);
            }
            PeerEventKind::Choke => {
                if let Some(handle) = swarm.connections.get_mut(&addr) {
                    handle.unchoked = false;
                }
                self.manager.peer_choked(addr);
                self.dispatch_all(swarm);
            }
            PeerEventKind::Block { index, begin, data } => {
                let displaced = self.manager.requested_from(index, begin).filter(|owner| *owner != addr);
                let stored = self.manager.on_block(addr, index, begin, &data);
                if let (Some(owner), Ok(_)) = (displaced, &stored) {
                    // the block is in; the peer it was reassigned to can stop
                    if let Some(handle) = swarm.connections.get(&owner) {
                        handle.send(PeerCommand::Cancel(BlockRequest { index, begin, length: data.len() as u32 }));
                    }
                    self.dispatch(swarm, owner);
                }
                match stored {
                    Ok(BlockOutcome::Verified(piece)) => self.on_verified(swarm, piece),
                    Ok(BlockOutcome::Corrupt { index, persistent }) => {
                        if persistent {
                            error!("Piece {} keeps failing verification", index);
                        }
                    }
                    Ok(BlockOutcome::Stored) | Ok(BlockOutcome::Duplicate) => {}
                    Err(e) => {
                        warn!("Bad block from {}: {}", addr, e);
                        if let Some(handle) = swarm.connections.get(&addr) {
                            handle.send(PeerCommand::Shutdown);
                        }
                    }
                }
                self.dispatch(swarm, addr);
            }
            PeerEventKind::Rejected(request) => {
                if self.manager.release_request(addr, request) {
                    let others: Vec<SocketAddr> = swarm.connections.keys().copied().filter(|p| *p != addr).collect();
                    for peer in others {
                        self.dispatch(swarm, peer);
                    }
                }
            }
            PeerEventKind::Closed { reason, stats } => {
                debug!("Peer {} closed after {} blocks: {}", addr, stats.blocks_received, reason);
                self.peer_gone(swarm, addr);
            }
        }
    }

    /// Drop a peer's connection and hand its work to the rest
    fn peer_gone(&mut self, swarm: &mut Swarm, addr: SocketAddr) {
        swarm.connections.remove(&addr);
        self.manager.peer_disconnected(addr);
        self.fill_pool(swarm);
        self.dispatch_all(swarm);
    }

    /// A session task finished; one that died without `Closed` is cleaned up here
    fn session_ended(&mut self, swarm: &mut Swarm, joined: Result<(task::Id, ()), JoinError>) {
        match joined {
            Ok((id, ())) => {
                swarm.session_peers.remove(&id);
            }
            Err(e) => {
                let Some(addr) = swarm.session_peers.remove(&e.id()) else { return };
                error!("Session for peer {} died: {}", addr, e);
                if swarm.connections.contains_key(&addr) {
                    self.peer_gone(swarm, addr);
                }
            }
        }
    }

    fn update_interest(&self, swarm: &mut Swarm, addr: SocketAddr, interesting: bool) {
        if let Some(handle) = swarm.connections.get_mut(&addr) {
            if interesting && !handle.interested {
                handle.interested = true;
                handle.send(PeerCommand::Send(Message::Interested));
            }
        }
    }

    /// Hand a peer as many requests as its pipeline allows
    fn dispatch(&mut self, swarm: &mut Swarm, addr: SocketAddr) {
        if swarm.fatal.is_some() {
            return;
        }
        let Some(handle) = swarm.connections.get(&addr) else { return };
        if !(handle.established && handle.unchoked && handle.interested) {
            return;
        }
        for request in self.manager.next_requests(addr) {
            handle.send(PeerCommand::Request(request));
        }
    }

    fn dispatch_all(&mut self, swarm: &mut Swarm) {
        let peers: Vec<SocketAddr> = swarm.connections.keys().copied().collect();
        for addr in peers {
            self.dispatch(swarm, addr);
        }
    }

    fn on_verified(&mut self, swarm: &mut Swarm, piece: VerifiedPiece) {
        let index = piece.index;
        info!(
            "Piece {} verified ({}/{}, {} bytes left)",
            index,
            self.manager.verified_count(),
            self.manager.piece_count(),
            self.manager.bytes_left()
        );

        let storage = self.storage.clone();
        swarm.flushes.spawn(async move {
            storage.write_at(piece.offset, piece.data).await?;
            Ok(piece.index)
        });

        for (&peer, handle) in swarm.connections.iter_mut() {
            if !handle.established {
                continue;
            }
            if !self.manager.is_owner(peer, index) {
                handle.send(PeerCommand::Send(Message::Have { piece_index: index }));
            }
            if handle.interested && !self.manager.is_interesting(peer) {
                handle.interested = false;
                handle.send(PeerCommand::Send(Message::NotInterested));
            }
        }
    }

    fn sweep(&mut self, swarm: &mut Swarm) {
        let expired = self.manager.reclaim_expired(Instant::now());
        for (owner, request) in &expired {
            if let Some(handle) = swarm.connections.get(owner) {
                handle.send(PeerCommand::Cancel(*request));
            }
        }
        if !expired.is_empty() {
            self.dispatch_all(swarm);
        }
    }

    /// Stop requesting and close every connection; issued flushes keep running
    fn abort(&mut self, swarm: &mut Swarm, err: anyhow::Error) {
        error!("Aborting download: {}", err);
        if swarm.fatal.is_none() {
            swarm.fatal = Some(err);
        }
        swarm.backlog.clear();
        for handle in swarm.connections.values() {
            handle.send(PeerCommand::Shutdown);
        }
    }

    async fn teardown(&mut self, swarm: &mut Swarm, events_rx: &mut mpsc::Receiver<PeerEvent>) {
        for handle in swarm.connections.values() {
            handle.send(PeerCommand::Shutdown);
        }
        swarm.connections.clear();
        swarm.backlog.clear();

        swarm.session_peers.clear();
        let drain = async {
            while !swarm.sessions.is_empty() {
                tokio::select! {
                    _ = swarm.sessions.join_next() => {}
                    Some(_) = events_rx.recv() => {}
                }
            }
        };
        if timeout(self.config.shutdown_grace, drain).await.is_err() {
            debug!("Aborting {} connections still closing", swarm.sessions.len());
        }
        swarm.sessions.shutdown().await;
    }

    pub fn summary(&self, elapsed: Duration) -> DownloadSummary {
        DownloadSummary {
            name: self.info.name.clone(),
            info_hash: self.info.info_hash_hex(),
            total_bytes: self.info.total_size(),
            pieces: self.manager.piece_count(),
            verified_pieces: self.manager.verified_count(),
            failed_verifications: self.manager.failed_verifications(),
            peers_discovered: self.discovered.len(),
            peers_connected: self.peers_connected,
            tracker: self.tracker.as_ref().map(|t| t.url().to_string()),
            elapsed_secs: elapsed.as_secs_f64(),
            complete: self.manager.is_complete(),
        }
    }
}
