//! UDP tracker client
//!
//! Runs the BEP 15 connect and announce exchanges over one connected UDP
//! socket. Each request is retransmitted unchanged on timeout; datagrams
//! that don't answer the request in flight are dropped without resetting
//! the timer.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{classify, TorrentError};
use crate::tracker::backoff::RetryPolicy;
use crate::tracker::response::{AnnounceResponse, TrackerEvent};
use crate::tracker::session::{AnnounceParams, TrackerPhase, TrackerSession};

#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    pub retry: RetryPolicy,
    /// Port announced to the tracker
    pub port: u16,
}

/// Progress figures sent with an announce
#[derive(Debug, Clone, Copy)]
pub struct AnnounceStats {
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
}

pub struct TrackerClient {
    url: String,
    addr: SocketAddr,
    socket: UdpSocket,
    session: TrackerSession,
    config: TrackerConfig,
    peer_id: [u8; 20],
    key: u32,
}

impl TrackerClient {
    /// Resolve a `udp://host:port[/path]` URL and bind a socket for it
    pub async fn bind(url: &str, peer_id: [u8; 20], config: TrackerConfig) -> Result<Self> {
        let parsed = Url::parse(url).map_err(TorrentError::from)?;
        if parsed.scheme() != "udp" {
            return Err(TorrentError::config_error_with_field(
                format!("Unsupported tracker scheme '{}'", parsed.scheme()),
                "announce",
            )
            .into());
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| TorrentError::config_error_with_field("Tracker URL has no host", "announce"))?;
        let port = parsed
            .port()
            .ok_or_else(|| TorrentError::config_error_with_field("Tracker URL has no port", "announce"))?;

        let addr = lookup_host((host.trim_start_matches('[').trim_end_matches(']'), port))
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to resolve tracker", url, e.to_string()))?
            .next()
            .ok_or_else(|| TorrentError::network_error_full("Tracker resolved to no address", url, host))?;

        let local: SocketAddr = if addr.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { ([0u16; 8], 0).into() };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to bind UDP socket", local.to_string(), e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to connect UDP socket", addr.to_string(), e.to_string()))?;

        debug!("Tracker {} resolved to {}", url, addr);
        Ok(Self {
            url: url.to_string(),
            addr,
            socket,
            session: TrackerSession::new(),
            config,
            peer_id,
            key: rand::random(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn session(&self) -> &TrackerSession {
        &self.session
    }

    /// Obtain a connection id
    pub async fn connect(&mut self) -> Result<u64> {
        let request = self.session.begin_connect();
        debug!("Connecting to tracker {} (transaction {:#010x})", self.url, self.session.transaction_id);
        self.round_trip(&request, TrackerSession::handle_connect_response).await
    }

    /// Announce, reconnecting first if the connection id is missing or stale
    pub async fn announce(&mut self, info_hash: [u8; 20], stats: AnnounceStats, event: TrackerEvent) -> Result<AnnounceResponse> {
        if !self.session.connection_valid(Instant::now()) {
            self.connect().await?;
        }

        let params = AnnounceParams {
            info_hash,
            peer_id: self.peer_id,
            downloaded: stats.downloaded,
            left: stats.left,
            uploaded: stats.uploaded,
            event,
            key: self.key,
            port: self.config.port,
        };
        let request = self.session.begin_announce(&params)?;
        debug!("Announcing {:?} to {} (transaction {:#010x})", event, self.url, self.session.transaction_id);

        let response = self.round_trip(&request, TrackerSession::handle_announce_response).await?;
        info!(
            "Tracker {} returned {} peers ({} seeders, {} leechers, interval {}s)",
            self.url,
            response.peers.len(),
            response.seeders,
            response.leechers,
            response.interval
        );
        Ok(response)
    }

    /// Send `request` until `parse` accepts a reply or the retry budget runs out
    async fn round_trip<T>(
        &mut self,
        request: &[u8],
        parse: impl Fn(&mut TrackerSession, &[u8]) -> Result<T>,
    ) -> Result<T> {
        let policy = self.config.retry;
        let mut buf = vec![0u8; 2048];

        for attempt in 0..policy.attempts() {
            self.session.retry_count = attempt;
            self.socket
                .send(request)
                .await
                .map_err(|e| TorrentError::network_error_full("Failed to send to tracker", self.addr.to_string(), e.to_string()))?;

            let wait = policy.timeout_for(attempt);
            let deadline = Instant::now() + wait;
            trace!("Attempt {} to {}, waiting {:?}", attempt, self.url, wait);

            loop {
                let n = match timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Err(_) => {
                        debug!("No reply from {} within {:?}", self.url, wait);
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!("Receive from tracker {} failed: {}", self.url, e);
                        continue;
                    }
                    Ok(Ok(n)) => n,
                };

                match parse(&mut self.session, &buf[..n]) {
                    Ok(value) => return Ok(value),
                    Err(e) if classify(&e).is_some_and(TorrentError::is_protocol) => {
                        debug!("Ignoring datagram from {}: {}", self.url, e);
                    }
                    Err(e) => {
                        self.session.phase = TrackerPhase::Failed;
                        if let Some(TorrentError::TrackerError { message, .. }) = classify(&e) {
                            warn!("Tracker {} rejected the request: {}", self.url, message);
                            return Err(TorrentError::tracker_error_with_tracker(message.clone(), self.url.clone()).into());
                        }
                        return Err(e);
                    }
                }
            }
        }

        self.session.phase = TrackerPhase::Failed;
        warn!("Tracker {} did not answer after {} attempts", self.url, policy.attempts());
        Err(TorrentError::tracker_timeout(self.url.clone(), policy.attempts()).into())
    }
}
