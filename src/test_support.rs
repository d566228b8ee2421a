//! In-process tracker and seeder used by the async tests

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::peer::Bitfield;
use crate::protocol::{FrameBuffer, Handshake, Message};
use crate::torrent::TorrentInfo;
use crate::tracker::session::PROTOCOL_ID;

/// Single-file descriptor over `content`
pub fn descriptor(content: &[u8], piece_length: u64, announce: &str) -> TorrentInfo {
    TorrentInfo {
        announce: announce.to_string(),
        announce_list: vec![announce.to_string()],
        info_hash: Sha1::digest(content).into(),
        piece_length,
        pieces: content
            .chunks(piece_length as usize)
            .map(|c| -> [u8; 20] { Sha1::digest(c).into() })
            .collect(),
        name: "fixture.bin".to_string(),
        length: Some(content.len() as u64),
        files: None,
    }
}

#[derive(Debug, Clone)]
pub struct RecordedAnnounce {
    pub info_hash: [u8; 20],
    pub event: u32,
    pub left: u64,
    pub port: u16,
}

#[derive(Debug, Default)]
struct TrackerState {
    announces: Vec<RecordedAnnounce>,
    bogus_connect_first: bool,
    reject: Option<String>,
    peers: Vec<SocketAddr>,
    interval: u32,
}

/// A BEP 15 tracker answering from a fixed peer list
pub struct FakeTracker {
    addr: SocketAddr,
    connection_id: u64,
    state: Arc<Mutex<TrackerState>>,
    task: JoinHandle<()>,
}

impl FakeTracker {
    pub async fn start(peers: Vec<SocketAddr>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let connection_id: u64 = 0x1122_3344_5566_7788;
        let state = Arc::new(Mutex::new(TrackerState { peers, interval: 1800, ..TrackerState::default() }));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else { return };
                let data = &buf[..n];
                if n < 16 {
                    continue;
                }
                let action = u32::from_be_bytes(data[8..12].try_into().unwrap());
                let txid = u32::from_be_bytes(data[12..16].try_into().unwrap());

                let replies = {
                    let mut state = shared.lock().unwrap();
                    if n == 16 && action == 0 && data[..8] == PROTOCOL_ID.to_be_bytes() {
                        let mut replies = Vec::new();
                        if std::mem::take(&mut state.bogus_connect_first) {
                            replies.push(reply(0, txid ^ 0xFFFF_FFFF, &connection_id.to_be_bytes()));
                        }
                        replies.push(reply(0, txid, &connection_id.to_be_bytes()));
                        replies
                    } else if n == 98 && action == 1 && data[..8] == connection_id.to_be_bytes() {
                        state.announces.push(RecordedAnnounce {
                            info_hash: data[16..36].try_into().unwrap(),
                            left: u64::from_be_bytes(data[64..72].try_into().unwrap()),
                            event: u32::from_be_bytes(data[80..84].try_into().unwrap()),
                            port: u16::from_be_bytes(data[96..98].try_into().unwrap()),
                        });
                        if let Some(message) = &state.reject {
                            vec![reply(3, txid, message.as_bytes())]
                        } else {
                            let mut body = Vec::new();
                            body.extend_from_slice(&state.interval.to_be_bytes());
                            body.extend_from_slice(&0u32.to_be_bytes());
                            body.extend_from_slice(&(state.peers.len() as u32).to_be_bytes());
                            for peer in &state.peers {
                                if let SocketAddr::V4(v4) = peer {
                                    body.extend_from_slice(&v4.ip().octets());
                                    body.extend_from_slice(&v4.port().to_be_bytes());
                                }
                            }
                            vec![reply(1, txid, &body)]
                        }
                    } else {
                        Vec::new()
                    }
                };

                for datagram in replies {
                    let _ = socket.send_to(&datagram, from).await;
                }
            }
        });

        Self { addr, connection_id, state, task }
    }

    pub fn url(&self) -> String {
        format!("udp://{}/announce", self.addr)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Precede the next connect reply with one carrying a wrong transaction id
    pub fn send_bogus_connect_reply_first(&self) {
        self.state.lock().unwrap().bogus_connect_first = true;
    }

    pub fn reject_announces(&self, message: &str) {
        self.state.lock().unwrap().reject = Some(message.to_string());
    }

    pub fn set_interval(&self, secs: u32) {
        self.state.lock().unwrap().interval = secs;
    }

    pub fn announces(&self) -> Vec<RecordedAnnounce> {
        self.state.lock().unwrap().announces.clone()
    }
}

impl Drop for FakeTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn reply(action: u32, txid: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + body.len());
    buf.extend_from_slice(&action.to_be_bytes());
    buf.extend_from_slice(&txid.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

#[derive(Debug, Clone, Default)]
pub struct SeederOptions {
    /// Serve garbage for this piece the first time any of its blocks is asked for
    pub corrupt_once: Option<u32>,
    /// Answer the handshake with this info hash instead of the right one
    pub wrong_info_hash: bool,
    /// Close the connection after serving this many blocks
    pub close_after_blocks: Option<usize>,
}

/// A TCP peer that owns every piece and answers every request
pub struct FakeSeeder {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl FakeSeeder {
    pub async fn start(info: &TorrentInfo, content: Vec<u8>, options: SeederOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let content = Arc::new(content);
        let info_hash = info.info_hash;
        let piece_length = info.piece_length;
        let piece_count = info.piece_count();
        let corrupted = Arc::new(Mutex::new(options.corrupt_once));

        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                let content = content.clone();
                let corrupted = corrupted.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, info_hash, piece_length, piece_count, content, corrupted, options).await;
                });
            }
        });

        Self { addr, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for FakeSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    info_hash: [u8; 20],
    piece_length: u64,
    piece_count: usize,
    content: Arc<Vec<u8>>,
    corrupted: Arc<Mutex<Option<u32>>>,
    options: SeederOptions,
) -> std::io::Result<()> {
    let mut theirs = [0u8; 68];
    socket.read_exact(&mut theirs).await?;
    let announced_hash = if options.wrong_info_hash { [0xEEu8; 20] } else { info_hash };
    socket.write_all(&Handshake::new(announced_hash, [0x53u8; 20]).serialize()).await?;
    socket
        .write_all(&Message::Bitfield { bitfield: Bitfield::full(piece_count).to_bytes() }.serialize())
        .await?;
    socket.write_all(&Message::Unchoke.serialize()).await?;

    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut served = 0usize;
    loop {
        while let Ok(Some(message)) = frames.next_message() {
            if let Message::Request { index, begin, length } = message {
                let start = (index as u64 * piece_length + begin as u64) as usize;
                let mut block = content[start..start + length as usize].to_vec();
                let corrupt = {
                    let mut target = corrupted.lock().unwrap();
                    if *target == Some(index) {
                        *target = None;
                        true
                    } else {
                        false
                    }
                };
                if corrupt {
                    block.iter_mut().for_each(|b| *b = !*b);
                }
                let piece = Message::Piece { index, begin, block: Bytes::from(block) };
                socket.write_all(&piece.serialize()).await?;
                served += 1;
                if options.close_after_blocks.is_some_and(|limit| served >= limit) {
                    // FIN, not RST, so the served block is still delivered
                    socket.shutdown().await?;
                    while socket.read(&mut buf).await? > 0 {}
                    return Ok(());
                }
            }
        }

        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        frames.extend(&buf[..n]);
    }
}
