//! Wire protocol utilities
//!
//! Frame reassembly and stream helpers for the BitTorrent wire protocol.
//! TCP delivers an arbitrary byte stream, so incoming bytes are buffered
//! until a whole length-prefixed frame is available.

use bytes::{Buf, BytesMut};
use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::handshake::HANDSHAKE_LENGTH;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// Largest frame accepted from a peer (length prefix excluded)
pub const MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;

/// Accumulates stream bytes and yields complete messages
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Append raw bytes received from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete message, or `None` if more bytes are needed
    ///
    /// A frame announcing more than [`MAX_FRAME_LENGTH`] bytes is a protocol
    /// error; the stream cannot be resynchronised after it.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Frame too large",
                format!("{} bytes exceeds limit of {}", length, MAX_FRAME_LENGTH),
            )
            .into());
        }

        if self.buf.len() < 4 + length {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(4 + length);
        frame.advance(4);
        trace!("Reassembled frame of {} bytes", length);
        Message::parse_payload(frame.freeze()).map(Some)
    }
}

/// WireProtocol trait for protocol utilities
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
///
/// `read_message` only ever awaits on `read_buf`, and bytes already read stay
/// in the frame buffer, so it can be used as a `select!` branch without
/// losing data when another branch wins.
#[derive(Debug, Default)]
pub struct BitTorrentWire {
    frames: FrameBuffer,
}

impl BitTorrentWire {
    pub fn new() -> Self {
        Self {
            frames: FrameBuffer::new(),
        }
    }
}

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        loop {
            if let Some(message) = self.frames.next_message()? {
                return Ok(message);
            }

            let n = reader.read_buf(&mut self.frames.buf).await?;
            if n == 0 {
                let detail = if self.frames.buffered() == 0 {
                    "connection closed by peer".to_string()
                } else {
                    format!("connection closed with {} bytes of a partial frame", self.frames.buffered())
                };
                return Err(TorrentError::peer_error(detail).into());
            }
        }
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        let serialized = message.serialize();
        writer.write_all(&serialized).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut data = [0u8; HANDSHAKE_LENGTH];
        reader.read_exact(&mut data).await?;
        Handshake::deserialize(&data)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_frames_split_across_reads() {
        let have = Message::Have { piece_index: 7 }.serialize();
        let unchoke = Message::Unchoke.serialize();
        let mut stream = have.to_vec();
        stream.extend_from_slice(&unchoke);

        let mut frames = FrameBuffer::new();
        frames.extend(&stream[..3]);
        assert!(frames.next_message().unwrap().is_none());
        frames.extend(&stream[3..7]);
        assert!(frames.next_message().unwrap().is_none());
        frames.extend(&stream[7..]);

        assert_eq!(frames.next_message().unwrap(), Some(Message::Have { piece_index: 7 }));
        assert_eq!(frames.next_message().unwrap(), Some(Message::Unchoke));
        assert!(frames.next_message().unwrap().is_none());
        assert_eq!(frames.buffered(), 0);
    }

    #[test]
    fn test_keepalive_frame() {
        let mut frames = FrameBuffer::new();
        frames.extend(&[0, 0, 0, 0, 0, 0]);
        assert_eq!(frames.next_message().unwrap(), Some(Message::KeepAlive));
        assert!(frames.next_message().unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut frames = FrameBuffer::new();
        frames.extend(&((MAX_FRAME_LENGTH as u32) + 1).to_be_bytes());
        assert!(frames.next_message().is_err());
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let piece = Message::Piece { index: 1, begin: 0, block: Bytes::from(vec![9u8; 100]) };

        let mut writer = BitTorrentWire::new();
        writer.write_message(&mut client, &piece).await.unwrap();
        writer.write_message(&mut client, &Message::Choke).await.unwrap();
        drop(client);

        let mut reader = BitTorrentWire::new();
        assert_eq!(reader.read_message(&mut server).await.unwrap(), piece);
        assert_eq!(reader.read_message(&mut server).await.unwrap(), Message::Choke);
        assert!(reader.read_message(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(128);
        let handshake = Handshake::new([4u8; 20], [5u8; 20]);

        let mut wire = BitTorrentWire::new();
        wire.write_handshake(&mut client, &handshake).await.unwrap();
        wire.write_message(&mut client, &Message::Interested).await.unwrap();

        let mut reader = BitTorrentWire::new();
        assert_eq!(reader.read_handshake(&mut server).await.unwrap(), handshake);
        assert_eq!(reader.read_message(&mut server).await.unwrap(), Message::Interested);
    }
}
