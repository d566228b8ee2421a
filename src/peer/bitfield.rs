//! Piece ownership bitfield
//!
//! Bits are numbered from the high bit of the first byte, so piece 0 is
//! `0x80` of byte 0.

use bytes::Bytes;
use anyhow::Result;

use crate::error::TorrentError;

/// The set of pieces a peer owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for the given number of pieces
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Decodes a `bitfield` message payload
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes. Spare bits
    /// in the last byte are cleared rather than rejected.
    pub fn from_payload(payload: &[u8], piece_count: usize) -> Result<Self> {
        let expected = piece_count.div_ceil(8);
        if payload.len() != expected {
            return Err(TorrentError::protocol_error_with_source(
                "Bitfield has wrong length",
                format!("expected {} bytes for {} pieces, got {}", expected, piece_count, payload.len()),
            )
            .into());
        }

        let mut bf = Self {
            bits: payload.to_vec(),
            piece_count,
        };
        bf.clear_spare_bits();
        Ok(bf)
    }

    /// Creates a full bitfield
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    pub fn set_piece(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        self.bits[index / 8] |= 1 << (7 - (index % 8));
    }

    /// Number of pieces present
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Indices of all pieces present, ascending
    pub fn available_pieces(&self) -> Vec<usize> {
        (0..self.piece_count).filter(|&i| self.has_piece(i)).collect()
    }

    /// Encodes the bitfield for a `bitfield` message
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 && spare < 8 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
