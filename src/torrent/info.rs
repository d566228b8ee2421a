//! Torrent descriptor
//!
//! The immutable description of a torrent that the tracker, peer and piece
//! layers read for the whole run.

use sha1::{Digest, Sha1};
use anyhow::Result;

use crate::error::TorrentError;

/// Represents a file in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// High-level torrent information
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: String,
    /// All tracker URLs, primary first, duplicates removed
    pub announce_list: Vec<String>,
    /// SHA1 hash of info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        if let Some(length) = self.length {
            length
        } else if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Files in stream order; a single-file torrent yields one entry named after the torrent
    pub fn file_layout(&self) -> Vec<TorrentFile> {
        match (&self.files, self.length) {
            (Some(files), _) => files.clone(),
            (None, Some(length)) => vec![TorrentFile {
                path: vec![self.name.clone()],
                length,
            }],
            (None, None) => Vec::new(),
        }
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {}", pieces_bytes.len()),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.total_size());

        Some((start, end))
    }

    /// Length of a piece; only the last one may be short
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Check the layout invariants every other component relies on
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("Piece length must be positive", "piece length").into());
        }

        if let Some(files) = &self.files {
            if files.is_empty() {
                return Err(TorrentError::validation_error_with_field("Multi-file torrent lists no files", "files").into());
            }
        }

        let total = self.total_size();
        let expected_pieces = total.div_ceil(self.piece_length);
        if expected_pieces != self.pieces.len() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!(
                    "Expected {} piece hashes for {} bytes at {} bytes per piece, found {}",
                    expected_pieces,
                    total,
                    self.piece_length,
                    self.pieces.len()
                ),
                "pieces",
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file(length: u64, piece_length: u64, pieces: usize) -> TorrentInfo {
        TorrentInfo {
            announce: "udp://tracker.example.com:6969".to_string(),
            announce_list: vec!["udp://tracker.example.com:6969".to_string()],
            info_hash: [1u8; 20],
            piece_length,
            pieces: vec![[2u8; 20]; pieces],
            name: "test.bin".to_string(),
            length: Some(length),
            files: None,
        }
    }

    #[test]
    fn test_torrent_info_single_file() {
        let info = single_file(2048, 1024, 2);

        assert_eq!(info.total_size(), 2048);
        assert_eq!(info.piece_count(), 2);
        assert!(!info.is_multi_file());
        assert_eq!(info.info_hash_hex(), hex::encode([1u8; 20]));
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_torrent_info_multi_file() {
        let mut info = single_file(0, 1024, 1);
        info.length = None;
        info.files = Some(vec![
            TorrentFile { path: vec!["file1.txt".to_string()], length: 500 },
            TorrentFile { path: vec!["file2.txt".to_string()], length: 524 },
        ]);

        assert_eq!(info.total_size(), 1024);
        assert!(info.is_multi_file());
        assert_eq!(info.file_layout().len(), 2);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_file_layout_single_file() {
        let info = single_file(2048, 1024, 2);
        let files = info.file_layout();
        assert_eq!(files, vec![TorrentFile { path: vec!["test.bin".to_string()], length: 2048 }]);
    }

    #[test]
    fn test_validate_rejects_wrong_piece_count() {
        assert!(single_file(2049, 1024, 2).validate().is_err());
        assert!(single_file(2049, 1024, 3).validate().is_ok());
        assert!(single_file(1024, 0, 0).validate().is_err());
    }

    #[test]
    fn test_parse_piece_hashes() {
        let hashes: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let result = TorrentInfo::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1][0], 20);

        assert!(TorrentInfo::parse_piece_hashes(&[1u8; 21]).is_err());
    }

    #[test]
    fn test_piece_range_and_size() {
        let info = single_file(1500, 1024, 2);

        assert_eq!(info.piece_range(0), Some((0, 1024)));
        assert_eq!(info.piece_range(1), Some((1024, 1500)));
        assert_eq!(info.piece_range(2), None);
        assert_eq!(info.piece_size(1), Some(476));
    }
}
