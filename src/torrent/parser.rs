//! Torrent file parser
//!
//! Decodes a bencoded `.torrent` container into a `TorrentInfo`. The info
//! hash is taken over the canonical re-encoding of the `info` dictionary.

use std::collections::HashMap;

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

type Dict = HashMap<Vec<u8>, Value>;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root: Value = serde_bencode::from_bytes(data).map_err(|e| {
            error!("Failed to decode torrent container: {}", e);
            TorrentError::from(e)
        })?;

        let info = Self::convert_to_torrent_info(root)?;
        info.validate()?;
        Ok(info)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert_to_torrent_info(root: Value) -> Result<TorrentInfo> {
        let root_dict = match root {
            Value::Dict(d) => d,
            _ => return Err(TorrentError::parse_error("Root must be a dictionary").into()),
        };

        let announce = get_string(&root_dict, b"announce")
            .ok_or_else(|| TorrentError::parse_error("Missing announce field"))?;

        let mut announce_list = vec![announce.clone()];
        if let Some(Value::List(tiers)) = root_dict.get(b"announce-list".as_slice()) {
            for tier in tiers {
                if let Value::List(urls) = tier {
                    for url in urls {
                        if let Value::Bytes(bytes) = url {
                            let url = String::from_utf8_lossy(bytes).to_string();
                            if !announce_list.contains(&url) {
                                announce_list.push(url);
                            }
                        }
                    }
                }
            }
        }

        let info_value = root_dict
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_dict = match info_value {
            Value::Dict(d) => d,
            _ => return Err(TorrentError::parse_error("info must be a dictionary").into()),
        };

        // serde_bencode writes dictionary keys in sorted order, which is the
        // canonical form the info hash is defined over.
        let info_bytes = serde_bencode::to_bytes(info_value)?;
        let info_hash = TorrentInfo::generate_info_hash(&info_bytes);

        let name = get_string(info_dict, b"name").unwrap_or_default();

        let piece_length = get_int(info_dict, b"piece length")
            .filter(|len| *len > 0)
            .ok_or_else(|| TorrentError::parse_error("Missing or invalid piece length"))? as u64;

        let pieces_bytes = match info_dict.get(b"pieces".as_slice()) {
            Some(Value::Bytes(b)) => b,
            _ => return Err(TorrentError::parse_error("Missing pieces field").into()),
        };
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let (length, files) = if let Some(len) = get_int(info_dict, b"length") {
            if len < 0 {
                return Err(TorrentError::parse_error("Negative length").into());
            }
            (Some(len as u64), None)
        } else if let Some(Value::List(file_list)) = info_dict.get(b"files".as_slice()) {
            let mut torrent_files = Vec::with_capacity(file_list.len());
            for entry in file_list {
                let file_dict = match entry {
                    Value::Dict(d) => d,
                    _ => return Err(TorrentError::parse_error("File entry must be a dictionary").into()),
                };
                let file_len = get_int(file_dict, b"length")
                    .filter(|len| *len >= 0)
                    .ok_or_else(|| TorrentError::parse_error("Missing file length"))? as u64;

                let path = match file_dict.get(b"path".as_slice()) {
                    Some(Value::List(parts)) => parts
                        .iter()
                        .filter_map(|p| match p {
                            Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                    _ => return Err(TorrentError::parse_error("Missing file path").into()),
                };

                torrent_files.push(TorrentFile { path, length: file_len });
            }
            (None, Some(torrent_files))
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        info!("Parsed torrent '{}' ({} pieces, info hash {})", name, pieces.len(), hex::encode(info_hash));
        Ok(TorrentInfo {
            announce,
            announce_list,
            info_hash,
            piece_length,
            pieces,
            name,
            length,
            files,
        })
    }
}

fn get_string(dict: &Dict, key: &[u8]) -> Option<String> {
    match dict.get(key) {
        Some(Value::Bytes(b)) => Some(String::from_utf8_lossy(b).to_string()),
        _ => None,
    }
}

fn get_int(dict: &Dict, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect())
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let info = dict(vec![
            ("name", bytes("movie.bin")),
            ("piece length", Value::Int(16384)),
            ("pieces", Value::Bytes(vec![7u8; 40])),
            ("length", Value::Int(32768)),
        ]);
        let root = dict(vec![("announce", bytes("udp://tracker.example.com:6969/announce")), ("info", info.clone())]);
        let data = serde_bencode::to_bytes(&root).unwrap();

        let parsed = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(parsed.announce, "udp://tracker.example.com:6969/announce");
        assert_eq!(parsed.name, "movie.bin");
        assert_eq!(parsed.piece_length, 16384);
        assert_eq!(parsed.pieces.len(), 2);
        assert_eq!(parsed.total_size(), 32768);

        let expected = TorrentInfo::generate_info_hash(&serde_bencode::to_bytes(&info).unwrap());
        assert_eq!(parsed.info_hash, expected);
    }

    #[test]
    fn test_parse_multi_file_torrent() {
        let files = Value::List(vec![
            dict(vec![("length", Value::Int(10)), ("path", Value::List(vec![bytes("a"), bytes("x.txt")]))]),
            dict(vec![("length", Value::Int(6)), ("path", Value::List(vec![bytes("y.txt")]))]),
        ]);
        let info = dict(vec![
            ("name", bytes("bundle")),
            ("piece length", Value::Int(8)),
            ("pieces", Value::Bytes(vec![0u8; 40])),
            ("files", files),
        ]);
        let root = dict(vec![
            ("announce", bytes("udp://a.example:1")),
            ("announce-list", Value::List(vec![Value::List(vec![bytes("udp://a.example:1"), bytes("udp://b.example:2")])])),
            ("info", info),
        ]);
        let data = serde_bencode::to_bytes(&root).unwrap();

        let parsed = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(parsed.announce_list, vec!["udp://a.example:1", "udp://b.example:2"]);
        let files = parsed.files.unwrap();
        assert_eq!(files[0].path, vec!["a", "x.txt"]);
        assert_eq!(files[1].length, 6);
    }

    #[test]
    fn test_parse_rejects_inconsistent_piece_count() {
        let info = dict(vec![
            ("name", bytes("short")),
            ("piece length", Value::Int(16384)),
            ("pieces", Value::Bytes(vec![7u8; 20])),
            ("length", Value::Int(32768)),
        ]);
        let root = dict(vec![("announce", bytes("udp://t:1")), ("info", info)]);
        let data = serde_bencode::to_bytes(&root).unwrap();

        assert!(TorrentParser::parse_bytes(&data).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TorrentParser::parse_bytes(b"not bencode").is_err());
        assert!(TorrentParser::parse_bytes(b"i42e").is_err());
    }
}
