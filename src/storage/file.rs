//! File storage module
//!
//! Maps the torrent's byte stream onto the files of its layout. Each file
//! starts at the sum of the lengths of the files before it; a write that
//! crosses a boundary is split across both files.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::StorageBackend;
use crate::torrent::TorrentInfo;

/// Represents a file entry in the storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Start of the file in the torrent's byte stream
    pub offset: u64,
    pub length: u64,
}

impl FileEntry {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// File storage for torrent data
#[derive(Debug)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
    entries: Vec<FileEntry>,
}

impl FileStorage {
    /// Build the file layout for a torrent under `base_path`
    ///
    /// Single-file torrents land at `base_path/<name>`, multi-file torrents
    /// under `base_path/<name>/`. Path components that would escape that
    /// directory are rejected.
    pub fn new(base_path: PathBuf, info: &TorrentInfo) -> Result<Self> {
        let root = if info.is_multi_file() {
            base_path.join(safe_component(&info.name)?)
        } else {
            base_path.clone()
        };

        let mut offset = 0;
        let mut entries = Vec::new();
        for file in info.file_layout() {
            let mut path = root.clone();
            for part in &file.path {
                path.push(safe_component(part)?);
            }
            entries.push(FileEntry { path, offset, length: file.length });
            offset += file.length;
        }

        debug!("File layout for '{}': {} files, {} bytes", info.name, entries.len(), offset);
        Ok(Self { base_path, entries })
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Files overlapping `[offset, offset + length)` with the overlap in file coordinates
    fn spans(&self, offset: u64, length: u64) -> Vec<(&FileEntry, u64, usize)> {
        let end = offset + length;
        self.entries
            .iter()
            .filter(|e| e.length > 0 && e.end() > offset && e.offset < end)
            .map(|e| {
                let start = offset.max(e.offset);
                let stop = end.min(e.end());
                (e, start - e.offset, (stop - start) as usize)
            })
            .collect()
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        let total = self.entries.last().map_or(0, FileEntry::end);
        if offset + length > total {
            return Err(TorrentError::storage_error(format!(
                "Range {}+{} past end of {}-byte torrent",
                offset, length, total
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn initialize(&self) -> Result<()> {
        info!("Creating file structure under {}", self.base_path.display());

        for entry in &self.entries {
            if let Some(parent) = entry.path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }

            // sparse pre-allocation
            let f = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&entry.path)
                .await
                .map_err(|e| io_error("Failed to create file", &entry.path, e))?;
            f.set_len(entry.length)
                .await
                .map_err(|e| io_error("Failed to set file length", &entry.path, e))?;
            trace!("Prepared {} ({} bytes)", entry.path.display(), entry.length);
        }

        Ok(())
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;

        let mut written = 0usize;
        for (entry, file_offset, len) in self.spans(offset, data.len() as u64) {
            trace!("Writing {} bytes to {} at {}", len, entry.path.display(), file_offset);
            let mut file = fs::OpenOptions::new()
                .write(true)
                .open(&entry.path)
                .await
                .map_err(|e| io_error("Failed to open file for writing", &entry.path, e))?;
            file.seek(std::io::SeekFrom::Start(file_offset))
                .await
                .map_err(|e| io_error("Failed to seek in file", &entry.path, e))?;
            file.write_all(&data[written..written + len])
                .await
                .map_err(|e| io_error("Failed to write to file", &entry.path, e))?;
            file.flush()
                .await
                .map_err(|e| io_error("Failed to flush file", &entry.path, e))?;
            written += len;
        }

        debug!("Wrote {} bytes at offset {}", written, offset);
        Ok(())
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.check_range(offset, length as u64)?;

        let mut buffer = Vec::with_capacity(length);
        for (entry, file_offset, len) in self.spans(offset, length as u64) {
            let mut file = fs::File::open(&entry.path)
                .await
                .map_err(|e| io_error("Failed to open file for reading", &entry.path, e))?;
            file.seek(std::io::SeekFrom::Start(file_offset))
                .await
                .map_err(|e| io_error("Failed to seek in file", &entry.path, e))?;
            let mut chunk = vec![0u8; len];
            file.read_exact(&mut chunk)
                .await
                .map_err(|e| io_error("Failed to read from file", &entry.path, e))?;
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

fn io_error(message: &str, path: &Path, e: std::io::Error) -> TorrentError {
    error!("{} '{}': {}", message, path.display(), e);
    TorrentError::storage_error_full(message, path.display().to_string(), e.to_string())
}

fn safe_component(part: &str) -> Result<&str> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(part),
        _ => Err(TorrentError::validation_error_with_field(format!("Unsafe path component '{}'", part), "path").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn multi_file(name: &str, files: Vec<(Vec<&str>, u64)>) -> TorrentInfo {
        let files: Vec<TorrentFile> = files
            .into_iter()
            .map(|(path, length)| TorrentFile { path: path.into_iter().map(String::from).collect(), length })
            .collect();
        let total: u64 = files.iter().map(|f| f.length).sum();
        TorrentInfo {
            announce: "udp://t:1".to_string(),
            announce_list: vec!["udp://t:1".to_string()],
            info_hash: [0u8; 20],
            piece_length: 8,
            pieces: vec![[0u8; 20]; total.div_ceil(8) as usize],
            name: name.to_string(),
            length: None,
            files: Some(files),
        }
    }

    #[test]
    fn test_offsets_are_cumulative() {
        let info = multi_file("bundle", vec![(vec!["a.txt"], 5), (vec!["dir", "b.txt"], 7), (vec!["c.txt"], 4)]);
        let storage = FileStorage::new(PathBuf::from("/dl"), &info).unwrap();
        let offsets: Vec<u64> = storage.entries().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 5, 12]);
        assert_eq!(storage.entries()[1].path, PathBuf::from("/dl/bundle/dir/b.txt"));
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        let info = multi_file("bundle", vec![(vec!["..", "etc"], 5)]);
        assert!(FileStorage::new(PathBuf::from("/dl"), &info).is_err());
        let info = multi_file("../up", vec![(vec!["a"], 5)]);
        assert!(FileStorage::new(PathBuf::from("/dl"), &info).is_err());
    }

    #[tokio::test]
    async fn test_write_spans_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi_file("bundle", vec![(vec!["a.txt"], 5), (vec!["empty"], 0), (vec!["b.txt"], 7)]);
        let storage = FileStorage::new(dir.path().to_path_buf(), &info).unwrap();
        storage.initialize().await.unwrap();

        storage.write_at(0, Bytes::from_static(b"01234567")).await.unwrap();
        storage.write_at(8, Bytes::from_static(b"89ab")).await.unwrap();

        let a = std::fs::read(dir.path().join("bundle/a.txt")).unwrap();
        let b = std::fs::read(dir.path().join("bundle/b.txt")).unwrap();
        assert_eq!(a, b"01234");
        assert_eq!(b, b"56789ab");
        assert_eq!(std::fs::metadata(dir.path().join("bundle/empty")).unwrap().len(), 0);

        assert_eq!(storage.read_at(3, 5).await.unwrap(), b"34567");
        assert!(storage.write_at(10, Bytes::from_static(b"xyz")).await.is_err());
    }

    #[tokio::test]
    async fn test_single_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let info = TorrentInfo {
            announce: "udp://t:1".to_string(),
            announce_list: vec![],
            info_hash: [0u8; 20],
            piece_length: 4,
            pieces: vec![[0u8; 20]; 2],
            name: "movie.bin".to_string(),
            length: Some(6),
            files: None,
        };
        let storage = FileStorage::new(dir.path().to_path_buf(), &info).unwrap();
        storage.initialize().await.unwrap();
        storage.write_at(4, Bytes::from_static(b"ef")).await.unwrap();

        let content = std::fs::read(dir.path().join("movie.bin")).unwrap();
        assert_eq!(content, b"\0\0\0\0ef");
    }
}
