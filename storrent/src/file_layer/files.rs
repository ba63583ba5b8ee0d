use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use super::block_cache::BlockCache;
use crate::torrent_parser::torrent::Torrent;

trait WriteWithOffset {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), io::Error>;
}

impl WriteWithOffset for File {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), io::Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }
}

trait ReadWithOffset {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), io::Error>;
}

impl ReadWithOffset for File {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), io::Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// Posible `FileLayer` errors.
#[derive(Debug)]
pub enum FileLayerError {
    /// A composed path escaped the base directory. Fatal for the download.
    PathTraversal(String),
    CreatingDirectoryError(io::Error),
    OpeningFileError(io::Error),
    WriteOutOfBounds { offset: u64, length: usize },
    ReadOutOfBounds { offset: u64, length: usize },
    ReadError(io::Error),
    PoisonedLock,
}

/// One on-disk file and the slice of the global payload it covers.
#[derive(Debug)]
struct FileSlot {
    path: PathBuf,
    /// Global byte offset where this file starts.
    start: u64,
    length: u64,
    file: Mutex<File>,
}

/// Maps global byte offsets onto the torrent's files and keeps the bounded
/// block cache used to serve uploads while downloading.
///
/// Multi-file torrents lay files out concatenatively in descriptor order
/// under `<download_dir>/<torrent_name>/`; single-file torrents write one
/// file at `<download_dir>/<torrent_name>`.
#[derive(Debug)]
pub struct FileLayer {
    slots: Vec<FileSlot>,
    piece_length: u64,
    total_length: u64,
    cache: Mutex<BlockCache>,
}

impl FileLayer {
    /// Opens (creating as needed) every file of the torrent. Any path that
    /// would land outside the download directory aborts the whole download
    /// before a single file is touched.
    pub fn new(torrent: &Torrent, download_dir: &str) -> Result<Self, FileLayerError> {
        let base = PathBuf::from(download_dir);
        fs::create_dir_all(&base).map_err(FileLayerError::CreatingDirectoryError)?;

        let mut layout: Vec<(PathBuf, u64)> = Vec::new();
        if torrent.info.files.is_empty() {
            let target = safe_join(&base, &[torrent.info.name.clone()])?;
            layout.push((target, torrent.total_length()));
        } else {
            let torrent_dir = safe_join(&base, &[torrent.info.name.clone()])?;
            // validate every path before creating anything on disk
            for entry in &torrent.info.files {
                let target = safe_join(&torrent_dir, &entry.path)?;
                layout.push((target, entry.length as u64));
            }
        }

        let mut slots = Vec::with_capacity(layout.len());
        let mut start = 0u64;
        for (path, length) in layout {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(FileLayerError::CreatingDirectoryError)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(FileLayerError::OpeningFileError)?;
            slots.push(FileSlot {
                path,
                start,
                length,
                file: Mutex::new(file),
            });
            start += length;
        }

        Ok(Self {
            slots,
            piece_length: torrent.piece_length() as u64,
            total_length: torrent.total_length(),
            cache: Mutex::new(BlockCache::default()),
        })
    }

    /// Writes a block at its global position, splitting it across every file
    /// it overlaps, then caches it. Per-file write failures are logged and
    /// skipped; the data flows again on re-request.
    pub fn write_block(&self, piece: u32, begin: u32, bytes: &[u8]) -> Result<(), FileLayerError> {
        let global = piece as u64 * self.piece_length + begin as u64;
        if global + bytes.len() as u64 > self.total_length {
            return Err(FileLayerError::WriteOutOfBounds {
                offset: global,
                length: bytes.len(),
            });
        }

        for slot in self.overlapping(global, bytes.len() as u64) {
            let from = global.max(slot.start);
            let to = (global + bytes.len() as u64).min(slot.start + slot.length);
            let chunk = &bytes[(from - global) as usize..(to - global) as usize];

            match slot.file.lock() {
                Ok(mut file) => {
                    if let Err(err) = file.write_all_at(chunk, from - slot.start) {
                        warn!("write to {:?} at {} failed: {}", slot.path, from, err);
                    }
                }
                Err(_) => warn!("file lock poisoned for {:?}", slot.path),
            }
        }

        self.lock_cache()?
            .insert((piece, begin, bytes.len() as u32), bytes.to_vec());
        Ok(())
    }

    /// Reads a block for upload, preferring the cache and populating it on a
    /// miss.
    pub fn read_block(
        &self,
        piece: u32,
        begin: u32,
        length: u32,
    ) -> Result<Vec<u8>, FileLayerError> {
        let key = (piece, begin, length);
        if let Some(bytes) = self.lock_cache()?.get(&key) {
            return Ok(bytes);
        }

        let global = piece as u64 * self.piece_length + begin as u64;
        if global + length as u64 > self.total_length {
            return Err(FileLayerError::ReadOutOfBounds {
                offset: global,
                length: length as usize,
            });
        }

        let mut buffer = vec![0u8; length as usize];
        for slot in self.overlapping(global, length as u64) {
            let from = global.max(slot.start);
            let to = (global + length as u64).min(slot.start + slot.length);
            let chunk = &mut buffer[(from - global) as usize..(to - global) as usize];

            let mut file = slot
                .file
                .lock()
                .map_err(|_| FileLayerError::PoisonedLock)?;
            file.read_exact_at(chunk, from - slot.start)
                .map_err(FileLayerError::ReadError)?;
        }

        self.lock_cache()?.insert(key, buffer.clone());
        Ok(buffer)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    fn overlapping(&self, global: u64, length: u64) -> impl Iterator<Item = &FileSlot> {
        let end = global + length;
        self.slots
            .iter()
            .filter(move |slot| slot.start < end && global < slot.start + slot.length)
    }

    fn lock_cache(&self) -> Result<MutexGuard<BlockCache>, FileLayerError> {
        self.cache.lock().map_err(|_| FileLayerError::PoisonedLock)
    }
}

/// Joins path components under `base`, rejecting anything that could escape
/// it: absolute components, `.`/`..`, or separators smuggled inside a
/// component.
fn safe_join(base: &Path, components: &[String]) -> Result<PathBuf, FileLayerError> {
    let mut path = base.to_path_buf();
    for component in components {
        let parsed = Path::new(component);
        let mut parts = parsed.components();
        let valid = matches!(parts.next(), Some(Component::Normal(_))) && parts.next().is_none();
        if component.is_empty() || !valid {
            return Err(FileLayerError::PathTraversal(components.join("/")));
        }
        path.push(component);
    }
    if !path.starts_with(base) {
        return Err(FileLayerError::PathTraversal(components.join("/")));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_parser::info::{Info, TorrentFile};
    use std::fs;

    #[test]
    fn test_single_file_write_and_read() {
        let dir = test_dir("single_write_read");
        let torrent = single_file_torrent("a.bin", 32, 16);
        let layer = FileLayer::new(&torrent, &dir).unwrap();

        layer.write_block(0, 0, &[1u8; 16]).unwrap();
        layer.write_block(1, 0, &[2u8; 16]).unwrap();

        let on_disk = fs::read(format!("{}/a.bin", dir)).unwrap();
        assert_eq!(&on_disk[..16], &[1u8; 16]);
        assert_eq!(&on_disk[16..], &[2u8; 16]);

        assert_eq!(layer.read_block(0, 0, 16).unwrap(), vec![1u8; 16]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_block_spanning_two_files() {
        let dir = test_dir("span_two_files");
        let torrent = multi_file_torrent(
            "multi",
            16,
            vec![(vec!["first.bin"], 10), (vec!["sub", "second.bin"], 22)],
        );
        let layer = FileLayer::new(&torrent, &dir).unwrap();

        let block: Vec<u8> = (0u8..16).collect();
        layer.write_block(0, 0, &block).unwrap();

        let first = fs::read(format!("{}/multi/first.bin", dir)).unwrap();
        let second = fs::read(format!("{}/multi/sub/second.bin", dir)).unwrap();
        assert_eq!(first, (0u8..10).collect::<Vec<u8>>());
        assert_eq!(&second[..6], &[10u8, 11, 12, 13, 14, 15][..]);

        assert_eq!(layer.read_block(0, 0, 16).unwrap(), block);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_read_is_served_from_cache() {
        let dir = test_dir("cache_served");
        let torrent = single_file_torrent("a.bin", 16, 16);
        let layer = FileLayer::new(&torrent, &dir).unwrap();

        layer.write_block(0, 0, &[9u8; 16]).unwrap();
        // remove the backing file: only the cache can answer now
        fs::remove_file(format!("{}/a.bin", dir)).unwrap();

        assert_eq!(layer.read_block(0, 0, 16).unwrap(), vec![9u8; 16]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_out_of_bounds_is_rejected() {
        let dir = test_dir("write_oob");
        let torrent = single_file_torrent("a.bin", 16, 16);
        let layer = FileLayer::new(&torrent, &dir).unwrap();

        let result = layer.write_block(1, 0, &[0u8; 16]);
        assert!(matches!(
            result,
            Err(FileLayerError::WriteOutOfBounds { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_path_traversal_is_fatal() {
        let dir = test_dir("traversal");
        let torrent = multi_file_torrent(
            "evil",
            16,
            vec![(vec!["..", "etc", "passwd"], 16)],
        );

        let result = FileLayer::new(&torrent, &dir);
        assert!(matches!(result, Err(FileLayerError::PathTraversal(_))));
        // nothing must have been created for the evil entry
        assert!(!Path::new(&format!("{}/etc", dir)).exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_component_with_separator_is_rejected() {
        let dir = test_dir("separator");
        let torrent = multi_file_torrent("evil", 16, vec![(vec!["a/../../b"], 16)]);

        let result = FileLayer::new(&torrent, &dir);
        assert!(matches!(result, Err(FileLayerError::PathTraversal(_))));
        fs::remove_dir_all(&dir).unwrap();
    }

    // Auxiliary functions

    fn test_dir(name: &str) -> String {
        let dir = format!("./test_file_layer_{}", name);
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn single_file_torrent(name: &str, length: i64, piece_length: i64) -> Torrent {
        build_torrent(name, length, piece_length, vec![])
    }

    fn multi_file_torrent(
        name: &str,
        piece_length: i64,
        files: Vec<(Vec<&str>, i64)>,
    ) -> Torrent {
        let files: Vec<TorrentFile> = files
            .into_iter()
            .map(|(path, length)| TorrentFile {
                path: path.into_iter().map(String::from).collect(),
                length,
            })
            .collect();
        let length = files.iter().map(|file| file.length).sum();
        build_torrent(name, length, piece_length, files)
    }

    fn build_torrent(
        name: &str,
        length: i64,
        piece_length: i64,
        files: Vec<TorrentFile>,
    ) -> Torrent {
        let pieces = ((length + piece_length - 1) / piece_length) as usize;
        Torrent {
            announce_url: "http://example.com/announce".to_string(),
            info: Info {
                length,
                name: name.to_string(),
                piece_length,
                pieces: vec![0u8; pieces * 20],
                files,
            },
            info_hash: "00".repeat(20),
        }
    }
}
