//! Disk-backed chunk store for large time-shift windows.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::window::{Chunk, ChunkFactory, ChunkWindow};
use super::{CacheBuffer, CacheBufferError, CacheStats};

/// Time-shift store whose chunks are files in a cache directory.
///
/// Each chunk file is written through one handle and read through a second,
/// independently positioned handle. Chunk files are deleted when evicted and
/// when the store is dropped.
pub struct FileCacheBuffer {
    dir: PathBuf,
    window: Mutex<ChunkWindow<ChunkFiles>>,
}

impl FileCacheBuffer {
    /// Creates the cache directory and the first chunk file.
    ///
    /// # Errors
    ///
    /// - `CacheBufferError::CreateDirectory` - If `dir` cannot be created
    /// - `CacheBufferError::CreateChunk` - If the first chunk file cannot be created
    /// - `CacheBufferError::InvalidGeometry` - If `max_size` is below one chunk
    pub fn new(dir: &Path, chunk_size: u64, max_size: u64) -> Result<Self, CacheBufferError> {
        fs::create_dir_all(dir).map_err(|source| CacheBufferError::CreateDirectory {
            path: dir.to_path_buf(),
            source,
        })?;

        let factory = ChunkFiles {
            dir: dir.to_path_buf(),
            capacity: chunk_size as usize,
        };
        let mut window = ChunkWindow::new(factory, chunk_size as usize, max_size)?;
        window.prime().map_err(|source| CacheBufferError::CreateChunk {
            path: dir.to_path_buf(),
            source,
        })?;

        debug!(
            "File cache created in {} ({} byte chunks, {} byte window)",
            dir.display(),
            chunk_size,
            window.max_size()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            window: Mutex::new(window),
        })
    }

    /// Directory holding the chunk files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CacheBuffer for FileCacheBuffer {
    fn init(&self) -> Result<(), CacheBufferError> {
        let mut window = self.window.lock();
        window.reset();
        window.prime().map_err(|source| CacheBufferError::CreateChunk {
            path: self.dir.clone(),
            source,
        })
    }

    fn unit_size(&self) -> usize {
        self.window.lock().unit_size()
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64, CacheBufferError> {
        self.window.lock().seek(pos)
    }

    fn length(&self) -> Option<u64> {
        Some(self.window.lock().length())
    }

    fn position(&self) -> Option<u64> {
        Some(self.window.lock().position())
    }

    fn begin(&self) -> Option<u64> {
        Some(self.window.lock().begin())
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        self.window.lock().read(buf)
    }

    fn write(&self, data: &[u8]) -> usize {
        self.window.lock().write(data)
    }

    fn stats(&self) -> CacheStats {
        self.window.lock().stats()
    }
}

struct ChunkFiles {
    dir: PathBuf,
    capacity: usize,
}

impl ChunkFactory for ChunkFiles {
    type Chunk = ChunkFile;

    fn create(&mut self) -> io::Result<ChunkFile> {
        ChunkFile::create(&self.dir, self.capacity)
    }
}

struct ChunkFile {
    path: PathBuf,
    writer: File,
    reader: File,
    reader_offset: u64,
    capacity: usize,
    filled: usize,
}

impl ChunkFile {
    fn create(dir: &Path, capacity: usize) -> io::Result<Self> {
        let path = dir.join(format!("{}.chunk", Uuid::new_v4()));
        let writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let reader = OpenOptions::new().read(true).open(&path)?;

        Ok(Self {
            path,
            writer,
            reader,
            reader_offset: 0,
            capacity,
            filled: 0,
        })
    }

    /// Replaces the read handle with a fresh one at `offset`.
    fn reopen_reader(&mut self, offset: u64) -> io::Result<()> {
        let mut reader = OpenOptions::new().read(true).open(&self.path)?;
        reader.seek(SeekFrom::Start(offset))?;
        self.reader = reader;
        self.reader_offset = offset;
        Ok(())
    }
}

impl Chunk for ChunkFile {
    fn filled(&self) -> usize {
        self.filled
    }

    fn append(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = data.len().min(self.capacity - self.filled);
        self.writer.write_all(&data[..n])?;
        self.filled += n;
        Ok(n)
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.filled.saturating_sub(offset));
        if self.reader_offset != offset as u64 {
            if let Err(e) = self.reader.seek(SeekFrom::Start(offset as u64)) {
                debug!("Reopening chunk reader for {}: {}", self.path.display(), e);
                self.reopen_reader(offset as u64)?;
            }
            self.reader_offset = offset as u64;
        }

        self.reader.read_exact(&mut buf[..n])?;
        self.reader_offset += n as u64;
        Ok(n)
    }
}

impl Drop for ChunkFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to delete cache chunk {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn chunk_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "chunk"))
            .count()
    }

    #[test]
    fn test_creates_directory_and_first_chunk() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("nested").join("cache");

        let cache = FileCacheBuffer::new(&dir, 1024, 4096).unwrap();

        assert!(dir.is_dir());
        assert_eq!(chunk_files(&dir), 1);
        assert_eq!(cache.unit_size(), 1024);
        assert_eq!(cache.length(), Some(0));
    }

    #[test]
    fn test_round_trip_across_chunk_files() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCacheBuffer::new(temp.path(), 1000, 10_000).unwrap();
        let data: Vec<u8> = (0..3500u32).map(|i| (i % 253) as u8).collect();

        assert_eq!(cache.write(&data), data.len());
        assert_eq!(chunk_files(temp.path()), 4);

        let mut out = vec![0u8; data.len()];
        assert_eq!(cache.read(&mut out), data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn test_reader_is_independent_of_writer() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCacheBuffer::new(temp.path(), 1000, 10_000).unwrap();

        cache.write(b"hello ");
        let mut buf = [0u8; 6];
        assert_eq!(cache.read(&mut buf), 6);
        assert_eq!(&buf, b"hello ");

        cache.write(b"world");
        cache.seek(SeekFrom::Start(2)).unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(cache.read(&mut buf), 9);
        assert_eq!(&buf, b"llo world");
    }

    #[test]
    fn test_eviction_deletes_chunk_files() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCacheBuffer::new(temp.path(), 100, 300).unwrap();

        cache.write(&[5u8; 1000]);

        assert_eq!(chunk_files(temp.path()), 3);
        assert_eq!(cache.begin(), Some(700));
        assert_eq!(cache.position(), Some(700));
    }

    #[test]
    fn test_drop_removes_all_chunk_files() {
        let temp = tempfile::tempdir().unwrap();
        {
            let cache = FileCacheBuffer::new(temp.path(), 100, 1000).unwrap();
            cache.write(&[1u8; 450]);
            assert_eq!(chunk_files(temp.path()), 5);
        }
        assert_eq!(chunk_files(temp.path()), 0);
    }

    #[test]
    fn test_init_starts_fresh_chunk() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCacheBuffer::new(temp.path(), 100, 1000).unwrap();
        cache.write(&[1u8; 450]);

        cache.init().unwrap();

        assert_eq!(chunk_files(temp.path()), 1);
        assert_eq!(cache.length(), Some(0));
    }

    #[test]
    fn test_unwritable_directory_fails_construction() {
        let temp = tempfile::tempdir().unwrap();
        let locked = temp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        let mut perms = fs::metadata(&locked).unwrap().permissions();
        perms.set_mode(0o555);
        fs::set_permissions(&locked, perms).unwrap();

        // Privileged users bypass directory permissions
        let writable_check = locked.join("writable_check");
        if fs::create_dir(&writable_check).is_ok() {
            return;
        }

        let result = FileCacheBuffer::new(&locked.join("cache"), 100, 1000);
        assert!(matches!(
            result,
            Err(CacheBufferError::CreateDirectory { .. })
        ));
    }

    #[test]
    fn test_path_under_regular_file_fails_construction() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("plain");
        fs::write(&file, b"x").unwrap();

        let result = FileCacheBuffer::new(&file.join("cache"), 100, 1000);
        assert!(matches!(
            result,
            Err(CacheBufferError::CreateDirectory { .. })
        ));
    }
}
