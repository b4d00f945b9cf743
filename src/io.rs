//! Byte-stream I/O managers and the shared handle registry
//!
//! Every container engine talks to storage through [`IOManager`] and
//! [`IOHandle`]. Handles are shared per stream name through
//! [`HandleRegistry`]; each [`SharedFile`] carries the mutex that serialises
//! the seek+read / seek+write pairs issued against it.

use crate::error::{RasterError, Result};
use crate::types::OpenMode;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process-local in-memory streams
    Memory,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "mem" => Ok(StorageBackend::Memory),
                _ => Err(RasterError::Configuration(format!(
                    "Unknown scheme: {}",
                    scheme
                ))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// One open byte stream
pub trait IOHandle: Send {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Read up to `buf.len()` bytes, returning the count actually read
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write up to `buf.len()` bytes, returning the count actually written
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Current stream length in bytes
    fn len(&mut self) -> Result<u64>;
}

/// Opens named byte streams
pub trait IOManager: Send + Sync {
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn IOHandle>>;

    fn exists(&self, name: &str) -> bool;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for a relative path
    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

struct FileHandle {
    file: Option<File>,
}

impl FileHandle {
    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| RasterError::Io(std::io::Error::other("handle already closed")))
    }
}

impl IOHandle for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file()?.seek(pos)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let file = self.file()?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.file()?.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.file()?.flush()?)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }
}

impl IOManager for FileSystemIOManager {
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn IOHandle>> {
        let full_path = self.full_path(name);
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Update => options.read(true).write(true),
            OpenMode::Create => options.read(true).write(true).create(true).truncate(true),
        };
        let file = options.open(&full_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RasterError::NotFound(full_path.display().to_string())
            } else {
                RasterError::Io(e)
            }
        })?;
        Ok(Box::new(FileHandle { file: Some(file) }))
    }

    fn exists(&self, name: &str) -> bool {
        self.full_path(name).exists()
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// Counters of physical operations issued against in-memory streams
#[derive(Debug, Default)]
pub struct IoStats {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl IoStats {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// In-memory I/O manager; streams live as long as the manager
#[derive(Default)]
pub struct MemoryIOManager {
    files: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
    stats: Arc<IoStats>,
}

impl MemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<IoStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of a stream's bytes
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|data| data.lock().clone())
    }
}

struct MemoryHandle {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
    writable: bool,
    stats: Arc<IoStats>,
}

impl IOHandle for MemoryHandle {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.data.lock().len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => len + delta as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
        };
        if target < 0 {
            return Err(RasterError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of stream",
            )));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(RasterError::ReadOnly("in-memory stream".to_string()));
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock();
        let start = self.pos as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}

impl IOManager for MemoryIOManager {
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn IOHandle>> {
        let mut files = self.files.lock();
        let data = match mode {
            OpenMode::Create => {
                let data = Arc::new(Mutex::new(Vec::new()));
                files.insert(name.to_string(), Arc::clone(&data));
                data
            }
            OpenMode::Read | OpenMode::Update => files
                .get(name)
                .cloned()
                .ok_or_else(|| RasterError::NotFound(name.to_string()))?,
        };
        Ok(Box::new(MemoryHandle {
            data,
            pos: 0,
            writable: mode.is_writable(),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// An open stream shared by every logical channel that uses it
pub struct SharedFile {
    name: String,
    writable: bool,
    io_mutex: Mutex<Box<dyn IOHandle>>,
}

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFile")
            .field("name", &self.name)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl SharedFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Hold the I/O mutex across several physical operations
    pub fn lock(&self) -> IoGuard<'_> {
        IoGuard {
            name: &self.name,
            handle: self.io_mutex.lock(),
        }
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.lock().read_at(buf, offset)
    }

    /// Write all of `buf` at `offset`
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.lock().write_at(buf, offset)
    }

    pub fn len(&self) -> Result<u64> {
        self.lock().len()
    }

    pub fn flush(&self) -> Result<()> {
        self.io_mutex.lock().flush()
    }
}

/// Exclusive access to a [`SharedFile`] handle
pub struct IoGuard<'a> {
    name: &'a str,
    handle: MutexGuard<'a, Box<dyn IOHandle>>,
}

impl IoGuard<'_> {
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.handle.seek(SeekFrom::Start(offset))?;
        let actual = self.handle.read(buf)?;
        if actual != buf.len() {
            tracing::debug!(file = self.name, offset, "short read");
            return Err(RasterError::ShortTransfer {
                op: "read",
                offset,
                expected: buf.len(),
                actual,
            });
        }
        Ok(())
    }

    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.handle.seek(SeekFrom::Start(offset))?;
        let actual = self.handle.write(buf)?;
        if actual != buf.len() {
            return Err(RasterError::ShortTransfer {
                op: "write",
                offset,
                expected: buf.len(),
                actual,
            });
        }
        Ok(())
    }

    pub fn len(&mut self) -> Result<u64> {
        self.handle.len()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.handle.flush()
    }
}

/// Lookup-or-open table of shared handles keyed by stream name
pub struct HandleRegistry {
    manager: Arc<dyn IOManager>,
    handles: Mutex<HashMap<String, Weak<SharedFile>>>,
}

impl HandleRegistry {
    pub fn new(manager: Arc<dyn IOManager>) -> Self {
        Self {
            manager,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Registry over the local file system, paths taken as given
    pub fn local() -> Self {
        Self::new(Arc::new(FileSystemIOManager::new("")))
    }

    pub fn manager(&self) -> &Arc<dyn IOManager> {
        &self.manager
    }

    pub fn exists(&self, name: &str) -> bool {
        self.manager.exists(name)
    }

    /// Return the live handle for `name`, opening it if needed.
    ///
    /// `Create` always opens a fresh, truncated stream. A read-only handle is
    /// replaced when write access is requested.
    pub fn open(&self, name: &str, mode: OpenMode) -> Result<Arc<SharedFile>> {
        let mut handles = self.handles.lock();
        handles.retain(|_, weak| weak.strong_count() > 0);

        if mode != OpenMode::Create {
            if let Some(existing) = handles.get(name).and_then(Weak::upgrade) {
                if existing.writable || !mode.is_writable() {
                    return Ok(existing);
                }
            }
        }

        let handle = self.manager.open(name, mode)?;
        let shared = Arc::new(SharedFile {
            name: name.to_string(),
            writable: mode.is_writable(),
            io_mutex: Mutex::new(handle),
        });
        handles.insert(name.to_string(), Arc::downgrade(&shared));
        tracing::debug!(file = name, ?mode, "opened shared handle");
        Ok(shared)
    }

    /// Number of live shared handles
    pub fn open_count(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_system_io() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        let mut handle = io.open("test.dat", OpenMode::Create).unwrap();
        handle.write(b"Hello, raster!").unwrap();
        handle.flush().unwrap();
        assert_eq!(handle.len().unwrap(), 14);
        handle.close().unwrap();

        assert!(io.exists("test.dat"));
        assert!(!io.exists("nonexistent.dat"));

        let mut handle = io.open("test.dat", OpenMode::Read).unwrap();
        handle.seek(SeekFrom::Start(7)).unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(handle.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf, b"raster!");

        assert!(matches!(
            io.open("missing.dat", OpenMode::Read),
            Err(RasterError::NotFound(_))
        ));
    }

    #[test]
    fn test_memory_io_and_stats() {
        let io = MemoryIOManager::new();
        let stats = io.stats();
        let mut handle = io.open("a", OpenMode::Create).unwrap();
        handle.seek(SeekFrom::Start(4)).unwrap();
        handle.write(&[1, 2]).unwrap();
        assert_eq!(io.contents("a").unwrap(), vec![0, 0, 0, 0, 1, 2]);
        assert_eq!(stats.writes(), 1);

        let mut reader = io.open("a", OpenMode::Read).unwrap();
        assert!(matches!(reader.write(&[1]), Err(RasterError::ReadOnly(_))));
        let mut buf = [0u8; 10];
        assert_eq!(reader.read(&mut buf).unwrap(), 6);
        assert_eq!(stats.reads(), 1);
    }

    #[test]
    fn test_short_read_reports_offset() {
        let registry = HandleRegistry::new(Arc::new(MemoryIOManager::new()));
        let file = registry.open("short", OpenMode::Create).unwrap();
        file.write_at(&[7u8; 10], 0).unwrap();

        let mut buf = [0u8; 8];
        match file.read_at(&mut buf, 6) {
            Err(RasterError::ShortTransfer {
                offset,
                expected,
                actual,
                ..
            }) => {
                assert_eq!((offset, expected, actual), (6, 8, 4));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_registry_shares_handles() {
        let registry = HandleRegistry::new(Arc::new(MemoryIOManager::new()));
        let a = registry.open("shared.pix", OpenMode::Create).unwrap();
        let b = registry.open("shared.pix", OpenMode::Update).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.open_count(), 1);

        drop(a);
        drop(b);
        assert_eq!(registry.open_count(), 0);

        // Read-only handle is upgraded when write access is requested
        let ro = registry.open("shared.pix", OpenMode::Read).unwrap();
        let rw = registry.open("shared.pix", OpenMode::Update).unwrap();
        assert!(!Arc::ptr_eq(&ro, &rw));
        assert!(rw.is_writable());
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            StorageBackend::from_url("file:///data/image.pix").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("mem://scratch").unwrap(),
            StorageBackend::Memory
        );
        assert_eq!(
            StorageBackend::from_url("/plain/path.tif").unwrap(),
            StorageBackend::FileSystem
        );
        assert!(StorageBackend::from_url("s3://bucket/x").is_err());
    }
}
