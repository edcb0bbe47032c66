//! The tiered file cache.
//!
//! Small files live as shared in-memory vectors (with their gzip
//! representation cached alongside). Larger files hand out pooled
//! readers: sequential with an OS page-cache prefetch in the middle
//! tier, memory-mapped with a sliding window for big files when the
//! connection buffers are wide enough to make mapping pay.

use std::collections::HashMap;
use std::io::{self, Read as _, Seek as _, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use memmap2::Mmap;
use parking_lot::Mutex;

use torii_core::IoBuffer;
use torii_http_core::BodySource;

use crate::compress;

/// Files at or below this size are cached whole in memory.
pub const CACHE_FILE_SIZE: u64 = 16 * 1024;

/// Above the in-memory tier, up to here files are read sequentially
/// with a prefetch into the OS page cache.
pub const NO_CACHE_SIZE: u64 = 10 * CACHE_FILE_SIZE;

/// Mapping only pays off when the send buffers are wider than this.
pub const MMAP_MIN_BUFFER_WIDTH: usize = 64 * 1024;

/// Sliding-window extent for the memory-mapped tier.
const MMAP_WINDOW: u64 = 10 * 1024 * 1024;

/// A tier-selected reader over one file's bytes.
pub enum FileReader {
    /// Shared snapshot of a small (possibly compressed) file.
    InMemory {
        cache: Arc<Vec<u8>>,
        position: u64,
    },
    /// Large file behind a remappable window.
    Mmap(MmapReader),
    /// Plain positioned reads.
    Sequential {
        file: std::fs::File,
        size: u64,
        position: u64,
    },
}

pub struct MmapReader {
    file: std::fs::File,
    map: Mmap,
    window_start: u64,
    size: u64,
    position: u64,
}

impl FileReader {
    pub(crate) fn in_memory(cache: Arc<Vec<u8>>) -> Self {
        Self::InMemory { cache, position: 0 }
    }

    pub(crate) fn sequential(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self::Sequential {
            file,
            size,
            position: 0,
        })
    }

    pub(crate) fn mmap(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self::Mmap(MmapReader {
            map: map_window(&file, 0, size)?,
            file,
            window_start: 0,
            size,
            position: 0,
        }))
    }

    /// Total size of the representation behind this reader.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::InMemory { cache, .. } => cache.len() as u64,
            Self::Mmap(reader) => reader.size,
            Self::Sequential { size, .. } => *size,
        }
    }

    /// Repositions the next read.
    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        match self {
            Self::InMemory { position, .. } => {
                *position = offset;
                Ok(())
            }
            Self::Mmap(reader) => reader.seek(offset),
            Self::Sequential {
                file, position, ..
            } => {
                file.seek(SeekFrom::Start(offset))?;
                *position = offset;
                Ok(())
            }
        }
    }

    /// Appends up to `max` bytes into `buf`; returns the count and
    /// whether the end of the representation was reached.
    pub fn read(&mut self, buf: &mut IoBuffer, max: usize) -> io::Result<(usize, bool)> {
        match self {
            Self::InMemory { cache, position } => {
                let remaining = cache.len() as u64 - (*position).min(cache.len() as u64);
                let n = (remaining as usize).min(max);
                let start = *position as usize;
                buf.append(&cache[start..start + n]).map_err(io::Error::from)?;
                *position += n as u64;
                Ok((n, *position >= cache.len() as u64))
            }
            Self::Mmap(reader) => reader.read(buf, max),
            Self::Sequential {
                file,
                size,
                position,
            } => {
                buf.make_writeable_space(max).map_err(io::Error::from)?;
                let dst = &mut buf.write_slice()[..max];
                let mut n = 0;
                while n < max {
                    let read = file.read(&mut dst[n..])?;
                    if read == 0 {
                        break;
                    }
                    n += read;
                }
                buf.advance_write(n);
                *position += n as u64;
                Ok((n, *position >= *size))
            }
        }
    }
}

impl MmapReader {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.position = offset;
        if offset < self.window_start || offset >= self.window_end() {
            self.remap(offset)?;
        }
        Ok(())
    }

    fn window_end(&self) -> u64 {
        self.window_start + self.map.len() as u64
    }

    /// Slides the window to cover `offset`. Window starts are
    /// page-aligned as the mapping call requires.
    fn remap(&mut self, offset: u64) -> io::Result<()> {
        const PAGE: u64 = 4096;
        let start = (offset / PAGE) * PAGE;
        self.map = map_window(&self.file, start, self.size)?;
        self.window_start = start;
        Ok(())
    }

    fn read(&mut self, buf: &mut IoBuffer, max: usize) -> io::Result<(usize, bool)> {
        if self.position >= self.size {
            return Ok((0, true));
        }
        if self.position >= self.window_end() || self.position < self.window_start {
            self.remap(self.position)?;
        }

        let in_window = (self.window_end() - self.position) as usize;
        let remaining = (self.size - self.position) as usize;
        let n = max.min(in_window).min(remaining);
        let start = (self.position - self.window_start) as usize;
        buf.append(&self.map[start..start + n]).map_err(io::Error::from)?;
        self.position += n as u64;
        Ok((n, self.position >= self.size))
    }
}

fn map_window(file: &std::fs::File, start: u64, size: u64) -> io::Result<Mmap> {
    let len = (size - start.min(size)).min(MMAP_WINDOW) as usize;
    // SAFETY: the mapping is read-only and the backing file is served
    // for the process lifetime; concurrent truncation is outside the
    // server's contract (static content roots).
    unsafe { memmap2::MmapOptions::new().offset(start).len(len.max(1)).map(file) }
}

/// Advises the OS to pull a file into the page cache ahead of
/// sequential reads.
fn prefetch(path: &Path) {
    #[cfg(unix)]
    {
        let Ok(file) = std::fs::File::open(path) else {
            return;
        };
        // SAFETY: read-only mapping dropped at the end of this scope.
        if let Ok(map) = unsafe { Mmap::map(&file) } {
            let _ = map.advise(memmap2::Advice::WillNeed);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

type ReaderPool = Arc<Mutex<Vec<FileReader>>>;

struct Cookie {
    /// Size of the representation served for this key (the compressed
    /// size for compressed keys).
    size: u64,
    /// Path actually opened: the original, or the gzip temp file.
    serve_path: PathBuf,
    /// Compressed representations always read sequentially.
    compressed: bool,
    pool: ReaderPool,
}

/// A pooled reader: dropping it parks the reader on its cookie's
/// freelist, or closes it if the cookie is gone.
pub struct PooledReader {
    reader: Option<FileReader>,
    pool: Weak<Mutex<Vec<FileReader>>>,
}

impl PooledReader {
    fn unpooled(reader: FileReader) -> Self {
        Self {
            reader: Some(reader),
            pool: Weak::new(),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.reader.as_ref().map_or(0, FileReader::size)
    }

    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        match self.reader.as_mut() {
            Some(reader) => reader.seek(offset),
            None => Ok(()),
        }
    }

    pub fn read(&mut self, buf: &mut IoBuffer, max: usize) -> io::Result<(usize, bool)> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf, max),
            None => Ok((0, true)),
        }
    }
}

impl Drop for PooledReader {
    fn drop(&mut self) {
        if let (Some(reader), Some(pool)) = (self.reader.take(), self.pool.upgrade()) {
            pool.lock().push(reader);
        }
    }
}

/// Shared across workers; all maps sit behind short critical sections
/// with file I/O performed outside them.
pub struct FileCache {
    cookies: Mutex<HashMap<(PathBuf, bool), Arc<Cookie>>>,
    memory: Mutex<HashMap<(PathBuf, bool), Arc<Vec<u8>>>>,
    /// Per-key guards so one producer fills a memory entry or writes a
    /// gzip temp file while racers wait on it.
    inflight: Mutex<HashMap<(PathBuf, bool), Arc<Mutex<()>>>>,
    buffer_width: usize,
    temp_dir: PathBuf,
}

impl FileCache {
    #[must_use]
    pub fn new(buffer_width: usize, temp_dir: PathBuf) -> Self {
        Self {
            cookies: Mutex::new(HashMap::new()),
            memory: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            buffer_width,
            temp_dir,
        }
    }

    /// Fetches a reader for `path`, optionally for its gzip
    /// representation. Tier selection is by (representation) size and
    /// the configured buffer width.
    pub fn get(&self, path: &Path, compress: bool) -> io::Result<PooledReader> {
        let key = (path.to_path_buf(), compress);

        if let Some(cookie) = self.cookies.lock().get(&key).cloned() {
            return self.reader_from_cookie(&cookie);
        }

        let raw_size = std::fs::metadata(path)?.len();
        if raw_size <= CACHE_FILE_SIZE {
            let cache = self.memory_entry(&key, path, compress)?;
            return Ok(PooledReader::unpooled(FileReader::in_memory(cache)));
        }

        // Producing the cookie may compress to a temp file; serialize
        // producers per key and re-check afterwards.
        let guard = self.inflight_guard(&key);
        let _held = guard.lock();
        if let Some(cookie) = self.cookies.lock().get(&key).cloned() {
            return self.reader_from_cookie(&cookie);
        }

        let serve_path = if compress {
            compress::gzip_to_temp_file(path, &self.temp_dir)?
        } else {
            path.to_path_buf()
        };
        let size = std::fs::metadata(&serve_path)?.len();
        let cookie = Arc::new(Cookie {
            size,
            serve_path,
            compressed: compress,
            pool: Arc::new(Mutex::new(Vec::new())),
        });
        self.cookies.lock().insert(key, cookie.clone());
        self.reader_from_cookie(&cookie)
    }

    /// Size of the representation `get` would serve, without
    /// constructing a reader.
    pub fn representation_size(&self, path: &Path, compress: bool) -> io::Result<u64> {
        let key = (path.to_path_buf(), compress);
        if let Some(cookie) = self.cookies.lock().get(&key) {
            return Ok(cookie.size);
        }
        if let Some(cache) = self.memory.lock().get(&key) {
            return Ok(cache.len() as u64);
        }
        std::fs::metadata(path).map(|m| m.len())
    }

    fn reader_from_cookie(&self, cookie: &Arc<Cookie>) -> io::Result<PooledReader> {
        if let Some(mut reader) = cookie.pool.lock().pop() {
            reader.seek(0)?;
            return Ok(PooledReader {
                reader: Some(reader),
                pool: Arc::downgrade(&cookie.pool),
            });
        }

        let reader = if cookie.compressed {
            prefetch(&cookie.serve_path);
            FileReader::sequential(&cookie.serve_path)?
        } else if cookie.size <= NO_CACHE_SIZE {
            prefetch(&cookie.serve_path);
            FileReader::sequential(&cookie.serve_path)?
        } else if self.buffer_width > MMAP_MIN_BUFFER_WIDTH {
            FileReader::mmap(&cookie.serve_path)?
        } else {
            FileReader::sequential(&cookie.serve_path)?
        };

        Ok(PooledReader {
            reader: Some(reader),
            pool: Arc::downgrade(&cookie.pool),
        })
    }

    fn memory_entry(
        &self,
        key: &(PathBuf, bool),
        path: &Path,
        compress: bool,
    ) -> io::Result<Arc<Vec<u8>>> {
        if let Some(cache) = self.memory.lock().get(key).cloned() {
            return Ok(cache);
        }

        let guard = self.inflight_guard(key);
        let _held = guard.lock();
        if let Some(cache) = self.memory.lock().get(key).cloned() {
            return Ok(cache);
        }

        let raw = std::fs::read(path)?;
        let bytes = if compress {
            compress::gzip_vec(&raw)?
        } else {
            raw
        };
        let cache = Arc::new(bytes);
        self.memory.lock().insert(key.clone(), cache.clone());
        tracing::debug!(path = %path.display(), compress, len = cache.len(), "cached in memory");
        Ok(cache)
    }

    fn inflight_guard(&self, key: &(PathBuf, bool)) -> Arc<Mutex<()>> {
        self.inflight
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("cookies", &self.cookies.lock().len())
            .field("memory_entries", &self.memory.lock().len())
            .field("buffer_width", &self.buffer_width)
            .finish()
    }
}

impl BodySource for PooledReader {
    fn len(&self) -> u64 {
        self.size()
    }

    fn read_chunk(&mut self, buf: &mut IoBuffer, max: usize) -> io::Result<(usize, bool)> {
        self.read(buf, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torii_core::BlockFactory;

    fn io_buffer() -> IoBuffer {
        let factory = BlockFactory::new(512 * 1024, 1).unwrap();
        IoBuffer::new(&factory, 16).unwrap()
    }

    fn drain(reader: &mut PooledReader) -> Vec<u8> {
        let mut buf = io_buffer();
        let mut out = Vec::new();
        loop {
            let (_, eof) = reader.read(&mut buf, 8192).unwrap();
            out.extend_from_slice(buf.peek());
            buf.reset();
            if eof {
                return out;
            }
        }
    }

    #[test]
    fn small_files_come_from_the_memory_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, b"tiny body").unwrap();

        let cache = FileCache::new(128 * 1024, dir.path().to_path_buf());
        let mut reader = cache.get(&path, false).unwrap();
        assert_eq!(reader.size(), 9);
        assert_eq!(drain(&mut reader), b"tiny body");

        // Rewriting the file on disk does not change the snapshot.
        std::fs::write(&path, b"changed!!").unwrap();
        let mut again = cache.get(&path, false).unwrap();
        assert_eq!(drain(&mut again), b"tiny body");
    }

    #[test]
    fn compressed_small_files_cache_the_gzip_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, b"<html>torii torii torii</html>".repeat(16)).unwrap();

        let cache = FileCache::new(128 * 1024, dir.path().to_path_buf());
        let reader = cache.get(&path, true).unwrap();
        let plain = cache.get(&path, false).unwrap();
        assert!(reader.size() < plain.size());
        assert_eq!(
            cache.representation_size(&path, true).unwrap(),
            reader.size()
        );
    }

    #[test]
    fn mid_tier_files_use_pooled_sequential_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mid.bin");
        let content: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let cache = FileCache::new(128 * 1024, dir.path().to_path_buf());
        let mut reader = cache.get(&path, false).unwrap();
        assert!(matches!(
            reader.reader.as_ref().unwrap(),
            FileReader::Sequential { .. }
        ));
        assert_eq!(drain(&mut reader), content);
        drop(reader);

        // The pooled reader is reused, rewound to the start.
        let mut second = cache.get(&path, false).unwrap();
        assert_eq!(drain(&mut second), content);
    }

    #[test]
    fn large_files_map_when_buffers_are_wide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i / 7) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let wide = FileCache::new(128 * 1024, dir.path().to_path_buf());
        let mut reader = wide.get(&path, false).unwrap();
        assert!(matches!(
            reader.reader.as_ref().unwrap(),
            FileReader::Mmap(_)
        ));
        assert_eq!(drain(&mut reader), content);

        // Narrow buffers fall back to sequential reads.
        let narrow = FileCache::new(16 * 1024, dir.path().to_path_buf());
        let narrow_reader = narrow.get(&path, false).unwrap();
        assert!(matches!(
            narrow_reader.reader.as_ref().unwrap(),
            FileReader::Sequential { .. }
        ));
    }

    #[test]
    fn seek_supports_ranged_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranged.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let cache = FileCache::new(128 * 1024, dir.path().to_path_buf());
        let mut reader = cache.get(&path, false).unwrap();
        reader.seek(100).unwrap();

        let mut buf = io_buffer();
        let (n, _) = reader.read(&mut buf, 100).unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf.peek(), &content[100..200]);
    }

    #[test]
    fn concurrent_compression_produces_one_representation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.css");
        std::fs::write(&path, b"body{margin:0}".repeat(20_000)).unwrap();

        let cache = Arc::new(FileCache::new(128 * 1024, dir.path().to_path_buf()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                cache.get(&path, true).unwrap().size()
            }));
        }
        let sizes: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(sizes.windows(2).all(|w| w[0] == w[1]));

        // Exactly one compressed temp file exists.
        let temps = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("compress"))
            .count();
        assert_eq!(temps, 1);
    }
}
