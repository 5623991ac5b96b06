//! Sparse file access for layer data.
//!
//! This module provides the [`SparseFile`] abstraction used by every layer of the
//! chain: positioned reads and writes, enumeration of the byte ranges that hold
//! data (as opposed to holes), and hole punching. [`DiskFile`] backs it with a
//! real file; [`MemFile`] keeps everything in memory for tests.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, trace};

/// A contiguous byte range holding data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset of the first data byte.
    pub offset: u64,
    /// Length of the range in bytes.
    pub len: u64,
}

impl Extent {
    /// Byte offset one past the end of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Positioned access to one sparse file.
///
/// Implementations must be safe to share between threads; positioned reads and
/// writes never depend on a shared file cursor.
pub trait SparseFile: Send + Sync + fmt::Debug {
    /// Reads into `buf` starting at `offset`. Returns bytes read; 0 at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Writes `buf` at `offset`. Returns bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Returns the first data extent starting at or after `from`, or the
    /// remainder of the extent containing `from`.
    fn next_data_extent(&self, from: u64) -> io::Result<Option<Extent>>;

    /// Deallocates `[offset, offset + len)`; the range reads back as zeros.
    fn punch_hole(&self, offset: u64, len: u64) -> io::Result<()>;

    /// Current file length in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Truncates or extends the file to `size` bytes. Extension is a hole.
    fn set_len(&self, size: u64) -> io::Result<()>;

    /// Flushes data to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Whether any byte in `[offset, offset + len)` holds data.
    fn has_data(&self, offset: u64, len: u64) -> io::Result<bool> {
        Ok(match self.next_data_extent(offset)? {
            Some(extent) => extent.offset < offset + len,
            None => false,
        })
    }

    /// All data extents in ascending order.
    fn data_extents(&self) -> io::Result<Vec<Extent>> {
        let mut extents = Vec::new();
        let mut cursor = 0;
        while let Some(extent) = self.next_data_extent(cursor)? {
            cursor = extent.end();
            extents.push(extent);
        }
        Ok(extents)
    }

    /// Total bytes held in data extents.
    fn allocated_bytes(&self) -> io::Result<u64> {
        Ok(self.data_extents()?.iter().map(|e| e.len).sum())
    }

    /// Fills `buf` from `offset`; bytes past end of file read as zeros.
    fn read_full_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                buf[done..].fill(0);
                break;
            }
            done += n;
        }
        Ok(())
    }

    /// Writes all of `buf` at `offset`.
    fn write_full_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write_at(&buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "positioned write made no progress",
                ));
            }
            done += n;
        }
        Ok(())
    }
}

/// A sparse file on the local filesystem.
pub struct DiskFile {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl fmt::Debug for DiskFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskFile")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .finish()
    }
}

impl DiskFile {
    /// Creates a new sparse file of `size` bytes. Fails if the file exists.
    pub fn create(path: &Path, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        debug!(path = %path.display(), size, "created sparse file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable: true,
        })
    }

    /// Opens an existing file, read-write or read-only.
    pub fn open(path: &Path, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file was opened for writing.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn seek(&self, from: u64, whence: libc::c_int) -> io::Result<Option<u64>> {
        let ret = unsafe { libc::lseek(self.file.as_raw_fd(), from as libc::off_t, whence) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(ret as u64))
    }
}

impl SparseFile for DiskFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(buf, offset)
    }

    fn next_data_extent(&self, from: u64) -> io::Result<Option<Extent>> {
        let start = match self.seek(from, libc::SEEK_DATA)? {
            Some(start) => start,
            None => return Ok(None),
        };
        let end = match self.seek(start, libc::SEEK_HOLE)? {
            Some(end) => end,
            None => self.len()?,
        };
        if end <= start {
            return Ok(None);
        }
        trace!(path = %self.path.display(), start, end, "data extent");
        Ok(Some(Extent {
            offset: start,
            len: end - start,
        }))
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(&self, offset: u64, len: u64) -> io::Result<()> {
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn punch_hole(&self, _offset: u64, _len: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "hole punching requires fallocate",
        ))
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn sync(&self) -> io::Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

struct MemInner {
    size: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
}

/// In-memory sparse file with a fixed allocation granularity.
///
/// Writing any byte of a chunk allocates the whole chunk, the same way a
/// filesystem allocates whole pages.
pub struct MemFile {
    chunk_size: u64,
    inner: RwLock<MemInner>,
}

impl fmt::Debug for MemFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MemFile")
            .field("size", &inner.size)
            .field("chunk_size", &self.chunk_size)
            .field("allocated_chunks", &inner.chunks.len())
            .finish()
    }
}

impl MemFile {
    /// Creates an empty file of `size` bytes allocating in `chunk_size` units.
    pub fn new(size: u64, chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            chunk_size,
            inner: RwLock::new(MemInner {
                size,
                chunks: BTreeMap::new(),
            }),
        }
    }
}

impl SparseFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let inner = self.inner.read();
        if offset >= inner.size {
            return Ok(0);
        }
        let n = buf.len().min((inner.size - offset) as usize);
        for (i, byte) in buf[..n].iter_mut().enumerate() {
            let pos = offset + i as u64;
            let chunk = pos / self.chunk_size;
            *byte = inner
                .chunks
                .get(&chunk)
                .map(|data| data[(pos % self.chunk_size) as usize])
                .unwrap_or(0);
        }
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut inner = self.inner.write();
        let chunk_size = self.chunk_size as usize;
        for (i, byte) in buf.iter().enumerate() {
            let pos = offset + i as u64;
            let chunk = pos / self.chunk_size;
            let data = inner
                .chunks
                .entry(chunk)
                .or_insert_with(|| vec![0; chunk_size]);
            data[(pos % self.chunk_size) as usize] = *byte;
        }
        let end = offset + buf.len() as u64;
        if end > inner.size {
            inner.size = end;
        }
        Ok(buf.len())
    }

    fn next_data_extent(&self, from: u64) -> io::Result<Option<Extent>> {
        let inner = self.inner.read();
        let first_chunk = from / self.chunk_size;
        let mut range = inner.chunks.range(first_chunk..).map(|(k, _)| *k);
        let start_chunk = match range.next() {
            Some(chunk) => chunk,
            None => return Ok(None),
        };
        let mut end_chunk = start_chunk + 1;
        for chunk in range {
            if chunk != end_chunk {
                break;
            }
            end_chunk += 1;
        }
        let start = (start_chunk * self.chunk_size).max(from);
        let end = (end_chunk * self.chunk_size).min(inner.size);
        if end <= start {
            return Ok(None);
        }
        Ok(Some(Extent {
            offset: start,
            len: end - start,
        }))
    }

    fn punch_hole(&self, offset: u64, len: u64) -> io::Result<()> {
        let mut inner = self.inner.write();
        let end = offset + len;
        let first = offset / self.chunk_size;
        let last = end.div_ceil(self.chunk_size);
        for chunk in first..last {
            let chunk_start = chunk * self.chunk_size;
            let chunk_end = chunk_start + self.chunk_size;
            if offset <= chunk_start && chunk_end <= end {
                inner.chunks.remove(&chunk);
            } else if let Some(data) = inner.chunks.get_mut(&chunk) {
                let lo = offset.max(chunk_start) - chunk_start;
                let hi = end.min(chunk_end) - chunk_start;
                data[lo as usize..hi as usize].fill(0);
            }
        }
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.inner.read().size)
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        let mut inner = self.inner.write();
        let chunk_size = self.chunk_size;
        inner.chunks.retain(|chunk, _| chunk * chunk_size < size);
        if let Some(data) = inner.chunks.get_mut(&(size / chunk_size)) {
            data[(size % chunk_size) as usize..].fill(0);
        }
        inner.size = size;
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}
