#![forbid(unsafe_code)]
//! Positioned file I/O and the page-granular device contract.

use std::{fs::File, path::Path, sync::Arc};

use crate::types::{PageId, Result, StoreError};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Synchronizes file data, allowing metadata flushes to be deferred.
    fn sync_data(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
/// Unix-specific positioned I/O using `pread`/`pwrite` semantics.
pub mod stdio_unix {
    use std::{
        fs::{File, OpenOptions},
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
        path::Path,
    };

    use crate::types::{Result, StoreError};

    use super::StdFileIo;

    /// Opens a file in read-write mode with creation support (Unix).
    pub fn open_rw(path: impl AsRef<Path>) -> Result<StdFileIo> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(StoreError::from)?;
        Ok(StdFileIo::new(file))
    }

    /// Reads an exact number of bytes at an offset.
    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    /// Writes all bytes at an offset.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
/// Windows-specific positioned I/O using `seek_read`/`seek_write`.
pub mod stdio_win {
    use std::{
        fs::{File, OpenOptions},
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
        path::Path,
    };

    use crate::types::{Result, StoreError};

    use super::StdFileIo;

    /// Opens a file in read-write mode with creation support (Windows).
    pub fn open_rw(path: impl AsRef<Path>) -> Result<StdFileIo> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(StoreError::from)?;
        Ok(StdFileIo::new(file))
    }

    /// Reads an exact number of bytes at an offset.
    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    /// Writes all bytes at an offset.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O implementation over a shared file handle.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Creates a new `StdFileIo` from an existing file handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        #[cfg(unix)]
        {
            return stdio_unix::open_rw(path);
        }
        #[cfg(windows)]
        {
            return stdio_win::open_rw(path);
        }
        #[allow(unreachable_code)]
        Err(StoreError::Invalid(
            "StdFileIo unsupported on this platform",
        ))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> std::io::Result<()> {
        stdio_unix::read_exact(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> std::io::Result<()> {
        stdio_win::read_exact(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> std::io::Result<()> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> std::io::Result<()> {
        stdio_win::write_all(self.file(), off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(StoreError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(StoreError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(StoreError::from)
    }

    fn sync_data(&self) -> Result<()> {
        self.file().sync_data().map_err(StoreError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(StoreError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(StoreError::from)
    }
}

/// Fixed-page random-access device contract the page store runs against.
///
/// Reads of pages past the current end of the device observe zeros; writes
/// extend the device as needed. `read_partial` is strict and fails on short
/// reads, which header recovery relies on to classify truncated slots.
pub trait PageDevice: Send + Sync + 'static {
    /// Returns the page size in bytes.
    fn page_size(&self) -> u32;
    /// Returns the number of pages the device currently holds.
    fn page_count(&self) -> Result<u64>;
    /// Returns true if the device holds no data at all.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.page_count()? == 0)
    }
    /// Reads a full page. The destination must be exactly one page long.
    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()>;
    /// Reads `dst.len()` bytes starting at `offset` within the page.
    fn read_partial(&self, id: PageId, offset: u32, dst: &mut [u8]) -> Result<()>;
    /// Writes a full page. The source must be exactly one page long.
    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()>;
    /// Truncates or extends the device to exactly `count` pages.
    fn set_page_count(&self, count: u64) -> Result<()>;
    /// Flushes written pages to stable storage. When `flush_metadata` is
    /// false the device may defer metadata-only updates.
    fn sync(&self, flush_metadata: bool) -> Result<()>;
}

fn page_offset(id: PageId, page_size: u32) -> Result<u64> {
    id.0.checked_mul(u64::from(page_size))
        .ok_or(StoreError::Invalid("page offset overflow"))
}

/// A [`PageDevice`] over a single file of fixed-size pages.
#[derive(Clone)]
pub struct FilePageDevice {
    io: StdFileIo,
    page_size: u32,
}

impl FilePageDevice {
    /// Opens (or creates) the file at `path` as a device of `page_size` pages.
    pub fn open(path: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        if page_size == 0 {
            return Err(StoreError::Invalid("page size must be non-zero"));
        }
        Ok(Self {
            io: StdFileIo::open(path)?,
            page_size,
        })
    }

    /// Wraps an already-opened positioned-I/O handle.
    pub fn from_io(io: StdFileIo, page_size: u32) -> Self {
        Self { io, page_size }
    }
}

impl PageDevice for FilePageDevice {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Result<u64> {
        let len = self.io.len()?;
        Ok(len.div_ceil(u64::from(self.page_size)))
    }

    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        if dst.len() != self.page_size as usize {
            return Err(StoreError::Invalid("read buffer is not one page long"));
        }
        let offset = page_offset(id, self.page_size)?;
        let len = self.io.len()?;
        if offset >= len {
            dst.fill(0);
            return Ok(());
        }
        let available = (len - offset).min(dst.len() as u64) as usize;
        self.io.read_at(offset, &mut dst[..available])?;
        dst[available..].fill(0);
        Ok(())
    }

    fn read_partial(&self, id: PageId, offset: u32, dst: &mut [u8]) -> Result<()> {
        let end = u64::from(offset) + dst.len() as u64;
        if end > u64::from(self.page_size) {
            return Err(StoreError::Invalid("partial read crosses page boundary"));
        }
        let base = page_offset(id, self.page_size)?;
        self.io.read_at(base + u64::from(offset), dst)
    }

    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()> {
        if src.len() != self.page_size as usize {
            return Err(StoreError::Invalid("write buffer is not one page long"));
        }
        let offset = page_offset(id, self.page_size)?;
        self.io.write_at(offset, src)
    }

    fn set_page_count(&self, count: u64) -> Result<()> {
        let len = count
            .checked_mul(u64::from(self.page_size))
            .ok_or(StoreError::Invalid("page count overflow"))?;
        self.io.truncate(len)
    }

    fn sync(&self, flush_metadata: bool) -> Result<()> {
        if flush_metadata {
            self.io.sync_all()
        } else {
            self.io.sync_data()
        }
    }
}
