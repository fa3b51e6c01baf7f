//! Byte-addressed device access.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tide_error::{PoolError, Result};
use tide_types::ByteOffset;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_bounds(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(u64::try_from(len).map_err(|_| PoolError::OutOfBounds {
            offset: offset.0,
            len,
            device_len,
        })?)
        .ok_or(PoolError::OutOfBounds {
            offset: offset.0,
            len,
            device_len,
        })?;
    if end.0 > device_len {
        return Err(PoolError::OutOfBounds {
            offset: offset.0,
            len,
            device_len,
        });
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open `path` read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        check_bounds(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        if !self.writable {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied).into());
        }
        check_bounds(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
