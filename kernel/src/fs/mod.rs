//! Files as seen by the VM subsystem.
//!
//! Memory-mapped regions and lazily loaded executable segments only need
//! positional reads and writes on an open file, so that is all [`File`]
//! asks for. [`FileHandle`] is the reference-counted open file shared by the
//! descriptor table and by every page that is backed by it.

pub mod file_table;
pub mod tempfs;

use alloc::sync::Arc;
use core::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// no space left on device
    #[error("no space left on device")]
    NoSpace,
    /// write to a file that was opened read-only
    #[error("file is read-only")]
    ReadOnly,
    /// descriptor is not open, or names the console
    #[error("bad file descriptor")]
    BadFd,
}

pub type Result<T> = core::result::Result<T, FsError>;

/// Backing object for an open file.
///
/// Reads past the end of the file return a short count (possibly 0) rather
/// than an error. Writes past the end grow the file.
pub trait File: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called each time a new open handle is created for this file.
    fn open(&self) {}
    /// Called when the last clone of an open handle is dropped.
    fn release(&self) {}
}

struct OpenFile {
    file: Arc<dyn File>,
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.file.release();
    }
}

/// An open file. Clones share the same open; [`FileHandle::reopen`] creates
/// an independent one that survives the original being closed.
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<OpenFile>,
}

impl FileHandle {
    pub fn open(file: Arc<dyn File>) -> Self {
        file.open();
        Self {
            inner: Arc::new(OpenFile { file }),
        }
    }

    pub fn reopen(&self) -> Self {
        Self::open(self.inner.file.clone())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.file.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.inner.file.write_at(offset, buf)
    }

    pub fn len(&self) -> u64 {
        self.inner.file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.file.is_empty()
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("len", &self.len())
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}
