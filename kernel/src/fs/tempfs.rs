use super::{File, FsError, Result};
use crate::sync::mutex::Mutex;
use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};

/// In-memory file.
pub struct TempFile {
    data: Mutex<Vec<u8>>,
    read_only: bool,
    open_count: AtomicUsize,
}

impl TempFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            read_only: false,
            open_count: AtomicUsize::new(0),
        }
    }

    /// A file that rejects writes, like a running executable.
    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            read_only: true,
            ..Self::new(data)
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Number of open handles that have not been released yet.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }
}

impl File for TempFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        if offset >= data.len() as u64 {
            // can't read any data
            return Ok(0);
        }
        let offset = offset as usize; // fits into usize by check above
        let read_len = min(buf.len(), data.len() - offset);
        buf[..read_len].copy_from_slice(&data[offset..offset + read_len]);
        Ok(read_len)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        if offset > (isize::MAX as u64).saturating_sub(buf.len() as u64) {
            // file data would exceed isize::MAX bytes
            return Err(FsError::NoSpace);
        }
        let offset = offset as usize;
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if end > data.len() {
            let grow_amount = end - data.len();
            data.try_reserve(grow_amount)
                .map_err(|_| FsError::NoSpace)?;
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.open_count.fetch_sub(1, Ordering::AcqRel);
    }
}
