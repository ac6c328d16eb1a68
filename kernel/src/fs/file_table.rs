use super::{FileHandle, FsError, Result};
use alloc::collections::BTreeMap;

pub type FileDescriptor = i32;

pub const STDIN_FILENO: FileDescriptor = 0;
pub const STDOUT_FILENO: FileDescriptor = 1;
/// First descriptor handed out for a real file; 0 and 1 are the console.
pub const FIRST_FILE_FD: FileDescriptor = 2;

struct OpenDescriptor {
    handle: FileHandle,
    position: u64,
}

/// Per-process table of open files.
pub struct FileTable {
    open_files: BTreeMap<FileDescriptor, OpenDescriptor>,
    next_fd: FileDescriptor,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            open_files: BTreeMap::new(),
            next_fd: FIRST_FILE_FD,
        }
    }

    pub fn insert(&mut self, handle: FileHandle) -> FileDescriptor {
        let fd = self.next_fd;
        self.next_fd += 1;
        let _prev = self.open_files.insert(
            fd,
            OpenDescriptor {
                handle,
                position: 0,
            },
        );
        debug_assert!(_prev.is_none(), "duplicate fd");
        fd
    }

    pub fn get(&self, fd: FileDescriptor) -> Result<&FileHandle> {
        self.open_files
            .get(&fd)
            .map(|d| &d.handle)
            .ok_or(FsError::BadFd)
    }

    /// Reads at the descriptor's position and advances it.
    pub fn read(&mut self, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize> {
        let desc = self.open_files.get_mut(&fd).ok_or(FsError::BadFd)?;
        let n = desc.handle.read_at(desc.position, buf)?;
        desc.position += n as u64;
        Ok(n)
    }

    /// Writes at the descriptor's position and advances it.
    pub fn write(&mut self, fd: FileDescriptor, buf: &[u8]) -> Result<usize> {
        let desc = self.open_files.get_mut(&fd).ok_or(FsError::BadFd)?;
        let n = desc.handle.write_at(desc.position, buf)?;
        desc.position += n as u64;
        Ok(n)
    }

    pub fn seek(&mut self, fd: FileDescriptor, position: u64) -> Result<()> {
        let desc = self.open_files.get_mut(&fd).ok_or(FsError::BadFd)?;
        desc.position = position;
        Ok(())
    }

    pub fn close(&mut self, fd: FileDescriptor) -> Result<()> {
        self.open_files.remove(&fd).ok_or(FsError::BadFd)?;
        Ok(())
    }

    /// Closes every descriptor.
    pub fn clear(&mut self) {
        self.open_files.clear();
    }

    pub fn len(&self) -> usize {
        self.open_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open_files.is_empty()
    }
}
