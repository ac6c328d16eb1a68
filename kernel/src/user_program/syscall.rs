//! System calls that touch the VM subsystem.
//!
//! Arguments arrive as raw register values. Buffers handed in by user code
//! are checked with [`get_user`] at both ends. File I/O goes one page of the
//! buffer at a time with that page pinned, so servicing the call never has
//! to fault in a page while holding file locks.

use crate::fs::file_table::{FileDescriptor, STDIN_FILENO, STDOUT_FILENO};
use crate::logging::console_write;
use crate::mem::{
    user::{get_user, PinGuard},
    vma::{MapId, MmapError},
};
use crate::threading::process::Process;
use alloc::vec;
use core::cmp::{max, min};
use kidneyos_shared::mem::{pages_spanned, PAGE_FRAME_SIZE};
use log::{debug, warn};

pub const SYS_EXIT: usize = 0x1;
pub const SYS_READ: usize = 0x3;
pub const SYS_WRITE: usize = 0x4;
pub const SYS_CLOSE: usize = 0x6;
pub const SYS_MMAP: usize = 0x5a;
pub const SYS_MUNMAP: usize = 0x5b;

/// Value returned to user code for a failed call.
const FAILED: isize = -1;

/// This function is responsible for processing syscalls made by user programs.
/// Its return value is the syscall return value, whose meaning depends on the
/// syscall. Nothing meaningful is returned when the call terminated the
/// process.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
pub fn handler(
    process: &Process,
    syscall_number: usize,
    arg0: usize,
    arg1: usize,
    arg2: usize,
) -> isize {
    match syscall_number {
        SYS_EXIT => {
            sys_exit(process, arg0 as i32);
            0
        }
        SYS_READ => sys_read(process, arg0 as FileDescriptor, arg1, arg2),
        SYS_WRITE => sys_write(process, arg0 as FileDescriptor, arg1, arg2),
        SYS_CLOSE => match process.files().close(arg0 as FileDescriptor) {
            Ok(()) => 0,
            Err(_) => FAILED,
        },
        SYS_MMAP => sys_mmap(process, arg0 as FileDescriptor, arg1) as isize,
        SYS_MUNMAP => {
            sys_munmap(process, arg0 as MapId);
            0
        }
        _ => {
            warn!(
                "pid {}: unknown syscall {syscall_number:#X} with arguments: {arg0:#X} {arg1:#X} {arg2:#X}",
                process.pid()
            );
            FAILED
        }
    }
}

pub fn sys_exit(process: &Process, status: i32) {
    process.exit(status);
}

/// Maps the file open as `fd` at `addr`. Returns the mapping id, or -1.
pub fn sys_mmap(process: &Process, fd: FileDescriptor, addr: usize) -> MapId {
    match try_mmap(process, fd, addr) {
        Ok(id) => id,
        Err(err) => {
            debug!("pid {}: mmap of fd {fd} at {addr:#x} refused: {err}", process.pid());
            -1
        }
    }
}

fn try_mmap(process: &Process, fd: FileDescriptor, addr: usize) -> Result<MapId, MmapError> {
    if fd == STDIN_FILENO || fd == STDOUT_FILENO {
        return Err(MmapError::ConsoleDescriptor);
    }
    // The mapping gets its own handle so closing `fd` does not end it.
    let handle = process
        .files()
        .get(fd)
        .map_err(|_| MmapError::BadDescriptor)?
        .reopen();
    process.space().mmap(handle, addr)
}

/// Unmaps mapping `id`. Unknown ids are ignored.
pub fn sys_munmap(process: &Process, id: MapId) {
    process.space().munmap(id);
}

/// Checks that both ends of `[buffer, buffer + size)` are readable user
/// memory, terminating the process if not.
fn check_buffer(process: &Process, buffer: usize, size: usize) -> bool {
    if size == 0 {
        return true;
    }
    let ok = buffer
        .checked_add(size - 1)
        .is_some_and(|last| get_user(process, buffer).is_some() && get_user(process, last).is_some());
    if !ok {
        process.exit(-1);
    }
    ok
}

/// Converts a byte count for the syscall return register.
fn count(n: usize) -> isize {
    isize::try_from(n).unwrap_or(isize::MAX)
}

/// Splits `[buffer, buffer + size)` at page boundaries.
fn page_chunks(buffer: usize, size: usize) -> impl Iterator<Item = (usize, usize)> {
    let end = buffer + size;
    pages_spanned(buffer, size).map(move |upage| {
        let start = max(upage, buffer);
        (start, min(upage + PAGE_FRAME_SIZE, end) - start)
    })
}

/// Ends the process if `fd` is not an open file.
fn check_descriptor(process: &Process, fd: FileDescriptor) -> bool {
    let open = process.files().get(fd).is_ok();
    if !open {
        debug!("pid {}: fd {fd} is not open", process.pid());
        process.exit(-1);
    }
    open
}

/// Reads from `fd` into the user buffer. The buffer is filled one page at a
/// time with only that page pinned, so a buffer larger than the frame pool
/// still makes progress.
pub fn sys_read(process: &Process, fd: FileDescriptor, buffer: usize, size: usize) -> isize {
    if !check_buffer(process, buffer, size) {
        return FAILED;
    }
    match fd {
        // No keyboard; console input is always at end of file.
        STDIN_FILENO => return 0,
        STDOUT_FILENO => return FAILED,
        _ => {}
    }
    if !check_descriptor(process, fd) {
        return FAILED;
    }

    let mut total = 0;
    for (start, len) in page_chunks(buffer, size) {
        let Ok(_pinned) = PinGuard::new(process.space(), start, len) else {
            process.exit(-1);
            return FAILED;
        };
        let mut data = vec![0; len];
        let result = process.files().read(fd, &mut data);
        let read = match result {
            Ok(read) => read,
            Err(err) => {
                debug!("pid {}: read from fd {fd} failed: {err}", process.pid());
                process.exit(-1);
                return FAILED;
            }
        };
        // Storing into a read-only page is redirected and ends the process.
        if process.copy_user(start, &mut data[..read], true).is_err() {
            process.exit(-1);
            return FAILED;
        }
        total += read;
        if read < len {
            break;
        }
    }
    count(total)
}

/// Writes the user buffer to `fd`, one page at a time like [`sys_read`].
pub fn sys_write(process: &Process, fd: FileDescriptor, buffer: usize, size: usize) -> isize {
    if !check_buffer(process, buffer, size) {
        return FAILED;
    }
    if fd == STDIN_FILENO {
        return FAILED;
    }
    if fd != STDOUT_FILENO && !check_descriptor(process, fd) {
        return FAILED;
    }

    let mut total = 0;
    for (start, len) in page_chunks(buffer, size) {
        let Ok(_pinned) = PinGuard::new(process.space(), start, len) else {
            process.exit(-1);
            return FAILED;
        };
        let mut data = vec![0; len];
        if process.copy_user(start, &mut data, false).is_err() {
            process.exit(-1);
            return FAILED;
        }

        if fd == STDOUT_FILENO {
            console_write(&data);
            total += len;
            continue;
        }
        let result = process.files().write(fd, &data);
        match result {
            Ok(written) => {
                total += written;
                if written < len {
                    break;
                }
            }
            Err(err) => {
                debug!("pid {}: write to fd {fd} failed: {err}", process.pid());
                process.exit(-1);
                return FAILED;
            }
        }
    }
    count(total)
}
