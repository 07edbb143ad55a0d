//! The child-to-parent error-report channel.
//!
//! One unidirectional pipe per spawn. The child writes a single
//! [`RawSpawnError`] if any setup step fails; a successful execve closes the
//! write end via close-on-exec, so the parent reading EOF *is* the success
//! signal. Host byte order, no framing: the record is written in one call,
//! which for a size well under PIPE_BUF is atomic.

use crate::error::{RawSpawnError, SpawnResult, spawn_error};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::{pipe, read};

use std::mem;
use std::os::fd::OwnedFd;
use std::os::unix::io::RawFd;
use std::ptr;

const REPORT_SIZE: usize = mem::size_of::<RawSpawnError>();

/// What the parent found on the read end.
pub(crate) enum ReadOutcome {
    /// EOF without data: the exec succeeded.
    Eof,
    /// The child's failure report.
    Report(RawSpawnError),
    /// Fewer bytes than a full record; the child is in an unknown state.
    Short(usize),
    /// The read itself failed (EINTR is retried, never surfaced).
    Error(Errno),
}

/// Create the report pipe with close-on-exec set on both ends.
///
/// The flag is set with separate fcntl calls rather than `pipe2(O_CLOEXEC)`
/// so that pipe creation and flag setup report as distinct failures.
pub(crate) fn create() -> SpawnResult<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = pipe().map_err(|e| spawn_error!(PipeFailed, e))?;
    for fd in [&read_end, &write_end] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| spawn_error!(FcntlFailed, e))?;
    }
    Ok((read_end, write_end))
}

/// Read exactly one report, or EOF, retrying on EINTR.
pub(crate) fn read_report(fd: &OwnedFd) -> ReadOutcome {
    let mut buf = [0u8; REPORT_SIZE];
    loop {
        match read(fd, &mut buf) {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) if n == REPORT_SIZE => {
                // SAFETY: the write end only ever carries one RawSpawnError,
                // written whole; the type is plain data.
                let raw = unsafe { ptr::read_unaligned(buf.as_ptr() as *const RawSpawnError) };
                return ReadOutcome::Report(raw);
            }
            Ok(n) => return ReadOutcome::Short(n),
            Err(Errno::EINTR) => continue,
            Err(e) => return ReadOutcome::Error(e),
        }
    }
}

/// Child-side write of the failure report.
///
/// Runs between fork and exec: a single raw write, no allocation, result
/// deliberately ignored (if the parent is gone there is nobody to tell).
pub(crate) fn write_report(fd: RawFd, report: &RawSpawnError) {
    unsafe {
        libc::write(
            fd,
            report as *const RawSpawnError as *const libc::c_void,
            REPORT_SIZE,
        );
    }
}
