//! Everything the child does between fork and exec.
//!
//! This code may run with the parent's address space borrowed (vfork), so
//! the discipline is strict: direct syscalls, writes to caller-provided
//! scratch and stack memory, and the single error-pipe write. No heap, no
//! locks, no panics.

use crate::config::FdSetup;
use crate::error::{RawSpawnError, raw_error};
use crate::error_pipe;
use crate::spawn::fd_dir;

use std::os::unix::io::RawFd;

use libc::c_int;

/// The child's view of the spawn configuration: raw pointers and plain
/// values prepared by the parent before the fork, so no conversion work is
/// left for the hostile window.
pub(crate) struct ChildContext<'a> {
    pub program: *const libc::c_char,
    pub argv: *const *const libc::c_char,
    pub envp: *const *const libc::c_char,
    /// Null when the working directory is inherited.
    pub cwd: *const libc::c_char,
    pub fd_setup: &'a [FdSetup],
    pub new_session: bool,
    pub close_other_fds: bool,
}

/// Report `error` to the parent and exit with the child-failure sentinel.
fn fail(error_pipe: RawFd, error: RawSpawnError) -> ! {
    error_pipe::write_report(error_pipe, &error);
    unsafe {
        libc::close(error_pipe);
        libc::_exit(253);
    }
}

/// Invariant check for states that signal a spawner bug, not a spawnable
/// error. abort(3) is async-signal-safe.
fn child_precondition(condition: bool) {
    if !condition {
        std::process::abort();
    }
}

#[cfg(target_os = "linux")]
fn highest_signal_number() -> c_int {
    unsafe { libc::SIGRTMAX() }
}

#[cfg(not(target_os = "linux"))]
fn highest_signal_number() -> c_int {
    libc::NSIG
}

/// libc keeps a few realtime slots for its own threading machinery and
/// rejects attempts to touch them; they are not ours to reset.
#[cfg(target_os = "linux")]
fn reserved_by_libc(signo: c_int) -> bool {
    signo > 31 && signo < unsafe { libc::SIGRTMIN() }
}

#[cfg(not(target_os = "linux"))]
fn reserved_by_libc(_signo: c_int) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn close_range(first: c_int, last: libc::c_uint) -> c_int {
    // Raw syscall: the libc wrapper only exists from glibc 2.34.
    unsafe { libc::syscall(libc::SYS_close_range, first as libc::c_uint, last, 0) as c_int }
}

/// Steps 1..7 of child setup, in the order the protocol requires.
///
/// Never returns control to its caller in any meaningful sense: it either
/// execs, or reports through the pipe and exits 253. The caller still
/// guards the impossible fall-through with an exit of its own.
pub(crate) fn setup_and_exec(ctx: &ChildContext<'_>, error_pipe: RawFd, scratch: &mut [RawFd]) {
    child_precondition(scratch.len() == ctx.fd_setup.len());
    let fd_count = ctx.fd_setup.len() as c_int;

    // Keep the report channel clear of the fd range we are about to
    // rearrange. F_DUPFD_CLOEXEC lands on the lowest free fd >= fd_count.
    let mut error_pipe = error_pipe;
    if error_pipe < fd_count {
        let duplicated = unsafe { libc::fcntl(error_pipe, libc::F_DUPFD_CLOEXEC, fd_count) };
        if duplicated == -1 {
            // The original fd is still intact for the report.
            fail(error_pipe, raw_error!(FcntlFailed));
        }
        error_pipe = duplicated;
    }

    // Reset signal dispositions. EINVAL means we ran past the highest
    // signal this kernel knows, which ends the loop early and harmlessly.
    let max_signal = highest_signal_number();
    for signo in 1..=max_signal {
        if signo == libc::SIGKILL || signo == libc::SIGSTOP || reserved_by_libc(signo) {
            continue;
        }
        if unsafe { libc::signal(signo, libc::SIG_DFL) } == libc::SIG_ERR {
            if nix::errno::Errno::last_raw() == libc::EINVAL {
                break;
            }
            fail(error_pipe, raw_error!(SignalResetFailed, signo));
        }
    }

    // Reset the signal mask. The child is single-threaded, so the plain
    // process-wide call is enough.
    unsafe {
        let mut empty_set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(empty_set.as_mut_ptr());
        if libc::sigprocmask(libc::SIG_SETMASK, empty_set.as_ptr(), std::ptr::null_mut()) != 0 {
            fail(error_pipe, raw_error!(SigprocMaskFailed));
        }
    }

    if ctx.new_session && unsafe { libc::setsid() } == -1 {
        fail(error_pipe, raw_error!(SetsidFailed));
    }

    // Two-phase fd remap. Phase A: duplicate every mapped parent fd up
    // above the managed range, close-on-exec set atomically, so that no
    // source is sitting on a slot another source still needs.
    for (child_fd, setup) in ctx.fd_setup.iter().enumerate() {
        match *setup {
            FdSetup::MapFd { parent_fd } => {
                let duplicated = unsafe { libc::fcntl(parent_fd, libc::F_DUPFD_CLOEXEC, fd_count) };
                if duplicated == -1 {
                    fail(error_pipe, raw_error!(DupFailed, child_fd as i32));
                }
                scratch[child_fd] = duplicated;
            }
            FdSetup::CloseFd => {
                scratch[child_fd] = -1;
            }
        }
    }

    // Phase B: install into place. dup2 closes whatever sat on the target
    // slot and clears close-on-exec on the result.
    for (child_fd, setup) in ctx.fd_setup.iter().enumerate() {
        match *setup {
            FdSetup::MapFd { .. } => {
                child_precondition(scratch[child_fd] > child_fd as RawFd);
                if unsafe { libc::dup2(scratch[child_fd], child_fd as c_int) } == -1 {
                    fail(error_pipe, raw_error!(Dup2Failed, child_fd as i32));
                }
            }
            FdSetup::CloseFd => {
                child_precondition(scratch[child_fd] == -1);
                // The slot may already be closed; that is fine.
                unsafe { libc::close(child_fd as c_int) };
            }
        }
    }

    if ctx.close_other_fds {
        // error_pipe sits at or above fd_count after the re-dup, so one or
        // two range closes bracket it.
        #[cfg(target_os = "linux")]
        let range_failed = if error_pipe > fd_count {
            let below = close_range(fd_count, (error_pipe - 1) as libc::c_uint);
            let above = close_range(error_pipe + 1, libc::c_uint::MAX);
            below != 0 || above != 0
        } else {
            close_range(error_pipe + 1, libc::c_uint::MAX) != 0
        };
        #[cfg(not(target_os = "linux"))]
        let range_failed = true;
        if range_failed {
            // No close_range on this kernel (or it failed): enumerate and
            // close one by one.
            let highest = fd_dir::highest_possibly_open_fd();
            for fd in fd_count..=highest {
                if fd != error_pipe {
                    unsafe { libc::close(fd) };
                }
            }
        }
    }

    if !ctx.cwd.is_null() && unsafe { libc::chdir(ctx.cwd) } != 0 {
        fail(error_pipe, raw_error!(ChdirFailed));
    }

    unsafe { libc::execve(ctx.program, ctx.argv, ctx.envp) };
    // execve only ever returns on failure.
    fail(error_pipe, raw_error!(ExecveFailed));
}
