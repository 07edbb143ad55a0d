//! Highest-possibly-open-fd detection without heap allocation.
//!
//! Used by the child's close-everything-else fallback between fork and exec,
//! so everything here must be async-signal-safe: raw syscalls and a stack
//! buffer, never readdir(3).

#[cfg(target_os = "linux")]
use nix::errno::Errno;

use libc::c_int;

/// Last-resort guess when neither the fd directory nor sysconf works.
const FALLBACK_MAX_FD: c_int = 1024;

/// getdents64 hands back entries 8-aligned within the buffer, so the buffer
/// itself has to start aligned.
#[cfg(target_os = "linux")]
#[repr(align(8))]
struct DirentBuf([u8; 4096]);

/// Parse a directory entry name as a non-negative decimal fd number.
/// Returns -1 for anything else.
#[cfg(any(target_os = "linux", test))]
fn parse_fd_number(name: &[u8]) -> c_int {
    if name.is_empty() {
        return -1;
    }
    let mut out: c_int = 0;
    for &c in name {
        if !c.is_ascii_digit() {
            return -1;
        }
        out = out * 10 + (c - b'0') as c_int;
    }
    out
}

/// Scan a `/proc/self/fd`-style directory for the highest fd number.
///
/// Returns -1 if the directory cannot be opened or an entry name is not a
/// number (which means we are not looking at a real fd directory). On a
/// getdents failure mid-scan, returns the maximum seen so far; EINTR is
/// retried.
#[cfg(target_os = "linux")]
pub(crate) fn highest_fd_in_dir(fd_dir: &std::ffi::CStr) -> c_int {
    let mut highest: c_int = 0;

    let dir_fd = unsafe { libc::open(fd_dir.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if dir_fd < 0 {
        return -1;
    }

    let mut buf = DirentBuf([0; 4096]);
    loop {
        let bytes_read = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                dir_fd,
                buf.0.as_mut_ptr(),
                buf.0.len(),
            )
        };
        if bytes_read == 0 {
            break;
        }
        if bytes_read < 0 {
            if Errno::last_raw() == libc::EINTR {
                continue;
            }
            break;
        }

        let mut offset: isize = 0;
        while offset < bytes_read as isize {
            // SAFETY: the kernel wrote a well-formed dirent64 at this
            // offset; reclen keeps us inside the filled part of the buffer.
            let (reclen, number) = unsafe {
                let entry = buf.0.as_ptr().offset(offset) as *const libc::dirent64;
                let name_ptr = (*entry).d_name.as_ptr() as *const u8;
                let number = if *name_ptr == b'.' {
                    // "." or ".."
                    0
                } else {
                    let mut len = 0usize;
                    while *name_ptr.add(len) != 0 {
                        len += 1;
                    }
                    parse_fd_number(std::slice::from_raw_parts(name_ptr, len))
                };
                ((*entry).d_reclen as isize, number)
            };
            if number < 0 {
                unsafe { libc::close(dir_fd) };
                return -1;
            }
            if number > highest {
                highest = number;
            }
            offset += reclen;
        }
    }

    unsafe { libc::close(dir_fd) };
    highest
}

fn descriptor_table_size() -> c_int {
    let size = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if size > 0 {
        size as c_int
    } else {
        FALLBACK_MAX_FD
    }
}

/// The highest fd that might currently be open in this process.
///
/// Callable from the child between fork and exec.
pub(crate) fn highest_possibly_open_fd() -> c_int {
    #[cfg(target_os = "linux")]
    {
        let highest = highest_fd_in_dir(c"/proc/self/fd");
        if highest >= 0 {
            return highest;
        }
    }
    descriptor_table_size()
}
