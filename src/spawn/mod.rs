//! The parent side of the spawn protocol.
//!
//! One synchronous call: set up the error pipe, serialize against other
//! spawners, block signals, fork, and then find out from the pipe whether
//! the child made it to its exec. Every failure path reaps the child; a
//! caller never inherits an orphan from here.

mod child;
mod fd_dir;
mod sigmask;

use crate::config::SpawnConfig;
use crate::error::{SpawnError, SpawnResult, spawn_error};
use crate::error_pipe::{self, ReadOutcome};
use child::ChildContext;

use log::{debug, warn};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::{Mutex, PoisonError};

/// Serializes spawns so signal-mask changes around the fork cannot race
/// between threads. Held from mask-block through mask-restore in the
/// parent; the child's copy is irrelevant since the child execs.
static FORK_LOCK: Mutex<()> = Mutex::new(());

/// Create a child process per `config`.
///
/// Returns the child's pid once its exec has succeeded, or a
/// [`SpawnError`] naming the setup step that failed. The caller owns
/// waiting on the returned pid; on error there is nothing left to wait on.
pub fn spawn(config: &SpawnConfig) -> SpawnResult<Pid> {
    debug!(
        "spawning {:?} with {} managed fds",
        config.program,
        config.fd_count()
    );

    let (pipe_read, pipe_write) = error_pipe::create()?;

    // Scratch for the child's two-phase remap, allocated while allocation
    // is still allowed.
    let mut scratch: Box<[RawFd]> = vec![-1; config.fd_count()].into_boxed_slice();

    // The child's view of the config: plain values only, prepared before
    // the fork so no conversion work is left for the hostile window.
    let ctx = ChildContext {
        program: config.program.as_ptr(),
        argv: config.argv.as_ptr(),
        envp: config.env.as_ptr(),
        cwd: config.cwd.as_ref().map_or(ptr::null(), |cwd| cwd.as_ptr()),
        fd_setup: &config.fd_setup,
        new_session: config.new_session,
        close_other_fds: config.close_other_fds,
    };

    let guard = FORK_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let oldmask = match sigmask::block_all_but_fatal() {
        Ok(mask) => mask,
        Err(e) => {
            drop(guard);
            return Err(spawn_error!(ThreadSigmaskFailed, e));
        }
    };

    // vfork suspends the parent and lends it the child until the exec;
    // fork copies. Either way the child branch must not leave this stack
    // frame alive, which is why the syscall sits inline here instead of
    // behind a helper function.
    #[cfg(feature = "vfork")]
    let pid = unsafe { libc::vfork() };
    #[cfg(not(feature = "vfork"))]
    let pid = unsafe { libc::fork() };

    if pid == 0 {
        // Child. Only async-signal-safe work from here to the exec.
        child::setup_and_exec(&ctx, pipe_write.as_raw_fd(), &mut scratch);
        // setup_and_exec execs or exits 253; getting here is a bug.
        unsafe { libc::_exit(254) };
    }

    // Parent.
    let fork_errno = Errno::last();

    let restored = sigmask::restore(&oldmask);
    drop(guard);

    if let Err(e) = restored {
        // The mask is in an unknown state; give up on this spawn, but
        // never leak the child.
        let error = spawn_error!(ThreadSigmaskFailed, e);
        return Err(if pid > 0 {
            kill_and_reap(Pid::from_raw(pid), error)
        } else {
            error
        });
    }

    if pid < 0 {
        // Fork failure keeps its historical error coding.
        return Err(spawn_error!(FcntlFailed, fork_errno));
    }
    let pid = Pid::from_raw(pid);

    // Close our copy of the write end so the child is the last writer,
    // and free what the child was borrowing.
    drop(pipe_write);
    drop(scratch);

    match error_pipe::read_report(&pipe_read) {
        ReadOutcome::Eof => {
            debug!("spawned pid {pid}");
            Ok(pid)
        }
        ReadOutcome::Report(raw) => {
            // The child reported and exited 253; reap it.
            let error = raw.into_error();
            Err(match reap(pid) {
                Ok(()) => error,
                Err(wait_error) => wait_error,
            })
        }
        ReadOutcome::Short(_) => {
            // A torn report: the child is in an unknown state.
            Err(kill_and_reap(
                pid,
                spawn_error!(ReadFromChildFailed, Errno::EIO),
            ))
        }
        ReadOutcome::Error(e) => Err(kill_and_reap(pid, spawn_error!(ReadFromChildFailed, e))),
    }
}

/// EINTR-retrying waitpid. Only returns an error when waitpid reports
/// something genuinely unexpected for a child we know we created.
fn reap(pid: Pid) -> SpawnResult<()> {
    loop {
        match waitpid(pid, None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug_assert!(false, "waitpid({pid}) failed: {e}");
                return Err(spawn_error!(FailedChildWaitpid, e));
            }
        }
    }
}

/// Last-ditch teardown for a child in an unknown state: kill, then reap.
/// Returns the error to surface, which is `pending` unless the reap itself
/// failed.
fn kill_and_reap(pid: Pid, pending: SpawnError) -> SpawnError {
    warn!("killing half-spawned child {pid}: {pending}");
    let _ = kill(pid, Signal::SIGKILL);
    match reap(pid) {
        Ok(()) => pending,
        Err(wait_error) => wait_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CStringArray, FdSetup, SpawnConfig};
    use crate::error::SpawnErrorKind;
    use crate::status::decode_status;

    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;
    use nix::unistd::{getpgid, getsid, pipe2, read as nix_read};

    use std::ffi::CString;
    use std::os::fd::OwnedFd;

    fn cstring(s: &str) -> CString {
        CString::new(s).expect("no interior NUL")
    }

    fn array(items: &[&str]) -> CStringArray {
        CStringArray::new(items.iter().map(|s| cstring(s)).collect())
    }

    fn simple_config(program: &str, argv: &[&str]) -> SpawnConfig {
        SpawnConfig::new(cstring(program), array(argv), CStringArray::new(Vec::new()))
    }

    /// Cloexec on the parent side so children never inherit stray copies;
    /// MapFd installs a fresh descriptor with the flag cleared anyway.
    fn test_pipe() -> (OwnedFd, OwnedFd) {
        pipe2(OFlag::O_CLOEXEC).expect("pipe2")
    }

    /// Raw waitpid so tests feed the decoder undecoded statuses.
    fn wait_raw(pid: Pid) -> i32 {
        let mut status: libc::c_int = 0;
        loop {
            let reaped = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
            if reaped == pid.as_raw() {
                return status;
            }
            assert_eq!(Errno::last(), Errno::EINTR, "waitpid failed");
        }
    }

    fn read_to_end(fd: &OwnedFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match nix_read(fd, &mut buf) {
                Ok(0) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Errno::EINTR) => continue,
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    fn assert_exit_code(pid: Pid, expected: i32) {
        let decoded = decode_status(wait_raw(pid));
        assert!(decoded.has_exited);
        assert!(decoded.is_exit_code);
        assert_eq!(decoded.code, expected);
    }

    #[test]
    fn spawns_and_reaps_bin_true() {
        let config = simple_config("/bin/true", &["true"]);
        let pid = spawn(&config).expect("spawn /bin/true");
        assert!(pid.as_raw() > 0);
        assert_exit_code(pid, 0);
    }

    #[test]
    fn reports_exit_code_of_bin_false() {
        let config = simple_config("/bin/false", &["false"]);
        let pid = spawn(&config).expect("spawn /bin/false");
        assert_exit_code(pid, 1);
    }

    #[test]
    fn missing_program_reports_execve_enoent() {
        let config = simple_config("/does/not/exist", &["nope"]);
        let err = spawn(&config).expect_err("spawn must fail");
        assert_eq!(err.kind, SpawnErrorKind::ExecveFailed);
        assert_eq!(err.errno, Errno::ENOENT);
    }

    #[test]
    fn child_death_by_signal_decodes_as_signal() {
        let config = simple_config("/bin/sh", &["sh", "-c", "kill -TERM $$"]);
        let pid = spawn(&config).expect("spawn sh");
        let decoded = decode_status(wait_raw(pid));
        assert!(decoded.has_exited);
        assert!(!decoded.is_exit_code);
        assert_eq!(decoded.code, libc::SIGTERM);
    }

    #[test]
    fn maps_child_stdout_onto_a_pipe() {
        let (pipe_r, pipe_w) = test_pipe();
        let mut config = simple_config("/bin/echo", &["echo", "fd-remap"]);
        config.fd_setup = vec![
            FdSetup::CloseFd,
            FdSetup::MapFd {
                parent_fd: pipe_w.as_raw_fd(),
            },
            FdSetup::CloseFd,
        ];

        let pid = spawn(&config).expect("spawn echo");
        drop(pipe_w);
        assert_eq!(read_to_end(&pipe_r), b"fd-remap\n");
        assert_exit_code(pid, 0);
    }

    #[test]
    fn maps_one_parent_fd_onto_two_child_slots() {
        let (pipe_r, pipe_w) = test_pipe();
        let mut config = simple_config("/bin/sh", &["sh", "-c", "echo one; echo two >&2"]);
        config.fd_setup = vec![
            FdSetup::CloseFd,
            FdSetup::MapFd {
                parent_fd: pipe_w.as_raw_fd(),
            },
            FdSetup::MapFd {
                parent_fd: pipe_w.as_raw_fd(),
            },
        ];

        let pid = spawn(&config).expect("spawn sh");
        drop(pipe_w);
        assert_eq!(read_to_end(&pipe_r), b"one\ntwo\n");
        assert_exit_code(pid, 0);
    }

    #[test]
    fn passes_the_environment_vector() {
        let (pipe_r, pipe_w) = test_pipe();
        let mut config = SpawnConfig::new(
            cstring("/bin/sh"),
            array(&["sh", "-c", "echo $GREETING"]),
            array(&["GREETING=hello", "PATH=/bin:/usr/bin"]),
        );
        config.fd_setup = vec![
            FdSetup::CloseFd,
            FdSetup::MapFd {
                parent_fd: pipe_w.as_raw_fd(),
            },
            FdSetup::CloseFd,
        ];

        let pid = spawn(&config).expect("spawn sh");
        drop(pipe_w);
        assert_eq!(read_to_end(&pipe_r), b"hello\n");
        assert_exit_code(pid, 0);
    }

    #[test]
    fn bad_parent_fd_reports_dup_with_slot_index() {
        let mut config = simple_config("/bin/true", &["true"]);
        config.fd_setup = vec![FdSetup::MapFd { parent_fd: -1 }];
        let err = spawn(&config).expect_err("spawn must fail");
        assert_eq!(err.kind, SpawnErrorKind::DupFailed);
        assert_eq!(err.errno, Errno::EBADF);
        assert_eq!(err.extra_info, 0);
    }

    #[test]
    fn error_report_survives_a_low_fd_range_covering_the_pipe() {
        // With ten managed slots the report pipe's fds fall inside [0, N)
        // and must be re-duplicated above the range before the remap.
        let mut config = simple_config("/does/not/exist", &["nope"]);
        config.fd_setup = vec![FdSetup::CloseFd; 10];
        let err = spawn(&config).expect_err("spawn must fail");
        assert_eq!(err.kind, SpawnErrorKind::ExecveFailed);
        assert_eq!(err.errno, Errno::ENOENT);
    }

    fn spawn_fd_listing(close_other_fds: bool) -> Vec<i32> {
        // Real descriptors on stdin/stderr so shell behavior stays boring.
        let devnull =
            nix::fcntl::open("/dev/null", OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
                .expect("open /dev/null");
        let (pipe_r, pipe_w) = test_pipe();
        let mut config = simple_config("/bin/sh", &["sh", "-c", "ls /proc/self/fd"]);
        config.fd_setup = vec![
            FdSetup::MapFd {
                parent_fd: devnull.as_raw_fd(),
            },
            FdSetup::MapFd {
                parent_fd: pipe_w.as_raw_fd(),
            },
            FdSetup::MapFd {
                parent_fd: devnull.as_raw_fd(),
            },
        ];
        config.close_other_fds = close_other_fds;

        let pid = spawn(&config).expect("spawn sh");
        drop(pipe_w);
        let output = read_to_end(&pipe_r);
        assert_exit_code(pid, 0);

        String::from_utf8(output)
            .expect("fd listing is ascii")
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.parse::<i32>().expect("fd number"))
            .collect()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn close_other_fds_empties_the_high_range() {
        // Non-cloexec descriptors that an exec would otherwise leak.
        let extras: Vec<OwnedFd> = (0..50)
            .map(|_| nix::fcntl::open("/dev/null", OFlag::O_RDONLY, Mode::empty()).expect("open"))
            .collect();

        // Control: without the flag the extras show up in the child.
        let listed = spawn_fd_listing(false);
        assert!(
            listed.iter().any(|&fd| fd >= 5),
            "expected leaked fds in the control child, got {listed:?}"
        );

        // With the flag only the low range remains, plus whatever fd the
        // listing itself opened to read the directory.
        let listed = spawn_fd_listing(true);
        assert!(
            listed.iter().all(|&fd| fd < 5),
            "high fds leaked into the child: {listed:?}"
        );

        drop(extras);
    }

    #[test]
    fn new_session_makes_the_child_a_session_leader() {
        let (pipe_r, pipe_w) = test_pipe();
        let mut config = simple_config("/bin/cat", &["cat"]);
        config.fd_setup = vec![FdSetup::MapFd {
            parent_fd: pipe_r.as_raw_fd(),
        }];
        config.new_session = true;

        // cat blocks on stdin, so the child is alive while we look at it;
        // spawn only returns after the exec, so setsid has already run.
        let pid = spawn(&config).expect("spawn cat");
        assert_eq!(getsid(Some(pid)).expect("getsid"), pid);
        assert_eq!(getpgid(Some(pid)).expect("getpgid"), pid);

        drop(pipe_w);
        assert_exit_code(pid, 0);
    }

    #[test]
    fn chdir_is_observed_by_the_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let canonical = std::fs::canonicalize(dir.path()).expect("canonicalize");

        let (pipe_r, pipe_w) = test_pipe();
        let mut config = simple_config("/bin/sh", &["sh", "-c", "pwd"]);
        config.cwd = Some(cstring(canonical.to_str().expect("utf-8 tempdir")));
        config.fd_setup = vec![
            FdSetup::CloseFd,
            FdSetup::MapFd {
                parent_fd: pipe_w.as_raw_fd(),
            },
            FdSetup::CloseFd,
        ];

        let pid = spawn(&config).expect("spawn sh");
        drop(pipe_w);
        let mut expected = canonical.to_str().unwrap().as_bytes().to_vec();
        expected.push(b'\n');
        assert_eq!(read_to_end(&pipe_r), expected);
        assert_exit_code(pid, 0);
    }

    #[test]
    fn missing_working_directory_reports_chdir() {
        let mut config = simple_config("/bin/true", &["true"]);
        config.cwd = Some(cstring("/does/not/exist"));
        let err = spawn(&config).expect_err("spawn must fail");
        assert_eq!(err.kind, SpawnErrorKind::ChdirFailed);
        assert_eq!(err.errno, Errno::ENOENT);
    }

    #[test]
    fn concurrent_spawns_return_distinct_pids() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    let config = simple_config("/bin/true", &["true"]);
                    let pid = spawn(&config).expect("spawn");
                    assert_exit_code(pid, 0);
                    pid.as_raw()
                })
            })
            .collect();

        let mut pids: Vec<i32> = handles
            .into_iter()
            .map(|handle| handle.join().expect("spawner thread"))
            .collect();
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 8, "spawned pids must be distinct");
    }
}
