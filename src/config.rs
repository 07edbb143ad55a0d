use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::ptr;

use libc::c_char;

/// An owned, null-terminated `char *` array for execve.
///
/// Built by the caller before the spawn so that between fork and exec the
/// child only dereferences pointers that already exist. The backing
/// `CString`s are heap-allocated, but their buffers do not move once the
/// array is constructed.
pub struct CStringArray {
    items: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStringArray {
    pub fn new(items: Vec<CString>) -> Self {
        let mut array = Self {
            items,
            ptrs: Vec::new(),
        };
        array.ptrs.reserve_exact(array.items.len() + 1);
        array.ptrs.extend(array.items.iter().map(|s| s.as_ptr()));
        array.ptrs.push(ptr::null());
        array
    }

    /// The null-terminated array, as execve wants it.
    pub fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }

    /// Number of strings, not counting the terminating null.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<CString>> for CStringArray {
    fn from(items: Vec<CString>) -> Self {
        Self::new(items)
    }
}

/// What the child should install at one low-numbered fd slot.
///
/// A config's `fd_setup` vector is indexed by child fd number: entry `i`
/// decides the fate of child fd `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdSetup {
    /// Child fd `i` refers to the same open file description as
    /// `parent_fd` at spawn time.
    MapFd { parent_fd: RawFd },
    /// Child fd `i` is explicitly closed.
    CloseFd,
}

/// Everything [`spawn`](crate::spawn::spawn) needs to create one child.
///
/// Caller-owned and read-only for the duration of the call; any `MapFd`
/// parent fds must stay open until the call returns.
pub struct SpawnConfig {
    /// Absolute or PATH-resolvable executable path.
    pub program: CString,
    /// Argument vector; position 0 is argv[0] by convention.
    pub argv: CStringArray,
    /// `KEY=VALUE` environment strings.
    pub env: CStringArray,
    /// Working directory for the child; `None` inherits the parent's.
    pub cwd: Option<CString>,
    /// Fate of every child fd in `[0, fd_setup.len())`.
    pub fd_setup: Vec<FdSetup>,
    /// Make the child a session leader via setsid(2).
    pub new_session: bool,
    /// Close every child fd at or above `fd_setup.len()` before exec,
    /// except the internal error-report pipe.
    pub close_other_fds: bool,
}

impl SpawnConfig {
    pub fn new(program: CString, argv: CStringArray, env: CStringArray) -> Self {
        Self {
            program,
            argv,
            env,
            cwd: None,
            fd_setup: Vec::new(),
            new_session: false,
            close_other_fds: false,
        }
    }

    /// Length of the fully-specified low fd range.
    pub fn fd_count(&self) -> usize {
        self.fd_setup.len()
    }
}
