use nix::errno::Errno;
use std::fmt;

pub type SpawnResult<T> = Result<T, SpawnError>;

/// Which step of the spawn protocol failed.
///
/// The discriminants are fixed because they travel over the error pipe as
/// part of [`RawSpawnError`]; zero is reserved as "no error".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SpawnErrorKind {
    ExecveFailed = 1,
    PipeFailed = 2,
    FcntlFailed = 3,
    SignalResetFailed = 4,
    SigprocMaskFailed = 5,
    ChdirFailed = 6,
    SetsidFailed = 7,
    Dup2Failed = 8,
    ReadFromChildFailed = 9,
    DupFailed = 10,
    ThreadSigmaskFailed = 11,
    FailedChildWaitpid = 12,
}

impl SpawnErrorKind {
    pub(crate) fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => Self::ExecveFailed,
            2 => Self::PipeFailed,
            3 => Self::FcntlFailed,
            4 => Self::SignalResetFailed,
            5 => Self::SigprocMaskFailed,
            6 => Self::ChdirFailed,
            7 => Self::SetsidFailed,
            8 => Self::Dup2Failed,
            9 => Self::ReadFromChildFailed,
            10 => Self::DupFailed,
            11 => Self::ThreadSigmaskFailed,
            12 => Self::FailedChildWaitpid,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::ExecveFailed => "execve",
            Self::PipeFailed => "pipe",
            Self::FcntlFailed => "fcntl",
            Self::SignalResetFailed => "signal reset",
            Self::SigprocMaskFailed => "sigprocmask",
            Self::ChdirFailed => "chdir",
            Self::SetsidFailed => "setsid",
            Self::Dup2Failed => "dup2",
            Self::ReadFromChildFailed => "read from child",
            Self::DupFailed => "dup",
            Self::ThreadSigmaskFailed => "pthread_sigmask",
            Self::FailedChildWaitpid => "waitpid on child",
        }
    }

    /// What the kind-specific `extra_info` slot holds, if anything.
    fn extra_info_label(self) -> Option<&'static str> {
        match self {
            Self::SignalResetFailed => Some("signal"),
            Self::Dup2Failed | Self::DupFailed => Some("child fd"),
            _ => None,
        }
    }
}

/// A failure from one spawn attempt.
///
/// `file`/`line` point at the failure site, which for child-side kinds is
/// inside the child-setup code; the pipe is the child's only diagnostic
/// channel, so the location is part of the report.
#[derive(Debug, Clone, Copy)]
pub struct SpawnError {
    pub kind: SpawnErrorKind,
    pub errno: Errno,
    pub file: &'static str,
    pub line: u32,
    /// Kind-specific: the signal number for `SignalResetFailed`, the child
    /// fd index for `Dup2Failed`/`DupFailed`, -1 otherwise.
    pub extra_info: i32,
}

impl SpawnError {
    pub(crate) fn at(
        kind: SpawnErrorKind,
        errno: Errno,
        file: &'static str,
        line: u32,
        extra_info: i32,
    ) -> Self {
        Self {
            kind,
            errno,
            file,
            line,
            extra_info,
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.kind.as_str(), self.errno.desc())?;
        if let Some(label) = self.kind.extra_info_label() {
            write!(f, " ({} {})", label, self.extra_info)?;
        }
        write!(f, " at {}:{}", self.file, self.line)
    }
}

impl std::error::Error for SpawnError {}

/// The record the child writes over the error pipe, exactly once, on
/// failure. Plain data only: `file_ptr` references static storage, which
/// stays valid in both processes even when the child borrows the parent's
/// address space under vfork.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct RawSpawnError {
    kind: i32,
    errno: i32,
    file_ptr: *const u8,
    file_len: usize,
    line: u32,
    extra_info: i32,
}

impl RawSpawnError {
    /// Callable between fork and exec: no allocation, no locks.
    pub(crate) fn new(
        kind: SpawnErrorKind,
        errno: i32,
        file: &'static str,
        line: u32,
        extra_info: i32,
    ) -> Self {
        Self {
            kind: kind as i32,
            errno,
            file_ptr: file.as_ptr(),
            file_len: file.len(),
            line,
            extra_info,
        }
    }

    /// Rehydrate the record the parent read off the pipe.
    ///
    /// A kind outside the closed set means the pipe carried something that
    /// was never a [`RawSpawnError`]; that is a bug in the spawner itself,
    /// not a recoverable condition.
    pub(crate) fn into_error(self) -> SpawnError {
        let kind = match SpawnErrorKind::from_raw(self.kind) {
            Some(kind) => kind,
            None => std::process::abort(),
        };
        // SAFETY: file_ptr/file_len were produced by `file!()` in this same
        // process (the record never crosses a process boundary other than
        // the fork), so they describe a live static UTF-8 string.
        let file = unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.file_ptr, self.file_len))
        };
        SpawnError::at(
            kind,
            Errno::from_raw(self.errno),
            file,
            self.line,
            self.extra_info,
        )
    }
}

/// Build a [`SpawnError`] at the current source location, capturing either
/// the given [`Errno`] or the thread's current one.
macro_rules! spawn_error {
    ($kind:ident) => {
        $crate::error::spawn_error!($kind, nix::errno::Errno::last())
    };
    ($kind:ident, $errno:expr) => {
        $crate::error::SpawnError::at(
            $crate::error::SpawnErrorKind::$kind,
            $errno,
            file!(),
            line!(),
            -1,
        )
    };
}
pub(crate) use spawn_error;

/// Child-side counterpart of [`spawn_error!`]: builds the raw pipe record
/// from the current errno. Safe between fork and exec.
macro_rules! raw_error {
    ($kind:ident) => {
        $crate::error::raw_error!($kind, -1)
    };
    ($kind:ident, $extra:expr) => {
        $crate::error::RawSpawnError::new(
            $crate::error::SpawnErrorKind::$kind,
            nix::errno::Errno::last_raw(),
            file!(),
            line!(),
            $extra,
        )
    };
}
pub(crate) use raw_error;
