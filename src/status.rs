//! Raw wait-status decoding.

/// A decoded wait status.
///
/// `is_exit_code` and `code` are only meaningful when `has_exited` is set:
/// `code` is then the exit code (normal termination) or the terminating
/// signal number. A stopped or continued status decodes as not-exited with
/// `code` -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedStatus {
    pub has_exited: bool,
    pub is_exit_code: bool,
    pub code: i32,
}

/// Decode a raw status integer as produced by waitpid(2).
///
/// Total over all inputs; callers that poll with WUNTRACED or WCONTINUED
/// get `has_exited` false for the stop/continue reports.
pub fn decode_status(raw_status: i32) -> DecodedStatus {
    if libc::WIFEXITED(raw_status) {
        DecodedStatus {
            has_exited: true,
            is_exit_code: true,
            code: libc::WEXITSTATUS(raw_status),
        }
    } else if libc::WIFSIGNALED(raw_status) {
        DecodedStatus {
            has_exited: true,
            is_exit_code: false,
            code: libc::WTERMSIG(raw_status),
        }
    } else {
        DecodedStatus {
            has_exited: false,
            is_exit_code: false,
            code: -1,
        }
    }
}
