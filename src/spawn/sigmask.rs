//! Thread signal masking around the fork.

use nix::sys::signal::{SigSet, Signal, SigmaskHow, pthread_sigmask};

/// Signals left deliverable while a spawn is in flight. All of them mean
/// "something went seriously wrong"; keeping them unblocked preserves crash
/// diagnostics for bugs in the window between fork and exec.
const FATAL_SIGNALS: [Signal; 9] = [
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGKILL,
    Signal::SIGSEGV,
    Signal::SIGSTOP,
    Signal::SIGSYS,
    Signal::SIGTRAP,
];

/// Block every signal except the fatal set on the calling thread, returning
/// the prior mask for [`restore`].
pub(crate) fn block_all_but_fatal() -> nix::Result<SigSet> {
    let mut mask = SigSet::all();
    for signal in FATAL_SIGNALS {
        mask.remove(signal);
    }

    let mut oldmask = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut oldmask))?;
    Ok(oldmask)
}

/// Put the calling thread's mask back the way [`block_all_but_fatal`]
/// found it.
pub(crate) fn restore(oldmask: &SigSet) -> nix::Result<()> {
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(oldmask), None)
}
