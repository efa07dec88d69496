//! Error taxonomy for the stop-the-world core.
//!
//! Per §7: unrecoverable conditions abort the process via [`lose`] and never
//! surface as a `Result`. Only the "expected transient" and
//! "concurrency-bounded" conditions get a typed variant here.

use thiserror::Error;

/// Transient, recoverable failures a caller of the public API may observe.
///
/// Nothing in this enum is ever thrown across a collection in progress: the
/// coordinator either completes a stop/start pair or the process is already
/// aborting via [`lose`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// The platform adapter could not create a new OS thread (out of
    /// resources, stack allocation failed, etc). The prepared thread record
    /// is freed by the caller; no corresponding `os_thread` exists.
    #[error("failed to spawn OS thread: {0}")]
    SpawnFailed(String),

    /// `kill_safely` targeted an OS thread id that has already exited and
    /// been reaped. Treated as a no-op, not a crash.
    #[error("no such thread")]
    NoSuchThread,

    /// The resurrection pool was at `max_resurrectable_waiters` capacity;
    /// the exiting thread must proceed to post-mortem instead of parking.
    #[error("resurrection pool is at capacity")]
    ResurrectionPoolFull,

    /// A timed wait (currently only the resurrection pool's awakener)
    /// expired before the expected wakeup arrived.
    #[error("timed wait expired")]
    AwaitTimedOut,

    /// The platform adapter failed to change page protection.
    #[error("page protection failed: {0}")]
    ProtectFailed(String),
}

/// The single unrecoverable-path entry point (§7's `lose()`).
///
/// Emits a structured diagnostic and aborts the process. Never returns, and
/// is never wrapped in a `Result` — by the time something calls this, the
/// invariants in §8 no longer hold and continuing would corrupt the heap.
#[cold]
pub fn lose(msg: &str) -> ! {
    tracing::error!(target: "stw_core::fatal", "{msg}");
    std::process::abort();
}
