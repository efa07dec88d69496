//! §4.A Platform Adapter.
//!
//! The core never calls `libc`/`nix` directly outside this module. Every
//! other component takes `&dyn PlatformAdapter` (or one of the smaller
//! `RawMutex`/`RawCondvar` trait objects it hands out), which is what lets
//! [`fake::FakePlatform`] stand in during tests without a real signal
//! handler or real page permissions.

pub mod fake;
pub mod unix;

use std::time::{Duration, Instant};

use crate::error::RuntimeError;

/// A page-protection level, mirroring `os_protect(addr, len, flags)` in §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// No access at all; touching the page raises SIGSEGV.
    NoAccess,
    /// Load-only; a write raises SIGSEGV.
    ReadOnly,
    /// Load and store.
    ReadWrite,
}

/// Outcome of a [`RawCondvar::wait_timeout`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// The quickly-revocable lock and every other raw mutex in the core (registry
/// lock, dispatcher mutexes, `state_lock`, `resurrected_lock`,
/// `post_mortem_lock`) are all instances of this trait rather than
/// `std::sync::Mutex`, because several of them are locked on one thread and
/// unlocked by a *different* thread as part of the rendezvous protocol in
/// §4.F — a pattern `std::sync::MutexGuard` deliberately does not support
/// (`MutexGuard` is `!Send`). A raw, non-RAII lock/unlock pair is the
/// faithful shape here, matching the pthread mutex the original adapter
/// exposes.
pub trait RawMutex: Send + Sync {
    fn lock(&self);
    fn try_lock(&self) -> bool;
    /// # Panics
    /// Implementations may panic (via [`crate::error::lose`]) if the mutex
    /// was not held by anyone; that indicates a core bug, not a platform
    /// condition.
    fn unlock(&self);
}

pub trait RawCondvar: Send + Sync {
    /// Block until notified. `mutex` must be the lock protecting the
    /// predicate the caller is waiting on, and must be held on entry;
    /// released for the duration of the wait and re-acquired before return,
    /// exactly like `pthread_cond_wait`.
    fn wait(&self, mutex: &dyn RawMutex);

    /// As [`RawCondvar::wait`], but returns [`WaitOutcome::TimedOut`] if
    /// `dur` elapses first.
    fn wait_timeout(&self, mutex: &dyn RawMutex, dur: Duration) -> WaitOutcome;

    fn notify_one(&self);
    fn notify_all(&self);
}

/// Result of touching a [`MappedPage`] at its current protection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAccess {
    /// The access completed; value is meaningful only for loads.
    Ok(usize),
    /// The current protection level forbids this access. On the real
    /// adapter this is detected in software *before* issuing the
    /// instruction that would otherwise raise SIGSEGV — see
    /// `UnixMappedPage` for why the core never actually waits on a signal
    /// handler to recover control (§4.E treats "the store faulted" as a
    /// plain branch, and that is exactly what this variant models).
    WouldFault,
}

/// A `mmap`-backed page the core can later `mprotect`. Dropping it unmaps
/// the backing region.
///
/// `load_word`/`store_word` are the safepoint-page rendezvous primitive from
/// §2: "a cheap read on the hot path" that becomes a fault when the
/// coordinator wants attention. They return [`PageAccess::WouldFault`]
/// instead of letting a real SIGSEGV interrupt control flow, so the fast
/// path in §4.E is expressible as ordinary Rust control flow.
pub trait MappedPage: Send + Sync {
    /// Stable base address for the lifetime of this mapping.
    fn addr(&self) -> *mut u8;
    fn len(&self) -> usize;
    fn protect(&self, prot: Protection) -> Result<(), RuntimeError>;
    fn current_protection(&self) -> Protection;

    /// Read the first machine word, with the ordering the fast path needs.
    fn load_word(&self) -> PageAccess;

    /// Store the first machine word. See [`MappedPage::load_word`].
    fn store_word(&self, value: usize) -> PageAccess;
}

/// An identifier for a live OS thread. Opaque beyond equality — never
/// reused for signalling purposes without first checking the registry
/// (§4.B's lifecycle contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsThreadId(pub u64);

pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

pub trait PlatformAdapter: Send + Sync {
    fn new_raw_mutex(&self) -> Box<dyn RawMutex>;
    fn new_raw_condvar(&self) -> Box<dyn RawCondvar>;

    /// Allocate a fresh page-sized, initially read-write mapping.
    fn new_mapped_page(&self, len: usize) -> Result<Box<dyn MappedPage>, RuntimeError>;

    /// Spawn an OS thread with `stack_size` bytes of stack and run `body` on
    /// it. Returns the child's id once it is known to have started (the
    /// child publishes its own id the way §3 describes: "Set by the child
    /// when it first runs").
    fn spawn(&self, stack_size: usize, body: ThreadBody) -> Result<OsThreadId, RuntimeError>;

    /// `pthread_kill`-equivalent. Returns `Ok(())` on delivery,
    /// `Err(RuntimeError::NoSuchThread)` if the target has already exited —
    /// never a hard error, per §7.
    fn kill(&self, target: OsThreadId, signal: i32) -> Result<(), RuntimeError>;

    fn current_thread_id(&self) -> OsThreadId;

    fn monotonic_now(&self) -> Instant;

    /// Block every deferrable signal on the calling thread, per §5's signal
    /// discipline; returns the previous mask so it can be restored.
    fn block_deferrable_signals(&self) -> SignalMask;
    fn restore_signal_mask(&self, mask: SignalMask);
}

bitflags::bitflags! {
    /// A snapshot of a blocked-signal set (§3 `blocked_signal_set`): which of
    /// the two deferrable signals §5's signal discipline blocks around a
    /// managed/foreign transition were already blocked beforehand. Handed
    /// back to [`PlatformAdapter::restore_signal_mask`] to restore the mask
    /// exactly as found rather than unconditionally unblocking everything.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SignalMask: u64 {
        const SIGUSR1 = 0b01;
        const SIGUSR2 = 0b10;
    }
}
