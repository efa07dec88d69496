//! §3 Data Model: the thread record and the small cells it is built from.
//!
//! Per §9's "arena of handles" redesign, a thread is addressed by a dense,
//! generation-checked [`ThreadHandle`] rather than a raw pointer; the record
//! itself holds no `prev`/`next` pointers back into the registry (see
//! [`crate::registry`] for where those live now).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

use crate::platform::{MappedPage, OsThreadId, PlatformAdapter, RawMutex, SignalMask, ThreadBody};

/// Number of per-thread TLS slots ("per-thread dynamic values", §3). The
/// original source sizes this from the number of thread-local symbols known
/// to the compiler; absent that table this core just picks a fixed budget.
pub const TLS_SLOT_COUNT: usize = 64;
static_assertions::const_assert!(TLS_SLOT_COUNT > 0);

/// Sentinel written into a TLS slot (and into `no_tls_value_marker` between
/// uses) that the original source encodes as a reserved machine word.
pub const TLS_UNBOUND_MARKER: usize = usize::MAX;

/// A dense, generation-checked reference to a [`ThreadRecord`] inside the
/// registry's arena. Stable across the record's lifetime; becomes invalid
/// (fails a generation check) once the slot is reused by a later thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Atomic storage for a record's own [`ThreadHandle`], packed into one
/// `u64` (`index` in the high word, `generation` in the low word). A plain
/// field would make [`ThreadRecord`] `!Sync`, and the coordinator reads
/// `handle` from threads other than the one it names while sweeping the
/// registry; this also has to be mutable, since a resurrected record is
/// reassigned to a freshly reserved handle each time the resurrection pool
/// hands it to a new `create_thread` caller (§4.H).
struct HandleCell(AtomicU64);

impl HandleCell {
    fn new(handle: ThreadHandle) -> Self {
        HandleCell(AtomicU64::new(Self::pack(handle)))
    }

    fn get(&self) -> ThreadHandle {
        Self::unpack(self.0.load(Ordering::Acquire))
    }

    fn set(&self, handle: ThreadHandle) {
        self.0.store(Self::pack(handle), Ordering::Release);
    }

    fn pack(handle: ThreadHandle) -> u64 {
        ((handle.index as u64) << 32) | handle.generation as u64
    }

    fn unpack(bits: u64) -> ThreadHandle {
        ThreadHandle {
            index: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

/// §3's seven-state machine. `Dead` covers both "about to exit" and "parked
/// for resurrection" — the two are distinguished by which list the record is
/// on, not by a further substate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Phase1Blocker,
    Phase2Blocker,
    InterruptBlocker,
    SuspendedBriefly,
    Suspended,
    Dead,
}

/// §9's tagged replacement for the `gc_safepoint_context == -1` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcSafepointContext {
    /// No signal/exception context is current.
    NoContext,
    /// `leave_foreign_call` has cleared the context but not yet reached the
    /// point where the coordinator may safely adjust this thread's state.
    InTransition,
    /// An OS signal/exception context is live, addressed opaquely (the
    /// context itself is out of this core's scope per §1's non-goals).
    Context(usize),
}

/// Lock-free storage for [`GcSafepointContext`], since `leave_foreign_call`'s
/// fast path sets and reads it without taking `state_lock` (§4.E).
#[derive(Debug)]
struct GcSafepointContextCell {
    tag: AtomicU8,
    ptr: AtomicUsize,
}

const TAG_NO_CONTEXT: u8 = 0;
const TAG_IN_TRANSITION: u8 = 1;
const TAG_CONTEXT: u8 = 2;

impl GcSafepointContextCell {
    fn new() -> Self {
        GcSafepointContextCell {
            tag: AtomicU8::new(TAG_NO_CONTEXT),
            ptr: AtomicUsize::new(0),
        }
    }

    fn get(&self) -> GcSafepointContext {
        match self.tag.load(Ordering::Acquire) {
            TAG_NO_CONTEXT => GcSafepointContext::NoContext,
            TAG_IN_TRANSITION => GcSafepointContext::InTransition,
            _ => GcSafepointContext::Context(self.ptr.load(Ordering::Acquire)),
        }
    }

    fn set(&self, value: GcSafepointContext) {
        match value {
            GcSafepointContext::NoContext => {
                self.tag.store(TAG_NO_CONTEXT, Ordering::Release);
            }
            GcSafepointContext::InTransition => {
                self.tag.store(TAG_IN_TRANSITION, Ordering::Release);
            }
            GcSafepointContext::Context(ptr) => {
                self.ptr.store(ptr, Ordering::Release);
                self.tag.store(TAG_CONTEXT, Ordering::Release);
            }
        }
    }
}

/// `state` plus `state_lock` plus `state_cond`, bundled: every transition in
/// §4.C takes the lock, mutates, and broadcasts in one step.
pub struct StateCell {
    state: Mutex<ThreadState>,
    cond: Condvar,
}

impl StateCell {
    fn new(initial: ThreadState) -> Self {
        StateCell {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> ThreadState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Unconditional transition: set `new`, broadcast `state_cond`.
    pub fn set(&self, new: ThreadState) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *guard = new;
        self.cond.notify_all();
    }

    /// Transition only if the current state is `expected`; returns whether it
    /// applied. Used by the coordinator so it never clobbers a state a thread
    /// has since changed on its own (e.g. raced past Dead).
    pub fn compare_set(&self, expected: ThreadState, new: ThreadState) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == expected {
            *guard = new;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Block until the predicate holds, re-checking on every broadcast —
    /// "all waits loop over the condition variable" (§4.C).
    pub fn wait_until(&self, mut predicate: impl FnMut(ThreadState) -> bool) -> ThreadState {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !predicate(*guard) {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        *guard
    }
}

/// A boolean the coordinator waits on without spinning — used for `GC_SAFE`,
/// which Phase 2 (§4.F) blocks on per thread ("wait for final parking").
pub struct FlagCell {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl FlagCell {
    fn new(initial: bool) -> Self {
        FlagCell {
            flag: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> bool {
        *self.flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, value: bool) {
        let mut guard = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        *guard = value;
        self.cond.notify_all();
    }

    pub fn wait_until_true(&self) {
        let mut guard = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        while !*guard {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Owning handles for OS-level resources released at post-mortem time.
///
/// The real adapter (`UnixPlatform`) delegates thread and stack creation
/// entirely to `std::thread::Builder`, which has no separate "attr" object
/// and owns its stack allocation internally; these are therefore markers
/// whose only job is to document, at the type level, that post-mortem
/// cleanup is the place that would release them on a platform that does
/// expose separate handles.
#[derive(Debug, Default)]
pub struct OsThreadAttr;

#[derive(Debug, Default)]
pub struct OsAddress;

/// §3's thread record. One per live or parked OS thread.
pub struct ThreadRecord {
    handle: HandleCell,

    /// Set by the child when it first runs; absent until then.
    pub os_thread: OnceLock<OsThreadId>,

    pub state: StateCell,

    /// The quickly-revocable lock: held by this thread whenever it is in
    /// managed code, released on every foreign-call transition. Lock and
    /// unlock happen from different threads during STW rendezvous, which is
    /// exactly the case `std::sync::Mutex`'s guard forbids — see
    /// [`crate::platform::RawMutex`].
    pub qrl: Box<dyn RawMutex>,

    /// The dedicated VM page backing `csp_around_foreign_call`. Zero means
    /// "in managed code"; the page's protection level doubles as a lock on
    /// that fact for the coordinator (§4.D).
    pub csp_page: Box<dyn MappedPage>,

    pub pc_around_foreign_call: AtomicUsize,

    gc_safepoint_context: GcSafepointContextCell,

    /// Carries the initial (or, after resurrection, the next) function from
    /// spawn/parking through to the trampoline loop.
    pub no_tls_value_marker: Mutex<Option<ThreadBody>>,

    tls_slots: Vec<AtomicUsize>,

    pub pending_signal_set: AtomicU64,
    pub blocked_signal_set: Mutex<SignalMask>,

    pub interrupt_data: Mutex<Option<Box<dyn std::any::Any + Send + Sync>>>,

    pub os_attr: OsThreadAttr,
    pub os_address: OsAddress,

    /// Set true by Phase 1/Phase 2 once the coordinator has observed this
    /// thread reach a GC-safe point.
    pub gc_safe: FlagCell,
    /// Set when a full-GC stop found this thread GC-inhibited while in
    /// foreign code: its CSP page stays writable, and it must trap on
    /// `leave_foreign_call` instead of being treated as already safe.
    pub stop_for_gc_pending: AtomicBool,
    /// True while this thread is executing inside a GC-inhibited region (a
    /// sub-collection it triggered itself).
    pub gc_inhibited: AtomicBool,
}

impl ThreadRecord {
    pub fn new(handle: ThreadHandle, platform: &dyn PlatformAdapter, csp_page_size: usize) -> Self {
        let csp_page = platform
            .new_mapped_page(csp_page_size)
            .unwrap_or_else(|e| crate::error::lose(&format!("failed to map CSP page: {e}")));
        // csp_around_foreign_call starts at zero: the thread begins in
        // managed code.
        csp_page.store_word(0);

        let qrl = platform.new_raw_mutex();
        // Invariant 3 (§3): qrl is held by the thread exactly when it is in
        // managed code. A fresh record starts there, so it starts holding
        // its own qrl — released on the first `enter_foreign_call`.
        qrl.lock();

        ThreadRecord {
            handle: HandleCell::new(handle),
            os_thread: OnceLock::new(),
            state: StateCell::new(ThreadState::Running),
            qrl,
            csp_page,
            pc_around_foreign_call: AtomicUsize::new(0),
            gc_safepoint_context: GcSafepointContextCell::new(),
            no_tls_value_marker: Mutex::new(None),
            tls_slots: (0..TLS_SLOT_COUNT)
                .map(|_| AtomicUsize::new(TLS_UNBOUND_MARKER))
                .collect(),
            pending_signal_set: AtomicU64::new(0),
            blocked_signal_set: Mutex::new(SignalMask::default()),
            interrupt_data: Mutex::new(None),
            os_attr: OsThreadAttr,
            os_address: OsAddress,
            gc_safe: FlagCell::new(false),
            stop_for_gc_pending: AtomicBool::new(false),
            gc_inhibited: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle.get()
    }

    /// Reassign this record to a freshly reserved handle. Called only by
    /// [`crate::postmortem::ResurrectionPool::pop_for_reuse`] before the
    /// record is re-registered under its new identity (§4.H).
    pub(crate) fn set_handle(&self, handle: ThreadHandle) {
        self.handle.set(handle);
    }

    pub fn gc_safepoint_context(&self) -> GcSafepointContext {
        self.gc_safepoint_context.get()
    }

    pub fn set_gc_safepoint_context(&self, value: GcSafepointContext) {
        self.gc_safepoint_context.set(value);
    }

    /// The CSP value currently published on the per-thread page: zero iff
    /// this thread is considered in managed code (invariant 2, §3).
    pub fn csp(&self) -> usize {
        match self.csp_page.load_word() {
            crate::platform::PageAccess::Ok(v) => v,
            crate::platform::PageAccess::WouldFault => 0,
        }
    }

    pub fn is_in_managed_code(&self) -> bool {
        self.csp() == 0
    }

    pub fn tls_slot(&self, index: usize) -> usize {
        self.tls_slots[index].load(Ordering::Acquire)
    }

    pub fn set_tls_slot(&self, index: usize, value: usize) {
        self.tls_slots[index].store(value, Ordering::Release);
    }

    /// Reset every TLS slot to the unbound marker. Run on a resurrected
    /// thread before it picks up its new initial function (§4.H step 6).
    pub fn reset_tls_slots(&self) {
        for slot in &self.tls_slots {
            slot.store(TLS_UNBOUND_MARKER, Ordering::Release);
        }
    }
}
