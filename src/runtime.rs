//! §9's "single `Runtime` value" — the composition root this core is built
//! around. Initialisation order matches the redesign note: platform adapter
//! → registry → dispatcher → safepoint page → (signal handlers, owned by a
//! collaborator) → first thread.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use crate::config::RuntimeConfig;
use crate::coordinator::StwDispatcher;
use crate::platform::{OsThreadId, PlatformAdapter, SignalMask, ThreadBody};
use crate::postmortem::{PostMortemQueue, ResurrectionPool};
use crate::registry::Registry;
use crate::safepoint::SafepointPageManager;
use crate::thread_record::{GcSafepointContext, ThreadHandle, ThreadRecord, ThreadState};

pub struct Runtime {
    pub platform: Arc<dyn PlatformAdapter>,
    pub config: RuntimeConfig,
    pub registry: Registry,
    pub safepoint: SafepointPageManager,
    pub dispatcher: StwDispatcher,
    pub post_mortem: PostMortemQueue,
    pub resurrection: ResurrectionPool,
}

static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

thread_local! {
    static CURRENT_THREAD_HANDLE: Cell<Option<ThreadHandle>> = const { Cell::new(None) };
}

impl Runtime {
    /// Build a standalone `Runtime` with its own registry, dispatcher, and
    /// queues — not installed as the process-wide singleton. [`Runtime::init`]
    /// is the production entry point; this is for embedding more than one
    /// instance (or, as in this crate's own tests, many isolated instances
    /// within a single `cargo test` process where [`RUNTIME`]'s `OnceLock`
    /// could only ever be won once).
    pub fn new(platform: Arc<dyn PlatformAdapter>, config: RuntimeConfig) -> Self {
        let registry = Registry::new();
        let dispatcher = StwDispatcher::new(platform.as_ref());
        let safepoint = SafepointPageManager::new(platform.as_ref(), config.csp_page_size);
        let post_mortem = PostMortemQueue::new(config.post_mortem_drain_threshold);
        let resurrection =
            ResurrectionPool::new(platform.as_ref(), config.max_resurrectable_waiters, config.awakener_timeout);
        Runtime {
            platform,
            config,
            registry,
            safepoint,
            dispatcher,
            post_mortem,
            resurrection,
        }
    }

    /// Construct the single process-wide `Runtime` and install it as the
    /// global accessible via [`current`]/[`with_runtime`]. May only be
    /// called once per process.
    pub fn init(platform: Arc<dyn PlatformAdapter>, config: RuntimeConfig) -> Arc<Runtime> {
        let runtime = Arc::new(Runtime::new(platform, config));
        RUNTIME
            .set(runtime.clone())
            .unwrap_or_else(|_| crate::error::lose("Runtime::init called more than once"));
        runtime
    }

    /// §6's `create_initial_thread(fn)`: runs once, at startup, on the
    /// calling OS thread — it becomes the first managed thread and this
    /// function does not return.
    pub fn create_initial_thread(self: &Arc<Runtime>, f: ThreadBody) -> ! {
        let handle = self.registry.reserve();
        let record = Arc::new(ThreadRecord::new(handle, self.platform.as_ref(), self.config.csp_page_size));
        *record
            .no_tls_value_marker
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(f);
        trampoline_entry(self.clone(), record);
        std::process::exit(0);
    }

    /// §6's `create_thread(fn) -> os_thread_id`; `None` on spawn failure,
    /// matching the source's "free the prepared record and return 0".
    pub fn create_thread(self: &Arc<Runtime>, f: ThreadBody) -> Option<ThreadHandle> {
        let f = match self.resurrection.pop_for_reuse(&self.registry, f) {
            Ok(handle) => return Some(handle),
            Err(f) => f,
        };

        let handle = self.registry.reserve();
        let record = Arc::new(ThreadRecord::new(handle, self.platform.as_ref(), self.config.csp_page_size));
        *record
            .no_tls_value_marker
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(f);

        let runtime = self.clone();
        let record_for_thread = record.clone();
        // §5 signal discipline: deferrable signals are blocked on this
        // (parent) thread before the child is created, so the child inherits
        // the restrictive mask at birth; the parent's own mask is restored
        // right after, and the child lifts its own copy once it has
        // registered (`trampoline_entry`).
        let prior_mask = self.platform.block_deferrable_signals();
        let spawned = self.platform.spawn(
            self.config.thread_stack_size,
            Box::new(move || {
                trampoline_entry(runtime, record_for_thread);
            }),
        );
        self.platform.restore_signal_mask(prior_mask);

        match spawned {
            Ok(_os_id) => Some(handle),
            Err(e) => {
                tracing::warn!(target: "stw_core::runtime", error = %e, "create_thread: spawn failed");
                None
            }
        }
    }

    pub fn thread_yield(&self) {
        std::thread::yield_now();
    }

    /// The compiler-inserted safepoint check at a managed-code loop backedge
    /// (§2, §4.D). A no-op unless a stop is in progress.
    pub fn poll_safepoint(self: &Arc<Runtime>) {
        crate::foreign_call::poll_safepoint(self, current_thread_handle());
    }

    /// §6's `kill_safely`. Never a hard error: a target that has already
    /// exited is a no-op (§7's "expected transient" taxonomy).
    pub fn kill_safely(&self, target: ThreadHandle, signal: i32) -> bool {
        let Some(rec) = self.registry.get(target) else {
            return true;
        };
        if rec.state.get() == ThreadState::Dead {
            return true;
        }
        let Some(os_thread) = rec.os_thread.get().copied() else {
            return true;
        };
        match self.platform.kill(os_thread, signal) {
            Ok(()) => true,
            Err(crate::error::RuntimeError::NoSuchThread) => true,
            Err(e) => {
                tracing::error!(target: "stw_core::runtime", error = %e, "kill_safely failed");
                false
            }
        }
    }

    /// Called by the allocator when the current thread's consing has
    /// crossed a threshold (§6). This core only owns the STW side effect —
    /// the threshold policy itself belongs to the allocator.
    pub fn thread_register_gc_trigger(self: &Arc<Runtime>) {
        let handle = current_thread_handle();
        crate::coordinator::gc_stop_the_world(self, handle);
        crate::coordinator::gc_start_the_world(self, handle);
    }

    pub fn gc_stop_the_world(self: &Arc<Runtime>) {
        crate::coordinator::gc_stop_the_world(self, current_thread_handle());
    }

    pub fn gc_start_the_world(self: &Arc<Runtime>) {
        crate::coordinator::gc_start_the_world(self, current_thread_handle());
    }

    pub fn wake_thread(self: &Arc<Runtime>, target: ThreadHandle, signal_bit: u64) {
        crate::interrupt::wake_thread(self, target, signal_bit);
    }

    pub fn wake_the_world(self: &Arc<Runtime>) {
        crate::interrupt::wake_the_world(self, current_thread_handle());
    }

    pub fn dump_threads(&self) -> Vec<crate::diagnostics::ThreadSnapshot> {
        crate::diagnostics::dump_threads(self)
    }

    /// §6 `thread_in_lisp_raised(ctx)` — entry point from a trap while
    /// executing managed code (the safepoint-page fault). The real
    /// signal-handler dispatch table that routes here is out of scope
    /// (§1's non-goals); this is the post-condition it must establish.
    pub fn thread_in_lisp_raised(self: &Arc<Runtime>, ctx: usize) {
        let handle = current_thread_handle();
        let Some(rec) = self.registry.get(handle) else {
            return;
        };
        rec.set_gc_safepoint_context(GcSafepointContext::Context(ctx));
        crate::foreign_call::adjust_thread_state(&rec);
        rec.set_gc_safepoint_context(GcSafepointContext::NoContext);
    }

    /// §6 `thread_in_safety_transition(ctx)` — entry point from a trap
    /// during an `enter_foreign_call`/`leave_foreign_call` slow path.
    pub fn thread_in_safety_transition(self: &Arc<Runtime>, ctx: usize) {
        self.thread_in_lisp_raised(ctx);
    }

    /// §6 `thread_interrupted(ctx)` — entry point for an asynchronous
    /// interrupt delivered while the thread was already outside managed
    /// code.
    pub fn thread_interrupted(self: &Arc<Runtime>, _ctx: usize) {
        let handle = current_thread_handle();
        let Some(rec) = self.registry.get(handle) else {
            return;
        };
        crate::foreign_call::drain_pending_interrupts_and_gcs(self, &rec);
    }
}

/// Read the handle of whichever thread record this OS thread registered as.
///
/// # Panics (aborts)
/// Calls [`crate::error::lose`] if this OS thread never ran
/// [`trampoline_entry`] — every public entry point above is only meaningful
/// from inside a thread this core created.
pub fn current_thread_handle() -> ThreadHandle {
    CURRENT_THREAD_HANDLE
        .with(|cell| cell.get())
        .unwrap_or_else(|| crate::error::lose("current_thread_handle: no thread registered on this OS thread"))
}

pub fn current() -> Arc<Runtime> {
    RUNTIME
        .get()
        .cloned()
        .unwrap_or_else(|| crate::error::lose("Runtime::current called before Runtime::init"))
}

fn trampoline_entry(rt: Arc<Runtime>, record: Arc<ThreadRecord>) {
    let os_thread = rt.platform.current_thread_id();
    let _ = record.os_thread.set(os_thread);
    CURRENT_THREAD_HANDLE.with(|cell| cell.set(Some(record.handle())));
    rt.registry.register(record.clone());
    // The child inherited its creator's restrictive mask (§5); now that it
    // is registered and visible to the coordinator, it is ready to field
    // deferrable signals itself.
    rt.platform.restore_signal_mask(SignalMask::empty());
    trampoline_loop(&rt, record);
}

fn trampoline_loop(rt: &Arc<Runtime>, record: Arc<ThreadRecord>) {
    'outer: loop {
        let f = record
            .no_tls_value_marker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match f {
            Some(f) => f(),
            None => crate::error::lose("trampoline entered with no initial function"),
        }

        record.state.set(ThreadState::Dead);
        rt.registry.unregister(record.handle());

        match rt.resurrection.park(record.clone()) {
            Ok(is_awakener) => loop {
                if is_awakener {
                    rt.resurrection.awakener_wait(rt.platform.as_ref());
                } else {
                    rt.resurrection.non_awakener_wait();
                }
                match record.state.get() {
                    ThreadState::Suspended => break 'outer,
                    ThreadState::Running => {
                        // `pop_for_reuse` already reassigned and re-registered
                        // this record under a fresh handle; refresh the
                        // thread-local so `current_thread_handle` addresses
                        // the live identity rather than the retired one this
                        // OS thread started with.
                        CURRENT_THREAD_HANDLE.with(|cell| cell.set(Some(record.handle())));
                        record.reset_tls_slots();
                        continue 'outer;
                    }
                    _ => continue,
                }
            },
            Err(_) => {
                rt.post_mortem.push(record.clone());
                break 'outer;
            }
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::platform::fake::FakePlatform;

    /// Build a fresh, isolated `Runtime` (not the process-wide singleton —
    /// tests never call [`Runtime::init`], since `OnceLock` only allows one
    /// winner per process and `cargo test` runs many of these in parallel)
    /// with the calling OS thread already registered as its only thread.
    pub fn single_threaded_runtime() -> (Arc<Runtime>, ThreadHandle) {
        let platform = FakePlatform::new();
        let runtime = Arc::new(Runtime::new(platform, RuntimeConfig::default()));
        let handle = runtime.registry.reserve();
        let record = Arc::new(ThreadRecord::new(
            handle,
            runtime.platform.as_ref(),
            runtime.config.csp_page_size,
        ));
        let os_thread = runtime.platform.current_thread_id();
        let _ = record.os_thread.set(os_thread);
        runtime.registry.register(record);
        CURRENT_THREAD_HANDLE.with(|cell| cell.set(Some(handle)));
        (runtime, handle)
    }
}
