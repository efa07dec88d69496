//! Ambient diagnostics surface (SPEC_FULL §4.I).
//!
//! `search_read_only_space` / `search_static_space` / `search_dynamic_space`
//! (§6) are PC→function recovery for diagnostics, and explicitly out of this
//! core's scope beyond that use; [`Runtime::dump_threads`] is the
//! in-scope diagnostic surface this core does own.

use std::sync::atomic::Ordering;

use crate::runtime::Runtime;
use crate::thread_record::{GcSafepointContext, ThreadHandle, ThreadState};

/// A point-in-time, best-effort snapshot of one thread's coordination state.
/// Never used by the protocol itself — strictly for `tracing`/operator
/// consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub handle: ThreadHandle,
    pub state: ThreadState,
    pub csp: usize,
    pub gc_safepoint_context: GcSafepointContext,
    pub gc_safe: bool,
    pub gc_inhibited: bool,
    pub stop_for_gc_pending: bool,
    pub pending_signal_set: u64,
}

pub fn dump_threads(rt: &Runtime) -> Vec<ThreadSnapshot> {
    let mut snapshots = Vec::with_capacity(rt.registry.live_count());
    rt.registry.for_each(|rec| {
        snapshots.push(ThreadSnapshot {
            handle: rec.handle(),
            state: rec.state.get(),
            csp: rec.csp(),
            gc_safepoint_context: rec.gc_safepoint_context(),
            gc_safe: rec.gc_safe.get(),
            gc_inhibited: rec.gc_inhibited.load(Ordering::Acquire),
            stop_for_gc_pending: rec.stop_for_gc_pending.load(Ordering::Acquire),
            pending_signal_set: rec.pending_signal_set.load(Ordering::Acquire),
        });
    });
    snapshots
}
