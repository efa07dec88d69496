//! §4.E Foreign-Call Transition.
//!
//! `enter_foreign_call`/`leave_foreign_call` are the hot path: most calls
//! take the fast branch and never touch `state_lock`. Ordering is
//! deliberately stronger here than the source, which only promises this on
//! "strongly-ordered architectures" and flags weaker ones for an upgrade to
//! explicit acquire/release (§5) — this port always pays for the fence.

use std::sync::atomic::Ordering;

use crate::platform::PageAccess;
use crate::runtime::Runtime;
use crate::thread_record::{GcSafepointContext, ThreadHandle, ThreadRecord, ThreadState};

/// §4.E `enter_foreign_call(csp, pc)`.
pub fn enter_foreign_call(rt: &Runtime, thread: ThreadHandle, csp: usize, pc: usize) {
    let rec = rt
        .registry
        .get(thread)
        .unwrap_or_else(|| crate::error::lose("enter_foreign_call: thread not registered"));

    rec.pc_around_foreign_call.store(pc, Ordering::Release);
    // The store fence the source relies on; explicit here rather than
    // assumed from program order on x86.
    std::sync::atomic::fence(Ordering::Release);
    let store_result = rec.csp_page.store_word(csp);

    // This is the edge the coordinator's Phase 1 waits on: releasing `qrl`
    // here is what "this thread has left managed code" means (invariant 3,
    // §3). It happens on both the fast and slow paths.
    rec.qrl.unlock();

    let inhibited_phase2_blocker =
        rec.state.get() == ThreadState::Phase2Blocker && rec.gc_inhibited.load(Ordering::Acquire);

    if store_result == PageAccess::Ok(csp)
        && rec.gc_safepoint_context() != GcSafepointContext::InTransition
        && !inhibited_phase2_blocker
    {
        return;
    }

    enter_foreign_call_slow(rt, &rec, csp, pc);
}

fn enter_foreign_call_slow(rt: &Runtime, rec: &ThreadRecord, csp: usize, pc: usize) {
    // Publish csp/pc, then convert any coordinator-scheduled blocker state
    // into the matching Suspended state. `adjust_thread_state` takes
    // `state_lock` itself via `StateCell::compare_set`.
    rec.csp_page.store_word(csp);
    rec.pc_around_foreign_call.store(pc, Ordering::Release);

    adjust_thread_state(rec);

    // There is no separate "wake the coordinator" signal to raise: Phase
    // 1/Phase 2 learn this thread has transitioned by blocking on its own
    // `qrl` (released below by its caller's managed-code entry point) and
    // by polling `gc_safe`, rather than a shared blocker counter.
    let _ = rt;
}

/// Convert `Phase1Blocker`/`Phase2Blocker`/`InterruptBlocker` into the
/// matching suspended state. Returns whether a conversion happened.
///
/// Also called directly from [`crate::runtime::thread_in_lisp_raised`] and
/// [`crate::runtime::thread_in_safety_transition`] — the post-conditions §6
/// requires of the signal/exception entry points are exactly this
/// conversion, whatever dispatch table got them here.
pub(crate) fn adjust_thread_state(rec: &ThreadRecord) -> bool {
    rec.state.compare_set(ThreadState::Phase1Blocker, ThreadState::Suspended)
        || rec.state.compare_set(ThreadState::InterruptBlocker, ThreadState::SuspendedBriefly)
        || (rec.gc_inhibited.load(Ordering::Acquire)
            && rec.state.get() == ThreadState::Phase2Blocker)
        || rec.state.compare_set(ThreadState::Phase2Blocker, ThreadState::Suspended)
}

/// §4.E `leave_foreign_call()`.
pub fn leave_foreign_call(rt: &Runtime, thread: ThreadHandle) {
    let rec = rt
        .registry
        .get(thread)
        .unwrap_or_else(|| crate::error::lose("leave_foreign_call: thread not registered"));

    // Tell the coordinator "do not adjust me right now" while we are
    // mid-transition.
    rec.set_gc_safepoint_context(GcSafepointContext::InTransition);

    let poll_result = rt.safepoint.poll();
    let stop_in_progress = poll_result == PageAccess::WouldFault || rt.safepoint.is_unmapped();

    if !stop_in_progress {
        rec.csp_page.store_word(0);
        rec.pc_around_foreign_call.store(0, Ordering::Release);
        rec.set_gc_safepoint_context(GcSafepointContext::NoContext);
        rec.qrl.lock();
        return;
    }

    leave_foreign_call_slow(rt, &rec);
}

fn leave_foreign_call_slow(rt: &Runtime, rec: &ThreadRecord) {
    rec.state.wait_until(|s| {
        matches!(
            s,
            ThreadState::Running | ThreadState::Suspended | ThreadState::SuspendedBriefly
        )
    });
    accept_thread_state(rec);

    rec.csp_page.store_word(0);
    rec.pc_around_foreign_call.store(0, Ordering::Release);
    rec.set_gc_safepoint_context(GcSafepointContext::NoContext);

    rec.qrl.lock();

    drain_pending_interrupts_and_gcs(rt, rec);
}

/// The load a managed-code loop backedge performs on every iteration (§2,
/// §4.D): cheap when no stop is in progress, a trap into the slow path once
/// the coordinator has unmapped the safepoint page.
pub fn poll_safepoint(rt: &Runtime, thread: ThreadHandle) {
    let rec = rt
        .registry
        .get(thread)
        .unwrap_or_else(|| crate::error::lose("poll_safepoint: thread not registered"));

    if rt.safepoint.poll() == PageAccess::Ok(0) {
        return;
    }

    poll_safepoint_slow(rt, &rec);
}

fn poll_safepoint_slow(rt: &Runtime, rec: &ThreadRecord) {
    // We are still in managed code — unlike `enter_foreign_call`, nobody
    // has released our qrl yet. Releasing it here is what lets Phase 1's
    // wait on it (coordinator.rs) complete.
    rec.qrl.unlock();
    adjust_thread_state(rec);
    accept_thread_state(rec);
    rec.qrl.lock();
    drain_pending_interrupts_and_gcs(rt, rec);
}

/// Accept whatever state the coordinator has parked this thread in —
/// `Suspended`/`SuspendedBriefly` — blocking on `state_cond` until the
/// coordinator moves it back to `Running`.
fn accept_thread_state(rec: &ThreadRecord) {
    rec.state.wait_until(|s| s == ThreadState::Running);
}

pub(crate) fn drain_pending_interrupts_and_gcs(rt: &Runtime, rec: &ThreadRecord) {
    if rec.pending_signal_set.swap(0, Ordering::AcqRel) != 0 {
        tracing::debug!(target: "stw_core::interrupt", handle = ?rec.handle(), "draining pending interrupt on foreign-call exit");
    }
    if rec.stop_for_gc_pending.load(Ordering::Acquire) {
        crate::coordinator::gc_stop_the_world(rt, rec.handle());
        crate::coordinator::gc_start_the_world(rt, rec.handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::single_threaded_runtime;

    #[test]
    fn round_trip_with_no_intervening_stop_restores_zero_slots() {
        let (rt, handle) = single_threaded_runtime();
        enter_foreign_call(&rt, handle, 0x7fff_0000, 0x4010_00);
        leave_foreign_call(&rt, handle);

        let rec = rt.registry.get(handle).unwrap();
        assert_eq!(rec.csp(), 0);
        assert_eq!(rec.pc_around_foreign_call.load(Ordering::Acquire), 0);
        assert_eq!(rec.gc_safepoint_context(), GcSafepointContext::NoContext);
    }
}
