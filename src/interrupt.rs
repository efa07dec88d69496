//! §4.G Interrupt Delivery.
//!
//! `wake_the_world` is Phase 1 of the STW protocol with no Phase 2: threads
//! with a pending signal are briefly parked and then immediately let go,
//! rather than held for a collection.

use std::sync::atomic::Ordering;

use crate::coordinator::{let_the_world_go, maybe_become_initiator, release_gp_unmapped};
use crate::runtime::Runtime;
use crate::thread_record::{ThreadHandle, ThreadState};

/// Mark `target`'s pending-signal bit. The coordinator delivers it either on
/// the next [`wake_the_world`] round or as part of whatever stop is already
/// in flight.
pub fn wake_thread(rt: &Runtime, target: ThreadHandle, signal_bit: u64) {
    if let Some(rec) = rt.registry.get(target) {
        rec.pending_signal_set.fetch_or(signal_bit, Ordering::AcqRel);
    }
}

/// §4.G `wake_the_world`: deliver every thread's pending interrupts without
/// running a full GC.
pub fn wake_the_world(rt: &Runtime, caller: ThreadHandle) {
    // "Try-lock the world lock; if the current stop is already in progress,
    // just return" — the in-flight stop's own Phase 1/Phase 2 will observe
    // pending_signal_set when it releases each thread.
    if rt.dispatcher.current_initiator().is_some() {
        return;
    }

    if !maybe_become_initiator(rt, caller, true) {
        return;
    }

    rt.registry.for_each(|rec| {
        if rec.handle() == caller || rec.state.get() == ThreadState::Dead {
            return;
        }
        let has_pending_signal = rec.pending_signal_set.load(Ordering::Acquire) != 0;
        let has_pending_gc = rec.stop_for_gc_pending.load(Ordering::Acquire);
        if has_pending_signal && !has_pending_gc {
            rec.state.compare_set(ThreadState::Running, ThreadState::InterruptBlocker);
        }
    });

    rt.registry.for_each(|rec| {
        if rec.handle() == caller {
            return;
        }
        rec.state.compare_set(ThreadState::InterruptBlocker, ThreadState::SuspendedBriefly);
    });

    rt.safepoint.map_safepoint_page();
    release_gp_unmapped(rt);

    // Unlike a full GC stop, nothing else is going to come back through and
    // wake these threads — this round has no Phase 2 of its own. Convert
    // `SuspendedBriefly`/`InterruptBlocker` back to `Running` here,
    // broadcasting `state_cond` so whichever thread is blocked in
    // `accept_thread_state` (`foreign_call.rs`) notices and resumes — it
    // runs its own pending-interrupt dispatch from there, the same as it
    // would coming out of a full GC stop.
    rt.registry.for_each(|rec| {
        if rec.handle() == caller || rec.state.get() == ThreadState::Dead {
            return;
        }
        rec.state.compare_set(ThreadState::SuspendedBriefly, ThreadState::Running);
        rec.state.compare_set(ThreadState::InterruptBlocker, ThreadState::Running);
    });

    let_the_world_go(rt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::single_threaded_runtime;
    use crate::thread_record::ThreadRecord;
    use std::sync::Arc;

    #[test]
    fn wake_thread_sets_pending_bit() {
        let (rt, _a) = single_threaded_runtime();
        let b_handle = rt.registry.reserve();
        let b_record = Arc::new(ThreadRecord::new(b_handle, rt.platform.as_ref(), rt.config.csp_page_size));
        rt.registry.register(b_record);

        wake_thread(&rt, b_handle, 1);
        let rec = rt.registry.get(b_handle).unwrap();
        assert_ne!(rec.pending_signal_set.load(Ordering::Acquire), 0);
    }
}
