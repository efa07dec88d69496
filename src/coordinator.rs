//! §4.F STW Coordinator.
//!
//! The two-phase stop protocol, nested-stop accounting, and the priority
//! sub-GC handoff. This is the component the spec budgets the largest share
//! of effort to, and it is the one place in the core where four different
//! locks must be taken in a fixed order to avoid deadlock:
//! `mx_gp_transition` → `mx_gcing` → `mx_gp_unmapped`, with `mx_subgc` used
//! independently for the sub-collection handoff.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::platform::{PlatformAdapter, RawMutex};
use crate::runtime::Runtime;
use crate::thread_record::{ThreadHandle, ThreadState};

struct DispatcherState {
    initiator: Option<ThreadHandle>,
    sub_gc_thread: Option<ThreadHandle>,
    stop_count: u32,
    interrupt_only: bool,
}

/// §3's STW Dispatcher: four mutexes plus the bookkeeping they protect.
pub struct StwDispatcher {
    mx_gp_transition: Box<dyn RawMutex>,
    mx_gp_unmapped: Box<dyn RawMutex>,
    mx_gcing: Box<dyn RawMutex>,
    mx_subgc: Box<dyn RawMutex>,
    state: Mutex<DispatcherState>,
}

impl StwDispatcher {
    pub fn new(platform: &dyn PlatformAdapter) -> Self {
        StwDispatcher {
            mx_gp_transition: platform.new_raw_mutex(),
            mx_gp_unmapped: platform.new_raw_mutex(),
            mx_gcing: platform.new_raw_mutex(),
            mx_subgc: platform.new_raw_mutex(),
            state: Mutex::new(DispatcherState {
                initiator: None,
                sub_gc_thread: None,
                stop_count: 0,
                interrupt_only: false,
            }),
        }
    }

    pub fn current_initiator(&self) -> Option<ThreadHandle> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).initiator
    }

    pub fn stop_count(&self) -> u32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).stop_count
    }

    pub fn is_interrupt_only(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).interrupt_only
    }

    /// Wait for the current stop to release `mx_gcing`, then return — used
    /// by threads retrying [`maybe_become_initiator`] after losing the race.
    /// The mutex itself is the wait primitive: the initiator holds
    /// `mx_gcing` for its whole stop cycle, so `lock()` blocks exactly as
    /// long as a fresh caller needs to.
    fn wait_for_gcing_released(&self) {
        self.mx_gcing.lock();
        self.mx_gcing.unlock();
    }
}

/// §4.F `maybe_become_initiator`. Double-checked: idempotent within a single
/// stop-restart cycle (§8's transition-idempotence law) because a caller who
/// already is the initiator short-circuits at the first check.
pub fn maybe_become_initiator(rt: &Runtime, caller: ThreadHandle, interrupt_only: bool) -> bool {
    if rt.dispatcher.current_initiator() == Some(caller) {
        return true;
    }
    if rt.dispatcher.current_initiator().is_some() {
        return false;
    }

    rt.dispatcher.mx_gp_transition.lock();
    let became_initiator = {
        let mut state = rt.dispatcher.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.initiator.is_none() {
            state.initiator = Some(caller);
            state.interrupt_only = interrupt_only;
            state.stop_count = 0;
            true
        } else {
            false
        }
    };
    if became_initiator {
        rt.dispatcher.mx_gcing.lock();
        rt.dispatcher.mx_gp_unmapped.lock();
        rt.safepoint.unmap_safepoint_page();
    }
    rt.dispatcher.mx_gp_transition.unlock();
    became_initiator
}

/// Clear the initiator slot and release `mx_gcing`, freeing anyone retrying
/// [`maybe_become_initiator`]. Shared by [`gc_start_the_world`] and
/// [`crate::interrupt::wake_the_world`], whose interrupt-only stop has no
/// Phase 2 of its own to call this from.
/// Release `mx_gp_unmapped` after remapping the safepoint page, for stops
/// that have no `phase_one` of their own to do it (currently only
/// [`crate::interrupt::wake_the_world`]'s interrupt-only round).
pub(crate) fn release_gp_unmapped(rt: &Runtime) {
    rt.dispatcher.mx_gp_unmapped.unlock();
}

pub(crate) fn let_the_world_go(rt: &Runtime) {
    {
        let mut state = rt.dispatcher.state.lock().unwrap_or_else(|e| e.into_inner());
        state.initiator = None;
        state.sub_gc_thread = None;
        state.interrupt_only = false;
    }
    rt.dispatcher.mx_gcing.unlock();
}

/// §4.F `gc_stop_the_world`.
pub fn gc_stop_the_world(rt: &Runtime, caller: ThreadHandle) {
    let caller_record = rt
        .registry
        .get(caller)
        .unwrap_or_else(|| crate::error::lose("gc_stop_the_world: caller is not registered"));

    if !caller_record.gc_inhibited.load(Ordering::Acquire) {
        while !maybe_become_initiator(rt, caller, false) {
            rt.dispatcher.wait_for_gcing_released();
        }
    } else {
        let interrupt_in_progress =
            rt.dispatcher.current_initiator().is_some() && rt.dispatcher.is_interrupt_only();
        if interrupt_in_progress {
            rt.dispatcher.wait_for_gcing_released();
            while !maybe_become_initiator(rt, caller, false) {
                rt.dispatcher.wait_for_gcing_released();
            }
        } else {
            // Sub-GC: register under mx_subgc, bump the stop counter,
            // release our own qrl (we are leaving managed code to run a
            // nested collection), then block on the initiator's qrl until
            // it has finished stopping the world.
            rt.dispatcher.mx_subgc.lock();
            {
                let mut state = rt.dispatcher.state.lock().unwrap_or_else(|e| e.into_inner());
                state.sub_gc_thread = Some(caller);
                state.stop_count += 1;
            }
            // Phase 1 never marks an inhibited thread GC_SAFE on its own
            // (it cannot know the thread is about to rendezvous); this call
            // is that rendezvous, so mark it here before releasing the qrl
            // Phase 1 is waiting on.
            caller_record.gc_safe.set(true);
            caller_record.qrl.unlock();
            let initiator = rt
                .dispatcher
                .current_initiator()
                .unwrap_or_else(|| crate::error::lose("sub-GC entered with no initiator installed"));
            let initiator_record = rt
                .registry
                .get(initiator)
                .unwrap_or_else(|| crate::error::lose("STW initiator vanished from the registry"));
            initiator_record.qrl.lock();
            rt.dispatcher.mx_subgc.unlock();
            return;
        }
    }

    let first_entry = {
        let mut state = rt.dispatcher.state.lock().unwrap_or_else(|e| e.into_inner());
        let was_zero = state.stop_count == 0;
        state.stop_count += 1;
        was_zero
    };
    if !first_entry {
        // Nested call from the initiator (or its sub-GC): identity on every
        // other thread's state, per the balanced-stop law.
        return;
    }

    phase_one(rt, caller);
    phase_two(rt, caller);
}

fn phase_one(rt: &Runtime, initiator: ThreadHandle) {
    let full_gc = !rt.dispatcher.is_interrupt_only();
    rt.registry.for_each(|rec| {
        if rec.handle() == initiator || rec.state.get() == ThreadState::Dead {
            return;
        }
        let was_in_foreign_code = rt.safepoint.set_csp_access(rec, false);
        if was_in_foreign_code {
            // Already parked outside managed memory; the conservative CSP
            // is enough for the collector to scan this thread's stack.
            rec.gc_safe.set(true);
            if full_gc && rec.gc_inhibited.load(Ordering::Acquire) {
                rec.stop_for_gc_pending.store(true, Ordering::Release);
                rt.safepoint.set_csp_access(rec, true);
            }
        } else {
            // In managed code: the read-protected CSP page (entering a
            // foreign call) or the unmapped safepoint page (a poll in the
            // managed hot loop) will trap this thread into its slow path,
            // which releases its qrl as part of the transition. Mark it a
            // Phase-1 blocker first so that trap's `adjust_thread_state`
            // has something to convert. Block here until that happens.
            rec.state.compare_set(ThreadState::Running, ThreadState::Phase1Blocker);
            rec.qrl.lock();
            if !rec.gc_inhibited.load(Ordering::Acquire) {
                rec.gc_safe.set(true);
            }
            rec.qrl.unlock();
        }
    });
    rt.safepoint.map_safepoint_page();
    rt.dispatcher.mx_gp_unmapped.unlock();
}

fn phase_two(rt: &Runtime, initiator: ThreadHandle) {
    let initiator_record = rt
        .registry
        .get(initiator)
        .unwrap_or_else(|| crate::error::lose("phase_two: initiator vanished"));

    let mut inhibited = Vec::new();
    rt.registry.for_each(|rec| {
        if rec.handle() == initiator || rec.state.get() == ThreadState::Dead {
            return;
        }
        rec.gc_safe.wait_until_true();
        if rec.gc_inhibited.load(Ordering::Acquire) {
            inhibited.push(rec.handle());
        }
    });

    if inhibited.len() == 1 {
        // Priority sub-GC: hand it a turn.
        initiator_record.qrl.unlock();
        rt.dispatcher.mx_subgc.lock();
        initiator_record.qrl.lock();
        rt.dispatcher.mx_subgc.unlock();
    }
}

/// §4.F `gc_start_the_world`. Symmetric to [`gc_stop_the_world`]: only the
/// call that brings the stop counter back to zero performs the global step.
pub fn gc_start_the_world(rt: &Runtime, caller: ThreadHandle) {
    let (is_outermost, was_sub_gc) = {
        let mut state = rt.dispatcher.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.stop_count == 0 {
            crate::error::lose("gc_start_the_world called with no matching gc_stop_the_world");
        }
        state.stop_count -= 1;
        let was_sub_gc = state.sub_gc_thread == Some(caller);
        if was_sub_gc {
            state.sub_gc_thread = None;
        }
        (state.stop_count == 0, was_sub_gc)
    };

    if was_sub_gc {
        // Hand the initiator's qrl back, ending the Phase-2 handoff, and
        // reacquire our own qrl before returning to managed code.
        if let Some(initiator) = rt.dispatcher.current_initiator() {
            if let Some(initiator_record) = rt.registry.get(initiator) {
                initiator_record.qrl.unlock();
            }
        }
        if let Some(rec) = rt.registry.get(caller) {
            rec.gc_safe.set(false);
            rec.qrl.lock();
        }
        return;
    }

    if !is_outermost {
        return;
    }

    rt.registry.for_each(|rec| {
        if rec.handle() == caller || rec.state.get() == ThreadState::Dead {
            return;
        }
        rec.stop_for_gc_pending.store(false, Ordering::Release);
        rec.gc_safe.set(false);
        rt.safepoint.set_csp_access(rec, true);
        if rec.state.compare_set(ThreadState::Suspended, ThreadState::Running)
            || rec.state.compare_set(ThreadState::SuspendedBriefly, ThreadState::Running)
        {
            // Woken threads notice via state_cond in their own wait loop.
        }
    });

    let_the_world_go(rt);
}
