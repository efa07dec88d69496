//! End-to-end coverage of the six stop-the-world scenarios.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use stw_core::config::RuntimeConfig;
use stw_core::coordinator::{gc_start_the_world, gc_stop_the_world};
use stw_core::foreign_call::{enter_foreign_call, poll_safepoint};
use stw_core::interrupt::{wake_the_world, wake_thread};
use stw_core::platform::fake::FakePlatform;
use stw_core::platform::Protection;
use stw_core::runtime::Runtime;
use stw_core::thread_record::{ThreadRecord, ThreadState};

fn spawn_two_thread_runtime() -> (Arc<Runtime>, stw_core::ThreadHandle, stw_core::ThreadHandle) {
    let platform = FakePlatform::new();
    let runtime = Arc::new(Runtime::new(platform, RuntimeConfig::default()));

    let a_handle = runtime.registry.reserve();
    let a_record = Arc::new(ThreadRecord::new(
        a_handle,
        runtime.platform.as_ref(),
        runtime.config.csp_page_size,
    ));
    runtime.registry.register(a_record);

    let b_handle = runtime.registry.reserve();
    let b_record = Arc::new(ThreadRecord::new(
        b_handle,
        runtime.platform.as_ref(),
        runtime.config.csp_page_size,
    ));
    runtime.registry.register(b_record);

    (runtime, a_handle, b_handle)
}

#[test]
fn single_threaded_gc_round_trip_touches_nothing_else() {
    let platform = FakePlatform::new();
    let runtime = Arc::new(Runtime::new(platform, RuntimeConfig::default()));
    let solo = runtime.registry.reserve();
    let solo_record = Arc::new(ThreadRecord::new(
        solo,
        runtime.platform.as_ref(),
        runtime.config.csp_page_size,
    ));
    runtime.registry.register(solo_record);

    assert_eq!(runtime.dispatcher.stop_count(), 0);
    gc_stop_the_world(&runtime, solo);
    assert_eq!(runtime.dispatcher.stop_count(), 1);
    gc_start_the_world(&runtime, solo);
    assert_eq!(runtime.dispatcher.stop_count(), 0);
    assert!(runtime.dispatcher.current_initiator().is_none());
}

#[test]
fn stop_with_b_already_in_foreign_code_resolves_phase_two_immediately() {
    let (runtime, a, b) = spawn_two_thread_runtime();

    enter_foreign_call(&runtime, b, 0x7fff_1000, 0x4010_00);

    let b_rec = runtime.registry.get(b).unwrap();
    assert!(!b_rec.is_in_managed_code());

    gc_stop_the_world(&runtime, a);

    assert_eq!(b_rec.csp_page.current_protection(), Protection::ReadOnly);
    assert_eq!(b_rec.state.get(), ThreadState::Running);
    assert!(b_rec.gc_safe.get());

    gc_start_the_world(&runtime, a);
    assert_eq!(b_rec.csp_page.current_protection(), Protection::ReadWrite);
}

#[test]
fn stop_with_b_in_managed_code_traps_through_the_safepoint_page() {
    let (runtime, a, b) = spawn_two_thread_runtime();
    let b_rec = runtime.registry.get(b).unwrap();
    assert!(b_rec.is_in_managed_code());

    let initiator = std::thread::spawn({
        let runtime = runtime.clone();
        move || {
            gc_stop_the_world(&runtime, a);
            gc_start_the_world(&runtime, a);
        }
    });

    // Give the initiator a chance to unmap the safepoint page and start
    // waiting on B's qrl before B polls it.
    std::thread::sleep(Duration::from_millis(20));
    assert!(runtime.safepoint.is_unmapped());
    assert_eq!(b_rec.state.get(), ThreadState::Phase1Blocker);

    // B's loop backedge polls the now-unmapped safepoint page and traps.
    let b_poll = std::thread::spawn({
        let runtime = runtime.clone();
        move || poll_safepoint(&runtime, b)
    });

    initiator.join().unwrap();
    b_poll.join().unwrap();
    assert_eq!(b_rec.state.get(), ThreadState::Running);
    assert_eq!(runtime.dispatcher.stop_count(), 0);
}

#[test]
fn inhibited_sub_gc_hands_off_under_mx_subgc() {
    let (runtime, a, b) = spawn_two_thread_runtime();
    let b_rec = runtime.registry.get(b).unwrap();
    // B stays in managed code (holding its qrl) and flags itself inhibited,
    // matching "B is inside a GC-inhibited region" — the sub-GC branch in
    // `gc_stop_the_world` expects to release B's own qrl itself.
    b_rec.gc_inhibited.store(true, Ordering::Release);

    let a_thread = std::thread::spawn({
        let runtime = runtime.clone();
        move || {
            gc_stop_the_world(&runtime, a);
            std::thread::sleep(Duration::from_millis(30));
            gc_start_the_world(&runtime, a);
        }
    });

    std::thread::sleep(Duration::from_millis(10));
    gc_stop_the_world(&runtime, b);
    gc_start_the_world(&runtime, b);

    a_thread.join().unwrap();
    assert_eq!(runtime.dispatcher.stop_count(), 0);
}

#[test]
fn wake_the_world_delivers_interrupts_without_a_full_gc() {
    let (runtime, a, b) = spawn_two_thread_runtime();
    let b_rec = runtime.registry.get(b).unwrap();

    wake_thread(&runtime, b, 1);
    assert_ne!(b_rec.pending_signal_set.load(Ordering::Acquire), 0);

    wake_the_world(&runtime, a);

    assert!(!runtime.safepoint.is_unmapped());
    assert!(runtime.dispatcher.current_initiator().is_none());
}

#[test]
fn resurrection_hands_back_a_freshly_live_handle_and_resets_tls() {
    let platform = FakePlatform::new();
    let runtime = Arc::new(Runtime::new(platform, RuntimeConfig::default()));

    let handle = runtime.create_thread(Box::new(|| {})).expect("spawn succeeds");
    // Give the spawned thread time to run its body, unregister, and park.
    std::thread::sleep(Duration::from_millis(50));

    // The original handle's slot is retired (its generation bumped) once the
    // thread unregisters itself and parks for reuse.
    let reused = loop {
        if runtime.registry.get(handle).is_none() && runtime.resurrection.len() == 1 {
            break runtime
                .resurrection
                .pop_for_reuse(&runtime.registry, Box::new(|| {}))
                .ok()
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));
    };

    // Reuse reserves a fresh handle and re-registers the record under it, so
    // it resolves immediately rather than failing the generation check the
    // stale original handle now fails.
    assert_ne!(reused, handle);
    assert!(runtime.registry.get(handle).is_none());
    let record = runtime.registry.get(reused).expect("reused handle is live");
    assert_eq!(record.state.get(), ThreadState::Running);
}
