//! §4.H Post-Mortem & Resurrection.
//!
//! [`PostMortemQueue`] is a plain FIFO guarded by its own `std::sync::Mutex`:
//! nothing there is ever locked on one thread and unlocked on another, so the
//! ordinary RAII guard is the idiomatic fit. [`ResurrectionPool`] is the
//! opposite case — its responsible awakener waits on `cond` while a
//! different thread (whichever one calls `park`/`pop_for_reuse`/`reap_one`)
//! mutates the same queue and wakes it, the same rendezvous shape as the QRL
//! and the dispatcher's mutexes — so it is built on [`crate::platform::RawMutex`]/
//! [`crate::platform::RawCondvar`] rather than `std::sync::Condvar`.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RuntimeError;
use crate::platform::{PlatformAdapter, RawCondvar, RawMutex, WaitOutcome};
use crate::registry::Registry;
use crate::thread_record::{ThreadHandle, ThreadRecord, ThreadState};

/// A corpse awaiting final release. Per §9's ownership note, this is the
/// sole owner of the thread record once the thread has unlinked itself from
/// the registry.
struct PostMortemEntry {
    record: Arc<ThreadRecord>,
}

/// §3's post-mortem queue: "a singly-linked list of `{os_thread, os_attr,
/// os_address}` records awaiting final join and memory release.
/// Capacity-bounded; oldest-first draining."
///
/// The real adapter's `spawn` hands back only an opaque [`crate::platform::OsThreadId`],
/// not a joinable handle — matching the source's own `os_thread` field, which
/// is an identity, not a join token. "Join" here is therefore the logical
/// step of waiting for the OS to report the thread gone; since this adapter
/// has no such signal to wait on, draining an entry is releasing the record,
/// which is the only resource this core actually owns.
pub struct PostMortemQueue {
    queue: Mutex<VecDeque<PostMortemEntry>>,
    drain_threshold: usize,
}

impl PostMortemQueue {
    pub fn new(drain_threshold: usize) -> Self {
        PostMortemQueue {
            queue: Mutex::new(VecDeque::new()),
            drain_threshold,
        }
    }

    /// Enqueue an exited thread's record. Drains the oldest entries once the
    /// queue exceeds `drain_threshold`.
    pub fn push(&self, record: Arc<ThreadRecord>) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(PostMortemEntry { record });
        while queue.len() > self.drain_threshold {
            let entry = queue.pop_front().expect("checked non-empty by the loop condition");
            drop(entry);
            tracing::debug!(target: "stw_core::postmortem", "drained one corpse");
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// §3's resurrection pool: "a singly-linked list of parked thread records
/// waiting to be reused... exactly one parked thread is the responsible
/// awakener."
pub struct ResurrectionPool {
    lock: Box<dyn RawMutex>,
    cond: Box<dyn RawCondvar>,
    queue: UnsafeCell<VecDeque<Arc<ThreadRecord>>>,
    max_waiters: usize,
    awakener_timeout: Duration,
}

// SAFETY: `queue` is only read or mutated by the methods below, all of which
// hold `lock` for the duration of the access.
unsafe impl Sync for ResurrectionPool {}

impl ResurrectionPool {
    pub fn new(platform: &dyn PlatformAdapter, max_waiters: usize, awakener_timeout: Duration) -> Self {
        ResurrectionPool {
            lock: platform.new_raw_mutex(),
            cond: platform.new_raw_condvar(),
            queue: UnsafeCell::new(VecDeque::new()),
            max_waiters,
            awakener_timeout,
        }
    }

    /// # Safety
    /// Caller must hold `self.lock`.
    unsafe fn queue_mut(&self) -> &mut VecDeque<Arc<ThreadRecord>> {
        &mut *self.queue.get()
    }

    pub fn len(&self) -> usize {
        self.lock.lock();
        let len = unsafe { self.queue_mut() }.len();
        self.lock.unlock();
        len
    }

    /// Park `record` for reuse. Returns `Err(ResurrectionPoolFull)` if the
    /// pool was already at capacity, in which case the caller must proceed
    /// to post-mortem instead (§8 boundary behaviour).
    ///
    /// The pushed thread becomes the *responsible awakener* iff it is the
    /// pool's only entry; it then runs [`ResurrectionPool::awakener_wait`].
    /// Every other parked thread just blocks on `cond` until its own state
    /// changes away from `Suspended`/`Dead`.
    pub fn park(&self, record: Arc<ThreadRecord>) -> Result<bool, RuntimeError> {
        self.lock.lock();
        let queue = unsafe { self.queue_mut() };
        if queue.len() >= self.max_waiters {
            self.lock.unlock();
            return Err(RuntimeError::ResurrectionPoolFull);
        }
        let is_awakener = queue.is_empty();
        queue.push_back(record);
        self.lock.unlock();
        Ok(is_awakener)
    }

    /// Run by the responsible awakener: wait with a deadline; reap one
    /// victim on timeout. Called in a loop by the parked thread's trampoline
    /// until its own state moves off `Suspended`/`Dead`.
    ///
    /// `platform.monotonic_now()` brackets the time actually spent
    /// contending for `lock` against the budget, so a delayed lock
    /// acquisition shortens the wait instead of silently extending the
    /// awakener's total timeout past `awakener_timeout`.
    pub fn awakener_wait(&self, platform: &dyn PlatformAdapter) {
        let started = platform.monotonic_now();
        self.lock.lock();
        let elapsed = platform.monotonic_now().saturating_duration_since(started);
        let remaining = self.awakener_timeout.saturating_sub(elapsed);
        let outcome = self.cond.wait_timeout(self.lock.as_ref(), remaining);
        self.lock.unlock();
        if outcome == WaitOutcome::TimedOut {
            self.reap_one();
        }
    }

    /// Run by any non-awakener parked thread: block until notified (e.g. a
    /// `create_thread` pop or the awakener reaping it).
    pub fn non_awakener_wait(&self) {
        self.lock.lock();
        self.cond.wait(self.lock.as_ref());
        self.lock.unlock();
    }

    /// Pop the oldest victim and mark it `Suspended`, directing it to wake
    /// up and terminate (§4.H step 4).
    fn reap_one(&self) {
        self.lock.lock();
        let victim = unsafe { self.queue_mut() }.pop_front();
        if let Some(victim) = &victim {
            victim.state.set(ThreadState::Suspended);
        }
        self.cond.notify_all();
        self.lock.unlock();
    }

    /// `create_thread`'s fast path: pop the oldest parked thread, reassign it
    /// a freshly reserved handle, re-link it into `registry` under that
    /// handle, hand it `body` as its next initial function, and wake it with
    /// `Running`. Hands `body` back in `Err` if the pool was empty, so the
    /// caller can fall through to spawning a fresh thread without having lost
    /// it.
    ///
    /// The handle returned here must be immediately live: `registry.get`
    /// already rejects the record's old handle (its slot's generation was
    /// bumped by [`Registry::unregister`] when the thread parked), so a
    /// caller of [`Runtime::create_thread`] addressing the reused thread by
    /// the handle this returns needs it to resolve right away, not once the
    /// record later reaches the top of the trampoline loop again.
    pub fn pop_for_reuse(
        &self,
        registry: &Registry,
        body: crate::platform::ThreadBody,
    ) -> Result<ThreadHandle, crate::platform::ThreadBody> {
        self.lock.lock();
        let record = unsafe { self.queue_mut() }.pop_front();
        self.lock.unlock();
        let Some(record) = record else {
            return Err(body);
        };
        let new_handle = registry.reserve();
        record.set_handle(new_handle);
        *record.no_tls_value_marker.lock().unwrap_or_else(|e| e.into_inner()) = Some(body);
        record.state.set(ThreadState::Running);
        registry.register(record.clone());
        self.cond.notify_all();
        Ok(new_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use crate::thread_record::ThreadHandle;

    fn make_record(index: u32) -> Arc<ThreadRecord> {
        let platform = FakePlatform::new();
        let handle = ThreadHandle {
            index,
            generation: 0,
        };
        Arc::new(ThreadRecord::new(handle, platform.as_ref(), 4096))
    }

    #[test]
    fn post_mortem_drains_oldest_first_past_threshold() {
        let queue = PostMortemQueue::new(2);
        for i in 0..5 {
            queue.push(make_record(i));
        }
        assert!(queue.len() <= 2);
    }

    #[test]
    fn first_parked_thread_is_the_awakener() {
        let platform = FakePlatform::new();
        let pool = ResurrectionPool::new(platform.as_ref(), 4, Duration::from_millis(10));
        assert!(pool.park(make_record(0)).unwrap());
        assert!(!pool.park(make_record(1)).unwrap());
    }

    #[test]
    fn pool_rejects_beyond_capacity() {
        let platform = FakePlatform::new();
        let pool = ResurrectionPool::new(platform.as_ref(), 1, Duration::from_millis(10));
        pool.park(make_record(0)).unwrap();
        assert_eq!(
            pool.park(make_record(1)),
            Err(RuntimeError::ResurrectionPoolFull)
        );
    }

    #[test]
    fn pop_for_reuse_sets_next_function_and_wakes_running() {
        let platform = FakePlatform::new();
        let pool = ResurrectionPool::new(platform.as_ref(), 4, Duration::from_millis(10));
        let registry = Registry::new();
        let record = make_record(0);
        let original_handle = record.handle();
        pool.park(record.clone()).unwrap();
        let popped = pool.pop_for_reuse(&registry, Box::new(|| {})).ok().unwrap();

        // The reused record is reassigned a fresh, live handle rather than
        // keeping the one the registry already retired when it parked.
        assert_ne!(popped, original_handle);
        assert_eq!(record.handle(), popped);
        assert!(registry.get(popped).is_some());
        assert_eq!(record.state.get(), ThreadState::Running);
    }
}
