//! An in-process [`PlatformAdapter`] for tests.
//!
//! Real `mmap`/`mprotect`/`pthread_kill` require a real signal handler and a
//! real process to observe faults; [`FakePlatform`] instead keeps pages as
//! plain heap buffers plus a simulated protection byte, so a test can drive
//! every branch of the STW protocol — including "this store would have
//! faulted" — deterministically and without `unsafe`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{
    MappedPage, OsThreadId, PageAccess, PlatformAdapter, Protection, RawCondvar, RawMutex,
    SignalMask, ThreadBody, WaitOutcome,
};
use crate::error::RuntimeError;

pub struct FakeRawMutex {
    inner: Mutex<()>,
    // `std::sync::MutexGuard` is `!Send`, so we can't stash a guard across
    // the lock()/unlock() calls the trait requires. A held-by-someone flag
    // plus a park/unpark style wait loop over the same inner mutex gives the
    // same cross-thread-unlock semantics the raw pthread mutex has.
    held: Mutex<bool>,
    cv: Condvar,
}

impl FakeRawMutex {
    fn new() -> Self {
        FakeRawMutex {
            inner: Mutex::new(()),
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl RawMutex for FakeRawMutex {
    fn lock(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cv.wait(held).unwrap();
        }
        *held = true;
    }

    fn try_lock(&self) -> bool {
        let mut held = self.held.lock().unwrap();
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    fn unlock(&self) {
        let mut held = self.held.lock().unwrap();
        if !*held {
            crate::error::lose("FakeRawMutex::unlock on a lock nobody held");
        }
        *held = false;
        self.cv.notify_one();
    }
}

pub struct FakeRawCondvar {
    cv: Condvar,
    gate: Mutex<u64>,
}

impl FakeRawCondvar {
    fn new() -> Self {
        FakeRawCondvar {
            cv: Condvar::new(),
            gate: Mutex::new(0),
        }
    }
}

impl RawCondvar for FakeRawCondvar {
    fn wait(&self, mutex: &dyn RawMutex) {
        // We don't have access to the real held-state of an arbitrary
        // `dyn RawMutex`, so the fake condvar uses its own internal gate and
        // relies on callers re-checking their predicate in a loop (exactly
        // as the real protocol requires of every `state_cond` wait).
        mutex.unlock();
        let guard = self.gate.lock().unwrap();
        let _ = self.cv.wait_timeout(guard, Duration::from_millis(50));
        mutex.lock();
    }

    fn wait_timeout(&self, mutex: &dyn RawMutex, dur: Duration) -> WaitOutcome {
        mutex.unlock();
        let guard = self.gate.lock().unwrap();
        let (_, timeout) = self.cv.wait_timeout(guard, dur).unwrap();
        mutex.lock();
        if timeout.timed_out() {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Signaled
        }
    }

    fn notify_one(&self) {
        self.cv.notify_one();
    }

    fn notify_all(&self) {
        self.cv.notify_all();
    }
}

pub struct FakeMappedPage {
    bytes: Mutex<Vec<u8>>,
    prot: Mutex<Protection>,
    len: usize,
    // fixed per-instance synthetic address so multiple fake pages are
    // distinguishable in diagnostics without real memory mapping.
    synthetic_addr: usize,
}

static NEXT_SYNTHETIC_ADDR: AtomicU64 = AtomicU64::new(0x1000_0000);

impl FakeMappedPage {
    fn new(len: usize) -> Self {
        let synthetic_addr = NEXT_SYNTHETIC_ADDR.fetch_add(0x1000, Ordering::Relaxed) as usize;
        FakeMappedPage {
            bytes: Mutex::new(vec![0u8; len]),
            prot: Mutex::new(Protection::ReadWrite),
            len,
            synthetic_addr,
        }
    }
}

impl MappedPage for FakeMappedPage {
    fn addr(&self) -> *mut u8 {
        self.synthetic_addr as *mut u8
    }

    fn len(&self) -> usize {
        self.len
    }

    fn protect(&self, prot: Protection) -> Result<(), RuntimeError> {
        *self.prot.lock().unwrap() = prot;
        Ok(())
    }

    fn current_protection(&self) -> Protection {
        *self.prot.lock().unwrap()
    }

    fn load_word(&self) -> PageAccess {
        if *self.prot.lock().unwrap() == Protection::NoAccess {
            return PageAccess::WouldFault;
        }
        let bytes = self.bytes.lock().unwrap();
        PageAccess::Ok(usize::from_ne_bytes(bytes[0..8].try_into().unwrap()))
    }

    fn store_word(&self, value: usize) -> PageAccess {
        if *self.prot.lock().unwrap() != Protection::ReadWrite {
            // This is the simulated trap the real mmap'd page delivers as
            // SIGSEGV when the coordinator has read-protected it.
            return PageAccess::WouldFault;
        }
        let mut bytes = self.bytes.lock().unwrap();
        bytes[0..8].copy_from_slice(&value.to_ne_bytes());
        PageAccess::Ok(value)
    }
}

pub struct FakePlatform {
    next_thread_id: AtomicU64,
    threads: Mutex<HashMap<u64, Arc<FakeThreadHandle>>>,
}

struct FakeThreadHandle {
    alive: Mutex<bool>,
}

thread_local! {
    static FAKE_CURRENT_ID: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(FakePlatform {
            next_thread_id: AtomicU64::new(1),
            threads: Mutex::new(HashMap::new()),
        })
    }
}

impl PlatformAdapter for FakePlatform {
    fn new_raw_mutex(&self) -> Box<dyn RawMutex> {
        Box::new(FakeRawMutex::new())
    }

    fn new_raw_condvar(&self) -> Box<dyn RawCondvar> {
        Box::new(FakeRawCondvar::new())
    }

    fn new_mapped_page(&self, len: usize) -> Result<Box<dyn MappedPage>, RuntimeError> {
        Ok(Box::new(FakeMappedPage::new(len)))
    }

    fn spawn(&self, _stack_size: usize, body: ThreadBody) -> Result<OsThreadId, RuntimeError> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(FakeThreadHandle {
            alive: Mutex::new(true),
        });
        self.threads.lock().unwrap().insert(id, handle.clone());
        std::thread::Builder::new()
            .spawn(move || {
                FAKE_CURRENT_ID.with(|c| c.set(id));
                body();
                *handle.alive.lock().unwrap() = false;
            })
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
        Ok(OsThreadId(id))
    }

    fn kill(&self, target: OsThreadId, _signal: i32) -> Result<(), RuntimeError> {
        let threads = self.threads.lock().unwrap();
        match threads.get(&target.0) {
            Some(h) if *h.alive.lock().unwrap() => Ok(()),
            _ => Err(RuntimeError::NoSuchThread),
        }
    }

    fn current_thread_id(&self) -> OsThreadId {
        OsThreadId(FAKE_CURRENT_ID.with(|c| c.get()))
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn block_deferrable_signals(&self) -> SignalMask {
        SignalMask::empty()
    }

    fn restore_signal_mask(&self, _mask: SignalMask) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc as StdArc;

    #[test]
    fn raw_mutex_excludes_concurrent_holders() {
        let m = StdArc::new(FakeRawMutex::new());
        let counter = StdArc::new(std::sync::atomic::AtomicU32::new(0));
        let flag = StdArc::new(AtomicBool::new(false));

        let m2 = m.clone();
        let counter2 = counter.clone();
        let flag2 = flag.clone();
        let t = std::thread::spawn(move || {
            m2.lock();
            flag2.store(true, Ordering::SeqCst);
            counter2.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            m2.unlock();
        });

        while !flag.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        assert!(!m.try_lock());
        t.join().unwrap();
        assert!(m.try_lock());
    }

    #[test]
    fn mapped_page_simulates_fault_on_protected_store() {
        let page = FakeMappedPage::new(4096);
        page.protect(Protection::ReadOnly).unwrap();
        assert_eq!(page.store_word(42), PageAccess::WouldFault);
        assert_eq!(page.current_protection(), Protection::ReadOnly);
    }

    #[test]
    fn mapped_page_allows_load_on_read_only() {
        let page = FakeMappedPage::new(4096);
        page.store_word(7);
        page.protect(Protection::ReadOnly).unwrap();
        assert_eq!(page.load_word(), PageAccess::Ok(7));
    }

    #[test]
    fn mapped_page_faults_on_no_access_load() {
        let page = FakeMappedPage::new(4096);
        page.protect(Protection::NoAccess).unwrap();
        assert_eq!(page.load_word(), PageAccess::WouldFault);
    }
}
