//! The real, OS-backed [`PlatformAdapter`].
//!
//! Mutexes and condition variables are raw `libc::pthread_mutex_t` /
//! `pthread_cond_t`, boxed so their address never moves after
//! `pthread_mutex_init`. Pages are anonymous `mmap` regions whose protection
//! is changed with `mprotect` via `nix::sys::mman`.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use nix::sys::signal::{SigSet, Signal};

use super::{
    MappedPage, OsThreadId, PlatformAdapter, Protection, RawCondvar, RawMutex, SignalMask,
    ThreadBody, WaitOutcome,
};
use crate::error::RuntimeError;

pub struct UnixRawMutex {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// SAFETY: `pthread_mutex_t` is designed to be shared across threads; the
// box keeps its address stable, which is required by POSIX.
unsafe impl Send for UnixRawMutex {}
unsafe impl Sync for UnixRawMutex {}

impl UnixRawMutex {
    pub fn new() -> Self {
        let mut inner = Box::new(UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }));
        unsafe {
            libc::pthread_mutex_init(inner.get_mut(), std::ptr::null());
        }
        UnixRawMutex { inner }
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

impl Drop for UnixRawMutex {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.raw());
        }
    }
}

impl RawMutex for UnixRawMutex {
    fn lock(&self) {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        if rc != 0 {
            crate::error::lose("pthread_mutex_lock failed");
        }
    }

    fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.raw()) == 0 }
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        if rc != 0 {
            crate::error::lose("pthread_mutex_unlock failed on a lock we did not hold");
        }
    }
}

pub struct UnixRawCondvar {
    inner: Box<UnsafeCell<libc::pthread_cond_t>>,
}

unsafe impl Send for UnixRawCondvar {}
unsafe impl Sync for UnixRawCondvar {}

impl UnixRawCondvar {
    pub fn new() -> Self {
        let mut inner = Box::new(UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }));
        unsafe {
            libc::pthread_cond_init(inner.get_mut(), std::ptr::null());
        }
        UnixRawCondvar { inner }
    }
}

impl Drop for UnixRawCondvar {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_cond_destroy(self.inner.get());
        }
    }
}

impl RawCondvar for UnixRawCondvar {
    fn wait(&self, mutex: &dyn RawMutex) {
        let unix_mutex = downcast_mutex(mutex);
        unsafe {
            libc::pthread_cond_wait(self.inner.get(), unix_mutex.raw());
        }
    }

    fn wait_timeout(&self, mutex: &dyn RawMutex, dur: Duration) -> WaitOutcome {
        let unix_mutex = downcast_mutex(mutex);
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        ts.tv_sec += dur.as_secs() as libc::time_t;
        ts.tv_nsec += dur.subsec_nanos() as libc::c_long;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }
        let rc = unsafe { libc::pthread_cond_timedwait(self.inner.get(), unix_mutex.raw(), &ts) };
        if rc == libc::ETIMEDOUT {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Signaled
        }
    }

    fn notify_one(&self) {
        unsafe {
            libc::pthread_cond_signal(self.inner.get());
        }
    }

    fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.inner.get());
        }
    }
}

/// Downcasting through a trait object is only safe here because
/// [`UnixPlatform`] is the sole producer of the `dyn RawMutex`/`RawCondvar`
/// pairs it hands its own `wait`/`wait_timeout` calls — never mixed with
/// [`super::fake::FakePlatform`]'s implementations.
fn downcast_mutex(mutex: &dyn RawMutex) -> &UnixRawMutex {
    let ptr = mutex as *const dyn RawMutex as *const ();
    unsafe { &*(ptr as *const UnixRawMutex) }
}

/// A real anonymous `mmap` region.
pub struct UnixMappedPage {
    addr: NonNull<u8>,
    len: usize,
    // Software-tracked mirror of the real `mprotect` state. `load_word` /
    // `store_word` check this before touching the mapping, so an
    // intentionally-denied access becomes `PageAccess::WouldFault` instead
    // of a real SIGSEGV — see the trait doc on `MappedPage`. The real
    // `mprotect` call still happens, so a fault from code the core does not
    // control (e.g. JIT-generated stores that bypass this adapter) still
    // traps at the OS level exactly as the protocol expects.
    tracked_prot: std::sync::atomic::AtomicU8,
}

unsafe impl Send for UnixMappedPage {}
unsafe impl Sync for UnixMappedPage {}

const PROT_NONE_TAG: u8 = 0;
const PROT_RO_TAG: u8 = 1;
const PROT_RW_TAG: u8 = 2;

fn tag_of(prot: Protection) -> u8 {
    match prot {
        Protection::NoAccess => PROT_NONE_TAG,
        Protection::ReadOnly => PROT_RO_TAG,
        Protection::ReadWrite => PROT_RW_TAG,
    }
}

fn prot_of(tag: u8) -> Protection {
    match tag {
        PROT_NONE_TAG => Protection::NoAccess,
        PROT_RO_TAG => Protection::ReadOnly,
        _ => Protection::ReadWrite,
    }
}

impl UnixMappedPage {
    fn new(len: usize) -> Result<Self, RuntimeError> {
        let map = unsafe {
            mmap_anonymous(
                None,
                std::num::NonZeroUsize::new(len).expect("page length must be nonzero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| RuntimeError::ProtectFailed(format!("mmap failed: {e}")))?;
        Ok(UnixMappedPage {
            addr: map.cast(),
            len,
            tracked_prot: std::sync::atomic::AtomicU8::new(PROT_RW_TAG),
        })
    }
}

impl Drop for UnixMappedPage {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.cast(), self.len);
        }
    }
}

impl MappedPage for UnixMappedPage {
    fn addr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn protect(&self, prot: Protection) -> Result<(), RuntimeError> {
        let flags = match prot {
            Protection::NoAccess => ProtFlags::PROT_NONE,
            Protection::ReadOnly => ProtFlags::PROT_READ,
            Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        };
        unsafe { mprotect(self.addr.cast(), self.len, flags) }
            .map_err(|e| RuntimeError::ProtectFailed(format!("mprotect failed: {e}")))?;
        self.tracked_prot.store(tag_of(prot), Ordering::Release);
        Ok(())
    }

    fn current_protection(&self) -> Protection {
        prot_of(self.tracked_prot.load(Ordering::Acquire))
    }

    fn load_word(&self) -> super::PageAccess {
        if self.current_protection() == Protection::NoAccess {
            return super::PageAccess::WouldFault;
        }
        let v = unsafe { std::ptr::read_volatile(self.addr.as_ptr() as *const usize) };
        super::PageAccess::Ok(v)
    }

    fn store_word(&self, value: usize) -> super::PageAccess {
        if self.current_protection() != Protection::ReadWrite {
            return super::PageAccess::WouldFault;
        }
        unsafe { std::ptr::write_volatile(self.addr.as_ptr() as *mut usize, value) };
        super::PageAccess::Ok(value)
    }
}

/// The real OS identity behind [`OsThreadId`] on this adapter is the
/// thread's own `pthread_t`, cast to `u64` — it is what [`UnixPlatform::kill`]
/// needs to hand to `pthread_kill`, and unlike a process id it is already
/// unique per living thread without any bookkeeping of our own.
fn pthread_self_id() -> OsThreadId {
    OsThreadId(unsafe { libc::pthread_self() } as u64)
}

pub struct UnixPlatform;

impl UnixPlatform {
    pub fn new() -> Self {
        UnixPlatform
    }
}

impl Default for UnixPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformAdapter for UnixPlatform {
    fn new_raw_mutex(&self) -> Box<dyn RawMutex> {
        Box::new(UnixRawMutex::new())
    }

    fn new_raw_condvar(&self) -> Box<dyn RawCondvar> {
        Box::new(UnixRawCondvar::new())
    }

    fn new_mapped_page(&self, len: usize) -> Result<Box<dyn MappedPage>, RuntimeError> {
        Ok(Box::new(UnixMappedPage::new(len)?))
    }

    fn spawn(&self, stack_size: usize, body: ThreadBody) -> Result<OsThreadId, RuntimeError> {
        let (tx, rx) = std::sync::mpsc::channel::<OsThreadId>();
        std::thread::Builder::new()
            .stack_size(stack_size)
            .spawn(move || {
                // Publish this child's id before running user code, matching
                // "Set by the child when it first runs" in §3.
                let _ = tx.send(pthread_self_id());
                body();
            })
            .map_err(|e| RuntimeError::SpawnFailed(io_err_string(&e)))?;
        rx.recv()
            .map_err(|_| RuntimeError::SpawnFailed("child exited before publishing its id".into()))
    }

    fn kill(&self, target: OsThreadId, signal: i32) -> Result<(), RuntimeError> {
        // `pthread_kill`, not `kill(2)`: §4.G's interrupts are directed at one
        // thread, not the process.
        let rc = unsafe { libc::pthread_kill(target.0 as libc::pthread_t, signal) };
        match rc {
            0 => Ok(()),
            libc::ESRCH => Err(RuntimeError::NoSuchThread),
            e => Err(RuntimeError::ProtectFailed(format!(
                "pthread_kill failed: errno {e}"
            ))),
        }
    }

    fn current_thread_id(&self) -> OsThreadId {
        pthread_self_id()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn block_deferrable_signals(&self) -> SignalMask {
        let mut set = SigSet::empty();
        set.add(Signal::SIGUSR1);
        set.add(Signal::SIGUSR2);
        let mut old = SigSet::empty();
        let _ = nix::sys::signal::pthread_sigmask(
            nix::sys::signal::SigmaskHow::SIG_BLOCK,
            Some(&set),
            Some(&mut old),
        );
        mask_to_bits(&old)
    }

    fn restore_signal_mask(&self, mask: SignalMask) {
        let set = bits_to_mask(mask);
        let _ = nix::sys::signal::pthread_sigmask(
            nix::sys::signal::SigmaskHow::SIG_SETMASK,
            Some(&set),
            None,
        );
    }
}

fn io_err_string(e: &io::Error) -> String {
    e.to_string()
}

fn mask_to_bits(set: &SigSet) -> SignalMask {
    let mut mask = SignalMask::empty();
    mask.set(SignalMask::SIGUSR1, set.contains(Signal::SIGUSR1));
    mask.set(SignalMask::SIGUSR2, set.contains(Signal::SIGUSR2));
    mask
}

fn bits_to_mask(mask: SignalMask) -> SigSet {
    let mut set = SigSet::empty();
    if mask.contains(SignalMask::SIGUSR1) {
        set.add(Signal::SIGUSR1);
    }
    if mask.contains(SignalMask::SIGUSR2) {
        set.add(Signal::SIGUSR2);
    }
    set
}
