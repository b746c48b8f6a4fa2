//! Userspace page-fault handling.
//!
//! Host ranges backing a device mirror are protected `PROT_NONE` while the
//! device copy is authoritative. A host access then raises SIGSEGV with
//! `SEGV_ACCERR`; the handler parks the faulting thread on a semaphore and
//! hands the address to a dedicated guard worker, which looks up the
//! registered range, runs the coherence callback and releases the faulting
//! thread. The retried instruction then succeeds against the restored
//! protection.
//!
//! Only one fault is in flight at a time; concurrent faulting threads
//! serialize on the resume semaphore. The handler itself is restricted to
//! async-signal-safe operations: atomic loads and stores, `sem_post`,
//! `sem_timedwait`, `clock_gettime` and `abort`.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::ffi::{c_int, c_void};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::error::fatal;

/// Coherence action run by the guard worker: `(fault_addr, base, len)` where
/// `[base, base + len)` is the registered range containing the fault.
pub type FaultCallback = fn(usize, usize, usize);

/// How long a faulting thread waits for the guard worker before concluding
/// the worker is dead. Resuming without the coherence action would corrupt
/// memory, so the deadline aborts.
const RESUME_TIMEOUT_SECS: libc::time_t = 10;

struct Rendezvous {
    event: UnsafeCell<libc::sem_t>,
    resume: UnsafeCell<libc::sem_t>,
}

// Safety: sem_t is designed for cross-thread post/wait; all access goes
// through the libc semaphore calls.
unsafe impl Sync for Rendezvous {}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
static FAULT_ADDRESS: AtomicUsize = AtomicUsize::new(0);
static TERMINATE: AtomicBool = AtomicBool::new(false);
static RENDEZVOUS: AtomicPtr<Rendezvous> = AtomicPtr::new(ptr::null_mut());
static GUARD: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

/// Currently protected ranges: base address to length. Every entry lies
/// inside exactly one mirror registry entry.
static REGISTERED: RwLock<BTreeMap<usize, usize>> = RwLock::new(BTreeMap::new());

// ===============================================================================================
// Signal handler
// ===============================================================================================

// Not exposed by the `libc` crate on this target; value matches the kernel's
// siginfo.h (SEGV_ACCERR = 2) across Linux architectures.
const SEGV_ACCERR: c_int = 2;

extern "C" fn segv_handler(signum: c_int, info: *mut libc::siginfo_t, _context: *mut c_void) {
    // Protection faults on registered pages arrive as SEGV_ACCERR; anything
    // else (genuine out-of-bounds access) is not ours.
    if signum != libc::SIGSEGV || info.is_null() {
        return;
    }
    let info = unsafe { &*info };
    if info.si_code != SEGV_ACCERR {
        return;
    }

    let saved_errno = unsafe { *libc::__errno_location() };
    let rendezvous = RENDEZVOUS.load(Ordering::Acquire);
    if rendezvous.is_null() {
        unsafe { libc::abort() };
    }

    let fault = unsafe { info.si_addr() } as usize;
    FAULT_ADDRESS.store(fault, Ordering::Release);
    unsafe { libc::sem_post((*rendezvous).event.get()) };

    let mut deadline = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } != 0 {
        unsafe { libc::abort() };
    }
    deadline.tv_sec += RESUME_TIMEOUT_SECS;

    loop {
        if unsafe { libc::sem_timedwait((*rendezvous).resume.get(), &deadline) } == 0 {
            break;
        }
        if unsafe { *libc::__errno_location() } == libc::EINTR {
            continue;
        }
        // Timed out: the guard worker is presumed dead and the page is
        // still protected; retrying the instruction would loop forever.
        unsafe { libc::abort() };
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

// ===============================================================================================
// Guard worker
// ===============================================================================================

fn guard_loop(on_fault: FaultCallback) {
    let rendezvous = RENDEZVOUS.load(Ordering::Acquire);
    debug!("guard worker started");
    loop {
        loop {
            if unsafe { libc::sem_wait((*rendezvous).event.get()) } == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            fatal!("guard worker sem_wait failed: {err}");
        }
        // The terminate flag is checked before the fault slot so the wake-up
        // from terminate() is never mistaken for a fault.
        if TERMINATE.load(Ordering::Acquire) {
            break;
        }
        let fault = FAULT_ADDRESS.load(Ordering::Acquire);
        if fault == 0 {
            continue;
        }
        match lookup_registered(fault) {
            Some((base, len)) => {
                trace!(fault = format_args!("{fault:#x}"), base = format_args!("{base:#x}"), len, "handling fault");
                on_fault(fault, base, len);
            }
            None => fatal!("fault at {fault:#x} does not hit a registered page"),
        }
        FAULT_ADDRESS.store(0, Ordering::Release);
        unsafe { libc::sem_post((*rendezvous).resume.get()) };
    }
    debug!("guard worker terminated");
}

// ===============================================================================================
// Lifecycle
// ===============================================================================================

/// Install the fault handler and start the guard worker.
///
/// Must be called exactly once before any page is registered; a second call
/// is a program error.
///
/// # Panics
/// Panics when called twice, or when the internal mutex is poisoned.
pub fn initialize(on_fault: FaultCallback) {
    assert!(
        RENDEZVOUS.load(Ordering::Acquire).is_null(),
        "page-fault handling initialized twice"
    );

    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        fatal!("sysconf(_SC_PAGESIZE) failed: {}", io::Error::last_os_error());
    }
    PAGE_SIZE.store(page as usize, Ordering::Relaxed);
    TERMINATE.store(false, Ordering::Release);

    let rendezvous = Box::into_raw(Box::new(Rendezvous {
        event: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        resume: UnsafeCell::new(unsafe { std::mem::zeroed() }),
    }));
    unsafe {
        if libc::sem_init((*rendezvous).event.get(), 0, 0) != 0
            || libc::sem_init((*rendezvous).resume.get(), 0, 0) != 0
        {
            fatal!("cannot create fault rendezvous semaphores: {}", io::Error::last_os_error());
        }
    }
    RENDEZVOUS.store(rendezvous, Ordering::Release);

    let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) = segv_handler;
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    if unsafe { libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) } != 0 {
        fatal!("cannot install SIGSEGV handler: {}", io::Error::last_os_error());
    }

    let handle = thread::Builder::new()
        .name("utpx-guard".into())
        .spawn(move || guard_loop(on_fault))
        .unwrap_or_else(|e| fatal!("cannot spawn guard worker: {e}"));
    *GUARD.lock().unwrap() = Some(handle);

    debug!(page_size = page, "userspace page-fault handling initialized");
}

/// Restore protection on every registered range, stop the guard worker and
/// release the rendezvous primitives.
///
/// # Panics
/// Panics if the internal mutex is poisoned.
pub fn terminate() {
    let rendezvous = RENDEZVOUS.load(Ordering::Acquire);
    if rendezvous.is_null() {
        return;
    }

    {
        let mut pages = REGISTERED.write().unwrap();
        for (&base, &len) in pages.iter() {
            if unsafe { libc::mprotect(base as *mut c_void, len, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
                warn!(
                    base = format_args!("{base:#x}"),
                    len,
                    "mprotect restore failed during teardown: {}",
                    io::Error::last_os_error()
                );
            }
        }
        pages.clear();
    }

    TERMINATE.store(true, Ordering::Release);
    unsafe { libc::sem_post((*rendezvous).event.get()) };
    if let Some(handle) = GUARD.lock().unwrap().take() {
        let _ = handle.join();
    }

    unsafe {
        libc::sem_destroy((*rendezvous).event.get());
        libc::sem_destroy((*rendezvous).resume.get());
    }
    RENDEZVOUS.store(ptr::null_mut(), Ordering::Release);
    unsafe { drop(Box::from_raw(rendezvous)) };
    debug!("userspace page-fault handling terminated");
}

// ===============================================================================================
// Page registration
// ===============================================================================================

/// Host page size, valid after `initialize`.
pub fn page_size() -> usize {
    PAGE_SIZE.load(Ordering::Relaxed)
}

/// Round `len` up to a whole number of pages.
pub fn page_align_up(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// Register `[base, base + len)` and revoke all access to it. `base` must be
/// page-aligned and `len` a page multiple. Re-registering an identical range
/// is a no-op.
///
/// # Panics
/// Panics if the page table lock is poisoned.
pub fn register_page(base: usize, len: usize) {
    let page = page_size();
    debug_assert_eq!(base % page, 0, "registered base must be page-aligned");
    debug_assert_eq!(len % page, 0, "registered length must be a page multiple");

    let mut pages = REGISTERED.write().unwrap();
    if let Some(&existing) = pages.get(&base) {
        debug_assert_eq!(existing, len, "page registered with a different length");
        trace!(base = format_args!("{base:#x}"), "page already registered");
        return;
    }
    pages.insert(base, len);
    protect(base, len, libc::PROT_NONE);
    trace!(base = format_args!("{base:#x}"), len, total = pages.len(), "registered page");
}

/// Drop the registration at `base` and restore read/write access.
///
/// # Panics
/// Panics if the page table lock is poisoned, or (debug builds) when `base`
/// was never registered.
pub fn unregister_page(base: usize) {
    let mut pages = REGISTERED.write().unwrap();
    match pages.remove(&base) {
        Some(len) => {
            protect(base, len, libc::PROT_READ | libc::PROT_WRITE);
            trace!(base = format_args!("{base:#x}"), len, "unregistered page");
        }
        None => {
            debug_assert!(false, "unregistering unknown page {base:#x}");
            warn!(base = format_args!("{base:#x}"), "unregistering unknown page");
        }
    }
}

/// Containment lookup: the registered range holding `addr`, if any.
///
/// # Panics
/// Panics if the page table lock is poisoned.
pub fn lookup_registered(addr: usize) -> Option<(usize, usize)> {
    let pages = REGISTERED.read().unwrap();
    let (&base, &len) = pages.range(..=addr).next_back()?;
    (addr < base + len).then_some((base, len))
}

/// Restore read/write access without touching the registration; used by the
/// coherence callback before writing the device contents back.
pub fn unprotect(base: usize, len: usize) {
    protect(base, len, libc::PROT_READ | libc::PROT_WRITE);
}

fn protect(base: usize, len: usize, prot: c_int) {
    if unsafe { libc::mprotect(base as *mut c_void, len, prot) } != 0 {
        fatal!(
            "mprotect({base:#x}, {len}, {prot:#x}) failed: {}",
            io::Error::last_os_error()
        );
    }
}
