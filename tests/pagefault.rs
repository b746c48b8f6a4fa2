//! End-to-end exercise of the page-fault rendezvous: a write into a
//! protected range must trap, run the coherence callback on the guard
//! worker, and complete once the worker restores access.
//!
//! Signal dispositions and the guard worker are process-global, so the
//! whole protocol lives in one serialized test.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serial_test::serial;
use utpx::fault;

static SEEN_FAULT: AtomicUsize = AtomicUsize::new(0);
static SEEN_BASE: AtomicUsize = AtomicUsize::new(0);
static SEEN_LEN: AtomicUsize = AtomicUsize::new(0);
static CALLBACK_RUNS: AtomicUsize = AtomicUsize::new(0);

fn recording_callback(fault_addr: usize, base: usize, len: usize) {
    SEEN_FAULT.store(fault_addr, Ordering::SeqCst);
    SEEN_BASE.store(base, Ordering::SeqCst);
    SEEN_LEN.store(len, Ordering::SeqCst);
    CALLBACK_RUNS.fetch_add(1, Ordering::SeqCst);
    // Restoring access and dropping the registration is what lets the
    // faulting thread's retried instruction succeed.
    fault::unregister_page(base);
}

fn map_pages(len: usize) -> usize {
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(base, libc::MAP_FAILED, "mmap failed");
    base as usize
}

#[test]
#[serial]
fn fault_protocol_round_trip() {
    fault::initialize(recording_callback);
    let page = fault::page_size();
    assert!(page > 0);
    assert_eq!(fault::page_align_up(1), page);
    assert_eq!(fault::page_align_up(page), page);
    assert_eq!(fault::page_align_up(page + 1), 2 * page);

    let len = 2 * page;
    let base = map_pages(len);
    unsafe { *(base as *mut u8) = 7 };

    // registration protects; unregistration restores and leaves no entry
    fault::register_page(base, len);
    assert_eq!(fault::lookup_registered(base), Some((base, len)));
    assert_eq!(fault::lookup_registered(base + len - 1), Some((base, len)));
    assert_eq!(fault::lookup_registered(base + len), None);
    fault::register_page(base, len); // equal re-registration is a no-op
    fault::unregister_page(base);
    assert_eq!(fault::lookup_registered(base), None);
    unsafe { *(base as *mut u8) = 9 }; // no trap after restore
    assert_eq!(CALLBACK_RUNS.load(Ordering::SeqCst), 0);

    // a store into the protected range traps; the callback observes the
    // fault address and the containing range; the store then completes
    fault::register_page(base, len);
    let target = base + page + 32;
    unsafe { *(target as *mut u8) = 42 };

    assert_eq!(CALLBACK_RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(SEEN_FAULT.load(Ordering::SeqCst), target);
    assert_eq!(SEEN_BASE.load(Ordering::SeqCst), base);
    assert_eq!(SEEN_LEN.load(Ordering::SeqCst), len);
    assert_eq!(unsafe { *(target as *const u8) }, 42);
    assert_eq!(fault::lookup_registered(base), None);

    // a second protect/fault cycle works the same way
    fault::register_page(base, len);
    unsafe { *(base as *mut u8) = 1 };
    assert_eq!(CALLBACK_RUNS.load(Ordering::SeqCst), 2);
    assert_eq!(unsafe { *(base as *const u8) }, 1);

    fault::terminate();
    unsafe { libc::munmap(base as *mut c_void, len) };
}
