//! Interception state shared by the exported entry points.

pub mod kernel;
pub mod memory;

use std::cell::Cell;
use std::sync::atomic::AtomicBool;

/// Set while a nested runtime call should populate the kernel schema list
/// from any code object it loads. Process-global because the runtime may
/// service the code-object reader on one of its internal threads.
pub static RECORD_KERNEL_METADATA: AtomicBool = AtomicBool::new(false);

thread_local! {
    // Interception is suspended per thread: the recursion it guards against
    // (internal launches and copies issued from inside an intercepted
    // operation) is confined to the issuing thread.
    static SUSPENDED: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread's intercepted calls must route straight to
/// the underlying runtime.
pub fn interception_suspended() -> bool {
    SUSPENDED.get()
}

/// Suspend interception on the current thread until the guard drops,
/// restoring whatever state was active before.
pub fn suspend_interception() -> SuspendGuard {
    SuspendGuard { prior: SUSPENDED.replace(true) }
}

pub struct SuspendGuard {
    prior: bool,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        SUSPENDED.set(self.prior);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_guard_nests_and_restores() {
        assert!(!interception_suspended());
        {
            let _outer = suspend_interception();
            assert!(interception_suspended());
            {
                let _inner = suspend_interception();
                assert!(interception_suspended());
            }
            // the inner guard restores the outer suspension, not "off"
            assert!(interception_suspended());
        }
        assert!(!interception_suspended());
    }
}
