//! Process-scope runtime state.
//!
//! Everything mutable lives in one `Runtime` value reached through a
//! one-time-initialized handle: the coherence mode, the mirror registry,
//! the parsed kernel schema list and the registration map. The first
//! intercepted call initializes it; teardown is hooked to process exit.

use std::collections::HashMap;
use std::env;
use std::ffi::c_void;
use std::sync::{Mutex, OnceLock, RwLock};

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::error::fatal;
use crate::hip::{self, dispatch};
use crate::hsaco::KernelMeta;
use crate::mirror::MirrorRegistry;
use crate::{fault, intercept};

/// Environment variable selecting the coherence mode.
pub const MODE_VAR: &str = "UTPX_MODE";

/// Environment variable holding the log filter directive.
pub const LOG_VAR: &str = "UTPX_LOG";

/// How managed allocations are emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Delegate to the underlying managed allocator and emit advisory
    /// placement hints.
    Advise,
    /// Replace managed allocations with pure device allocations.
    Device,
    /// Host-side allocation with a lazy device mirror and page-fault
    /// write-back.
    Mirror,
}

impl Mode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ADVISE" => Some(Self::Advise),
            "DEVICE" => Some(Self::Device),
            "MIRROR" => Some(Self::Mirror),
            _ => None,
        }
    }

    fn from_env() -> Self {
        match env::var(MODE_VAR) {
            Err(_) => Self::Mirror,
            Ok(value) => Self::parse(&value)
                .unwrap_or_else(|| fatal!("unknown {MODE_VAR} value {value:?} (expected ADVISE, DEVICE or MIRROR)")),
        }
    }
}

pub struct Runtime {
    pub mode: Mode,
    /// Host range to device mirror. Writers are rare: allocation, free and
    /// lazy mirror creation; the launch-argument pass takes the write lock
    /// for its whole duration.
    pub mirrors: RwLock<MirrorRegistry>,
    /// Every kernel schema recovered from loaded code objects, in load
    /// order. Registration matches by raw name, last-in winning.
    pub schemas: Mutex<Vec<KernelMeta>>,
    /// Host function address (the launch key) to argument schema.
    pub kernels: RwLock<HashMap<usize, KernelMeta>>,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process runtime, initialized on first use.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();

        let mode = Mode::from_env();
        fault::initialize(write_back);
        unsafe { libc::atexit(teardown) };
        info!(?mode, page_size = fault::page_size(), "runtime initialized");

        Runtime {
            mode,
            mirrors: RwLock::new(MirrorRegistry::new()),
            schemas: Mutex::new(Vec::new()),
            kernels: RwLock::new(HashMap::new()),
        }
    })
}

extern "C" fn teardown() {
    fault::terminate();
}

/// Coherence action for a host access to a protected range: make the host
/// side current again and drop the registration, so host access is free
/// until the next launch re-registers the range.
fn write_back(fault_addr: usize, base: usize, len: usize) {
    // The copy below re-enters the interposed entry points on this thread;
    // route it straight through.
    let _guard = intercept::suspend_interception();

    fault::unprotect(base, len);

    let mirrors = runtime().mirrors.read().unwrap();
    if let Some(mirror) = mirrors.get(base)
        && mirror.has_device()
    {
        debug!(
            fault = format_args!("{fault_addr:#x}"),
            base = format_args!("{base:#x}"),
            device = ?mirror.device_ptr(),
            size = mirror.size(),
            "writing device contents back to host"
        );
        let status = unsafe {
            dispatch::memcpy()(
                base as *mut c_void,
                mirror.device_ptr() as *const c_void,
                mirror.size(),
                hip::MEMCPY_DEVICE_TO_HOST,
            )
        };
        if status != hip::HIP_SUCCESS {
            fatal!("device-to-host write-back for {base:#x}+{} failed: {status}", mirror.size());
        }
    }
    drop(mirrors);

    fault::unregister_page(base);
}

/// Force `HIP_ENABLE_DEFERRED_LOADING=0` for the duration of a nested call
/// and restore the prior state on drop. Module loading must happen inside
/// the registration call for the code-object reader interception to see the
/// image.
pub struct DeferredLoadingOff {
    prior: Option<std::ffi::OsString>,
}

const DEFERRED_LOADING_VAR: &str = "HIP_ENABLE_DEFERRED_LOADING";

impl DeferredLoadingOff {
    pub fn force() -> Self {
        let prior = env::var_os(DEFERRED_LOADING_VAR);
        // Safety: registration runs during static construction, before the
        // application spawns threads that read the environment.
        unsafe { env::set_var(DEFERRED_LOADING_VAR, "0") };
        Self { prior }
    }
}

impl Drop for DeferredLoadingOff {
    fn drop(&mut self) {
        match self.prior.take() {
            Some(value) => unsafe { env::set_var(DEFERRED_LOADING_VAR, value) },
            None => unsafe { env::remove_var(DEFERRED_LOADING_VAR) },
        }
    }
}

/// Issue the advisory placement hints for a freshly delegated managed
/// allocation: read-mostly, preferred location on the current device,
/// accessed by the current device, then an asynchronous prefetch. Hint
/// failures are reported but never fail the allocation.
pub fn advise_managed(host: *const c_void, size: usize) {
    let mut device: std::ffi::c_int = 0;
    let status = unsafe { dispatch::get_device()(&mut device) };
    if status != hip::HIP_SUCCESS {
        tracing::warn!(status, "hipGetDevice failed, skipping placement hints");
        return;
    }

    let hints = [
        hip::MEM_ADVISE_SET_READ_MOSTLY,
        hip::MEM_ADVISE_SET_PREFERRED_LOCATION,
        hip::MEM_ADVISE_SET_ACCESSED_BY,
    ];
    for advice in hints {
        let status = unsafe { dispatch::mem_advise()(host, size, advice, device) };
        if status != hip::HIP_SUCCESS {
            tracing::warn!(advice, status, ptr = ?host, size, "placement hint failed");
        }
    }

    let status = unsafe { dispatch::mem_prefetch_async()(host, size, device, std::ptr::null_mut()) };
    if status != hip::HIP_SUCCESS {
        tracing::warn!(status, ptr = ?host, size, "prefetch after managed allocation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!(Mode::parse("ADVISE"), Some(Mode::Advise));
        assert_eq!(Mode::parse("DEVICE"), Some(Mode::Device));
        assert_eq!(Mode::parse("MIRROR"), Some(Mode::Mirror));
    }

    #[test]
    fn rejects_unknown_and_misspelt_modes() {
        assert_eq!(Mode::parse(""), None);
        assert_eq!(Mode::parse("mirror"), None);
        assert_eq!(Mode::parse("DEVICE "), None);
    }
}
