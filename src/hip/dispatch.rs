//! One-time resolution of the underlying runtime entry points.
//!
//! Every symbol is looked up on the dynamic chain with `RTLD_NEXT` first, so
//! the interposer can never resolve back into itself. If the symbol is not on
//! the chain (the application linked the runtime lazily, or not at all), the
//! runtime library is loaded explicitly by name and the lookup retried.
//! Failure after both attempts is unrecoverable. Resolved addresses are
//! cached per symbol; concurrent first calls race benignly on the same
//! answer.

use std::ffi::{CStr, c_void};
use std::sync::OnceLock;

use libloading::os::unix::Library;
use tracing::{debug, trace};

use crate::error::fatal;
use crate::hip::{self, HIP_LIBRARY};
use crate::hsa::{self, HSA_LIBRARY};

fn resolve(symbol: &CStr, library: &str) -> usize {
    let next = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()) };
    if !next.is_null() {
        trace!(symbol = ?symbol, address = ?next, "resolved on lookup chain");
        return next as usize;
    }

    debug!(symbol = ?symbol, library, "symbol not on lookup chain, loading library");
    let lib = match unsafe { Library::new(library) } {
        Ok(lib) => lib,
        Err(e) => fatal!("cannot load {library} while resolving {symbol:?}: {e}"),
    };
    let sym = match unsafe { lib.get::<*mut c_void>(symbol.to_bytes()) } {
        Ok(sym) => sym,
        Err(e) => fatal!("cannot resolve {symbol:?} in {library}: {e}"),
    };
    let address = sym.into_raw() as usize;
    // The runtime library has to stay mapped for the life of the process.
    std::mem::forget(lib);
    if address == 0 {
        fatal!("{symbol:?} resolved to a null address in {library}");
    }
    address
}

macro_rules! runtime_fn {
    ($(#[$meta:meta])* $accessor:ident, $symbol:literal, $library:expr, $sig:ty) => {
        $(#[$meta])*
        pub fn $accessor() -> $sig {
            static SLOT: OnceLock<usize> = OnceLock::new();
            let address = *SLOT.get_or_init(|| resolve($symbol, $library));
            unsafe { std::mem::transmute::<usize, $sig>(address) }
        }
    };
}

runtime_fn!(malloc_managed, c"hipMallocManaged", HIP_LIBRARY, hip::MallocManagedFn);
runtime_fn!(malloc, c"hipMalloc", HIP_LIBRARY, hip::MallocFn);
runtime_fn!(memcpy, c"hipMemcpy", HIP_LIBRARY, hip::MemcpyFn);
runtime_fn!(memset, c"hipMemset", HIP_LIBRARY, hip::MemsetFn);
runtime_fn!(free, c"hipFree", HIP_LIBRARY, hip::FreeFn);
runtime_fn!(
    pointer_get_attributes,
    c"hipPointerGetAttributes",
    HIP_LIBRARY,
    hip::PointerGetAttributesFn
);
runtime_fn!(mem_advise, c"hipMemAdvise", HIP_LIBRARY, hip::MemAdviseFn);
runtime_fn!(mem_prefetch_async, c"hipMemPrefetchAsync", HIP_LIBRARY, hip::MemPrefetchAsyncFn);
runtime_fn!(get_device, c"hipGetDevice", HIP_LIBRARY, hip::GetDeviceFn);
runtime_fn!(launch_kernel, c"hipLaunchKernel", HIP_LIBRARY, hip::LaunchKernelFn);
runtime_fn!(module_launch_kernel, c"hipModuleLaunchKernel", HIP_LIBRARY, hip::ModuleLaunchKernelFn);
runtime_fn!(module_load_data_ex, c"hipModuleLoadDataEx", HIP_LIBRARY, hip::ModuleLoadDataExFn);
runtime_fn!(register_function, c"__hipRegisterFunction", HIP_LIBRARY, hip::RegisterFunctionFn);
runtime_fn!(
    code_object_reader_create_from_memory,
    c"hsa_code_object_reader_create_from_memory",
    HSA_LIBRARY,
    hsa::CodeObjectReaderCreateFromMemoryFn
);
