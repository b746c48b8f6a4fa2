#![allow(non_snake_case)]
//! Intercepted kernel entry points and the launch-argument rewriter.
//!
//! Function registration and module loading are wrapped so the code-object
//! reader interception sees every loaded image and records its kernel
//! schemas. At launch time the recorded schema drives a scan of the
//! argument buffers: any value living inside a mirrored host range is
//! replaced with its device twin before the runtime sees the launch.

use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::slice;
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::error::fatal;
use crate::fault;
use crate::hip::{self, Dim3, HipError, HipFunction, HipJitOption, HipModule, HipStream, dispatch};
use crate::hsa::{CodeObjectReader, HSA_STATUS_SUCCESS, HsaStatus};
use crate::hsaco::{self, ArgKind, KernelMeta};
use crate::intercept;
use crate::mirror::MirrorRegistry;
use crate::runtime::{DeferredLoadingOff, Mode, runtime};

// ===============================================================================================
// Code-object recording
// ===============================================================================================

/// The runtime funnels every module image through reader creation, which
/// makes it the one place the raw ELF bytes are visible to us.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hsa_code_object_reader_create_from_memory(
    code_object: *const c_void,
    size: usize,
    reader: *mut CodeObjectReader,
) -> HsaStatus {
    let rt = runtime();
    let status =
        unsafe { dispatch::code_object_reader_create_from_memory()(code_object, size, reader) };
    if status == HSA_STATUS_SUCCESS
        && intercept::RECORD_KERNEL_METADATA.load(Ordering::Acquire)
        && !code_object.is_null()
    {
        let image = unsafe { slice::from_raw_parts(code_object as *const u8, size) };
        match hsaco::parse_code_object(image) {
            Ok(kernels) => {
                for kernel in &kernels {
                    debug!(
                        name = %kernel.name,
                        args = kernel.args.len(),
                        kernarg_size = kernel.kernarg_size,
                        kernarg_align = kernel.kernarg_align,
                        "recorded kernel schema"
                    );
                }
                rt.schemas.lock().unwrap().extend(kernels);
            }
            Err(e) => debug!(image = ?code_object, size, "no metadata recorded: {e}"),
        }
    }
    status
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __hipRegisterFunction(
    modules: *mut c_void,
    host_function: *const c_void,
    device_function: *mut c_char,
    device_name: *const c_char,
    thread_limit: c_uint,
    tid: *mut c_uint,
    bid: *mut c_uint,
    block_dim: *mut Dim3,
    grid_dim: *mut Dim3,
    w_size: *mut c_int,
) {
    let rt = runtime();
    {
        // With deferred loading the runtime would postpone module loading to
        // the first launch; force it to happen inside this call so the
        // reader interception runs now.
        let _deferred = DeferredLoadingOff::force();
        intercept::RECORD_KERNEL_METADATA.store(true, Ordering::Release);
        unsafe {
            dispatch::register_function()(
                modules,
                host_function,
                device_function,
                device_name,
                thread_limit,
                tid,
                bid,
                block_dim,
                grid_dim,
                w_size,
            )
        };
        intercept::RECORD_KERNEL_METADATA.store(false, Ordering::Release);
    }

    if device_name.is_null() {
        return;
    }
    let name = unsafe { CStr::from_ptr(device_name) }.to_string_lossy();
    let schemas = rt.schemas.lock().unwrap();
    // Last-in match: with identically named kernels across objects, the
    // schema recorded by the registration that just ran wins.
    if let Some(meta) = schemas.iter().rev().find(|meta| meta.name == name) {
        debug!(name = %meta.name, host_function = ?host_function, "indexed kernel schema");
        rt.kernels.write().unwrap().insert(host_function as usize, meta.clone());
    } else {
        debug!(%name, "registered kernel has no recorded schema");
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hipModuleLoadDataEx(
    module: *mut HipModule,
    image: *const c_void,
    num_options: c_uint,
    options: *mut HipJitOption,
    option_values: *mut *mut c_void,
) -> HipError {
    runtime();
    intercept::RECORD_KERNEL_METADATA.store(true, Ordering::Release);
    let status = unsafe {
        dispatch::module_load_data_ex()(module, image, num_options, options, option_values)
    };
    intercept::RECORD_KERNEL_METADATA.store(false, Ordering::Release);
    status
}

// ===============================================================================================
// Launch interception
// ===============================================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hipLaunchKernel(
    function: *const c_void,
    grid: Dim3,
    block: Dim3,
    args: *mut *mut c_void,
    shared_mem_bytes: usize,
    stream: HipStream,
) -> HipError {
    let rt = runtime();
    if intercept::interception_suspended() || rt.mode != Mode::Mirror {
        return unsafe {
            dispatch::launch_kernel()(function, grid, block, args, shared_mem_bytes, stream)
        };
    }

    let meta = rt.kernels.read().unwrap().get(&(function as usize)).cloned();
    let Some(meta) = meta else {
        warn!(function = ?function, "no argument schema for launched kernel, passing through");
        return unsafe {
            dispatch::launch_kernel()(function, grid, block, args, shared_mem_bytes, stream)
        };
    };
    trace!(name = %meta.name, demangled = %meta.demangled, "intercepting launch");

    // The write lock spans the rewrite and the launch itself, so a
    // concurrent free cannot invalidate a rewritten pointer in between.
    // Internal launches issued by the runtime under our feet short-circuit
    // on the suspend flag instead of re-entering this lock.
    let mut mirrors = rt.mirrors.write().unwrap();
    unsafe { rewrite_arguments(&meta, args, &mut mirrors) };
    let _suspend = intercept::suspend_interception();
    unsafe { dispatch::launch_kernel()(function, grid, block, args, shared_mem_bytes, stream) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hipModuleLaunchKernel(
    function: HipFunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    stream: HipStream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> HipError {
    let rt = runtime();
    if intercept::interception_suspended() || rt.mode != Mode::Mirror {
        return unsafe {
            dispatch::module_launch_kernel()(
                function,
                grid_dim_x,
                grid_dim_y,
                grid_dim_z,
                block_dim_x,
                block_dim_y,
                block_dim_z,
                shared_mem_bytes,
                stream,
                kernel_params,
                extra,
            )
        };
    }

    // Module launches carry no host-function key; recover the kernel name
    // from the function handle and match the schema list by raw name.
    let meta = unsafe { hip::device_func_name(function) }.and_then(|name| {
        rt.schemas.lock().unwrap().iter().rev().find(|meta| meta.name == name).cloned()
    });
    let Some(meta) = meta else {
        warn!(function = ?function, "no argument schema for module launch, passing through");
        return unsafe {
            dispatch::module_launch_kernel()(
                function,
                grid_dim_x,
                grid_dim_y,
                grid_dim_z,
                block_dim_x,
                block_dim_y,
                block_dim_z,
                shared_mem_bytes,
                stream,
                kernel_params,
                extra,
            )
        };
    };
    trace!(name = %meta.name, demangled = %meta.demangled, "intercepting module launch");

    let mut mirrors = rt.mirrors.write().unwrap();
    unsafe { rewrite_arguments(&meta, kernel_params, &mut mirrors) };
    let _suspend = intercept::suspend_interception();
    unsafe {
        dispatch::module_launch_kernel()(
            function,
            grid_dim_x,
            grid_dim_y,
            grid_dim_z,
            block_dim_x,
            block_dim_y,
            block_dim_z,
            shared_mem_bytes,
            stream,
            kernel_params,
            extra,
        )
    }
}

// ===============================================================================================
// Argument rewriting
// ===============================================================================================

/// Walk a kernel's argument buffers and substitute every value falling
/// inside a live mirrored host range with the corresponding device pointer,
/// creating mirrors and protecting host pages as needed. Must run under the
/// mirror registry write lock.
unsafe fn rewrite_arguments(meta: &KernelMeta, args: *mut *mut c_void, mirrors: &mut MirrorRegistry) {
    if args.is_null() {
        return;
    }
    let ptr_size = size_of::<*mut c_void>();

    for (index, arg) in meta.args.iter().enumerate() {
        match arg.kind {
            ArgKind::Hidden => continue,
            ArgKind::Unknown => fatal!(
                "kernel {} argument {index} has an unknown kind, its ABI cannot be analyzed",
                meta.name
            ),
            ArgKind::ByValue | ArgKind::GlobalBuffer => {}
        }
        if arg.size < ptr_size {
            continue;
        }

        if arg.size == ptr_size {
            // Pointer-sized argument: the slot points at a possible pointer.
            let slot = unsafe { *args.add(index) } as *mut *mut c_void;
            if slot.is_null() {
                return;
            }
            let candidate = unsafe { *slot } as usize;
            if let Some((cell, device)) = ensure_mirrored(mirrors, candidate) {
                trace!(
                    index,
                    old = format_args!("{candidate:#x}"),
                    new = ?device,
                    "rewrote pointer argument"
                );
                unsafe { *args.add(index) = cell };
            }
        } else {
            // A by-value aggregate may embed pointers at arbitrary offsets.
            // Any integer that happens to fall inside a live mirrored range
            // is treated as a pointer; callers must not pack colliding
            // integers into launch arguments.
            let data = unsafe { *args.add(index) } as *mut u8;
            if data.is_null() {
                continue;
            }
            let stride = if meta.packed(index) { 1 } else { 2 };
            let mut offset = 0;
            while offset + ptr_size <= arg.size {
                let candidate = unsafe { (data.add(offset) as *const usize).read_unaligned() };
                if let Some((_, device)) = ensure_mirrored(mirrors, candidate) {
                    trace!(
                        index,
                        offset,
                        old = format_args!("{candidate:#x}"),
                        new = ?device,
                        "rewrote embedded pointer"
                    );
                    unsafe { (data.add(offset) as *mut usize).write_unaligned(device as usize) };
                }
                offset += stride;
            }
        }
    }
}

/// Containment-match `candidate` against the mirror registry. On a hit,
/// make sure the device side exists and the host range is protected, then
/// return the device-pointer cell address and the device pointer value.
fn ensure_mirrored(
    mirrors: &mut MirrorRegistry,
    candidate: usize,
) -> Option<(*mut c_void, *mut c_void)> {
    let (base, _) = mirrors.lookup_containing(candidate)?;
    let mirror = mirrors.get_mut(base).expect("containment hit without an entry");
    if !mirror.has_device() {
        // The host-to-device upload may enqueue internal kernels that would
        // otherwise recurse into the rewriter on this thread.
        let _suspend = intercept::suspend_interception();
        mirror.mirror_from_host(base);
    }
    fault::register_page(base, fault::page_align_up(mirror.size()));
    Some((mirror.device_slot(), mirror.device_ptr()))
}
