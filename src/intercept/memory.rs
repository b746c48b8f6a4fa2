#![allow(non_snake_case)]
//! Intercepted memory entry points.
//!
//! Each export dispatches on the coherence mode. In MIRROR mode a managed
//! allocation never reaches the underlying runtime at all: the caller gets
//! a page-aligned host buffer whose device twin is created lazily, and
//! copies and fills are redirected so the device side stays authoritative.

use std::ffi::{c_int, c_uint, c_void};
use std::ptr;

use tracing::debug;

use crate::error::fatal;
use crate::fault;
use crate::hip::{self, HipError, HipMemcpyKind, HipPointerAttribute, dispatch};
use crate::intercept;
use crate::runtime::{self, Mode, runtime};

/// Managed allocation. In MIRROR mode the returned pointer is plain host
/// memory unknown to the underlying runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hipMallocManaged(
    ptr: *mut *mut c_void,
    size: usize,
    flags: c_uint,
) -> HipError {
    let rt = runtime();
    if ptr.is_null() {
        return hip::HIP_ERROR_INVALID_VALUE;
    }
    if intercept::interception_suspended() {
        return unsafe { dispatch::malloc_managed()(ptr, size, flags) };
    }

    match rt.mode {
        Mode::Advise => {
            let status = unsafe { dispatch::malloc_managed()(ptr, size, flags) };
            if status == hip::HIP_SUCCESS {
                let host = unsafe { *ptr };
                rt.mirrors.write().unwrap().insert(host as usize, size);
                runtime::advise_managed(host, size);
            }
            status
        }
        Mode::Device => {
            let status = unsafe { dispatch::malloc()(ptr, size) };
            if status == hip::HIP_SUCCESS {
                let device = unsafe { *ptr };
                rt.mirrors.write().unwrap().insert_with_device(device as usize, size, device);
            }
            status
        }
        Mode::Mirror => {
            let page = fault::page_size();
            if size < page {
                debug!(size, page, "allocation below page size, delegating unmirrored");
                return unsafe { dispatch::malloc_managed()(ptr, size, flags) };
            }
            // One slack page so page-granular protection can never alias an
            // adjacent allocation.
            let mut host: *mut c_void = ptr::null_mut();
            if unsafe { libc::posix_memalign(&mut host, page, size + page) } != 0 || host.is_null() {
                return hip::HIP_ERROR_OUT_OF_MEMORY;
            }
            unsafe { *ptr = host };
            let mut mirrors = rt.mirrors.write().unwrap();
            mirrors.insert(host as usize, size);
            debug!(host = ?host, size, total = mirrors.len(), "emulated managed allocation");
            hip::HIP_SUCCESS
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hipMemcpy(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    kind: HipMemcpyKind,
) -> HipError {
    let rt = runtime();
    if intercept::interception_suspended() {
        return unsafe { dispatch::memcpy()(dst, src, size, kind) };
    }
    match rt.mode {
        Mode::Advise => unsafe { dispatch::memcpy()(dst, src, size, kind) },
        Mode::Device => unsafe { dispatch::memcpy()(dst, src, size, hip::MEMCPY_DEFAULT) },
        Mode::Mirror => match kind {
            hip::MEMCPY_HOST_TO_DEVICE | hip::MEMCPY_DEVICE_TO_HOST | hip::MEMCPY_DEFAULT => unsafe {
                mirrored_memcpy(dst, src, size, kind)
            },
            // host-to-host and device-to-device never involve a mirror pair
            _ => unsafe { dispatch::memcpy()(dst, src, size, kind) },
        },
    }
}

unsafe fn mirrored_memcpy(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    kind: HipMemcpyKind,
) -> HipError {
    let rt = runtime();
    let mut mirrors = rt.mirrors.write().unwrap();
    let dst_key = dst as usize;
    let src_key = src as usize;
    let dst_hit = mirrors.get(dst_key).is_some();
    let src_hit = mirrors.get(src_key).is_some();
    if !dst_hit && !src_hit {
        drop(mirrors);
        return unsafe { dispatch::memcpy()(dst, src, size, kind) };
    }

    // Anything issued from here may cascade into internal kernel launches.
    let _suspend = intercept::suspend_interception();

    if dst_hit && src_hit {
        {
            let src_mirror = mirrors.get_mut(src_key).unwrap();
            if !src_mirror.has_device() {
                src_mirror.mirror_from_host(src_key);
            }
        }
        let src_device = mirrors.get(src_key).unwrap().device_ptr();
        let dst_mirror = mirrors.get_mut(dst_key).unwrap();
        dst_mirror.ensure_device();
        debug!(
            dst = format_args!("{dst_key:#x}"),
            src = format_args!("{src_key:#x}"),
            dst_device = ?dst_mirror.device_ptr(),
            src_device = ?src_device,
            size,
            "copy between mirrored ranges"
        );
        let status = unsafe { dispatch::memcpy()(dst_mirror.device_ptr(), src_device, size, kind) };
        fault::register_page(dst_key, fault::page_align_up(dst_mirror.size()));
        status
    } else if src_hit {
        // only the source is mirrored: its device side is authoritative
        let src_mirror = mirrors.get_mut(src_key).unwrap();
        if !src_mirror.has_device() {
            src_mirror.mirror_from_host(src_key);
        }
        unsafe { dispatch::memcpy()(dst, src_mirror.device_ptr(), size, kind) }
    } else {
        // only the destination is mirrored: land the data on the device,
        // synchronization back to the host happens on the next fault
        let dst_mirror = mirrors.get_mut(dst_key).unwrap();
        dst_mirror.ensure_device();
        let status = unsafe { dispatch::memcpy()(dst_mirror.device_ptr(), src, size, kind) };
        fault::register_page(dst_key, fault::page_align_up(dst_mirror.size()));
        status
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hipMemset(ptr: *mut c_void, value: c_int, size: usize) -> HipError {
    let rt = runtime();
    if intercept::interception_suspended() || rt.mode != Mode::Mirror {
        return unsafe { dispatch::memset()(ptr, value, size) };
    }

    let mut mirrors = rt.mirrors.write().unwrap();
    let Some((base, _)) = mirrors.lookup_containing(ptr as usize) else {
        drop(mirrors);
        return unsafe { dispatch::memset()(ptr, value, size) };
    };
    if base != ptr as usize {
        fatal!(
            "memset at offset {} into mirrored range {base:#x} is not supported",
            ptr as usize - base
        );
    }

    let _suspend = intercept::suspend_interception();
    // Both sides are about to hold the fill pattern, so the host range no
    // longer needs to trap. Dropping the registration first also keeps the
    // host store below from faulting back into ourselves.
    if let Some((page_base, _)) = fault::lookup_registered(base) {
        fault::unregister_page(page_base);
    }
    unsafe { ptr::write_bytes(ptr as *mut u8, value as u8, size) };
    let mirror = mirrors.get_mut(base).unwrap();
    mirror.ensure_device();
    let status = unsafe { dispatch::memset()(mirror.device_ptr(), value, size) };
    if status != hip::HIP_SUCCESS {
        fatal!("memset of device mirror {:?} failed: {status}", mirror.device_ptr());
    }
    hip::HIP_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hipFree(ptr: *mut c_void) -> HipError {
    let rt = runtime();
    if ptr.is_null() {
        // hipFree(null) doubles as an implicit synchronization point and
        // runtime initializer; always delegate it.
        return unsafe { dispatch::free()(ptr) };
    }
    if intercept::interception_suspended() {
        return unsafe { dispatch::free()(ptr) };
    }

    let host = ptr as usize;
    match rt.mode {
        Mode::Mirror => {
            let mut mirrors = rt.mirrors.write().unwrap();
            let Some(mirror) = mirrors.remove(host) else {
                drop(mirrors);
                return unsafe { dispatch::free()(ptr) };
            };
            if let Some((page_base, _)) = fault::lookup_registered(host) {
                fault::unregister_page(page_base);
            }
            unsafe { libc::free(ptr) };
            if mirror.has_device() {
                let _suspend = intercept::suspend_interception();
                let status = unsafe { dispatch::free()(mirror.device_ptr()) };
                if status != hip::HIP_SUCCESS {
                    fatal!("releasing device mirror {:?} failed: {status}", mirror.device_ptr());
                }
            }
            debug!(
                host = format_args!("{host:#x}"),
                remaining = mirrors.len(),
                "released mirrored allocation"
            );
            hip::HIP_SUCCESS
        }
        _ => {
            rt.mirrors.write().unwrap().remove(host);
            unsafe { dispatch::free()(ptr) }
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hipPointerGetAttributes(
    attributes: *mut HipPointerAttribute,
    ptr: *const c_void,
) -> HipError {
    let rt = runtime();
    if attributes.is_null() {
        return hip::HIP_ERROR_INVALID_VALUE;
    }
    {
        let mirrors = rt.mirrors.read().unwrap();
        if mirrors.lookup_containing(ptr as usize).is_some() {
            // The pointer is ours, not the runtime's. Report it managed so
            // dependent libraries keep routing deallocation through the
            // managed path.
            unsafe { (*attributes).is_managed = 1 };
            return hip::HIP_SUCCESS;
        }
    }
    unsafe { dispatch::pointer_get_attributes()(attributes, ptr) }
}
