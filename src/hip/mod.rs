//! The consumed HIP runtime ABI.
//!
//! Only the slice of the runtime this library intercepts or calls is
//! declared here: status codes, the memory-copy/advise constants, the
//! pointer-attribute record and the signatures of the resolved entry
//! points. Values match the runtime's public headers.

pub mod dispatch;

use std::ffi::{CStr, c_char, c_int, c_uint, c_void};

/// Shared library the runtime entry points live in, used when a symbol is
/// not already present on the dynamic lookup chain.
pub const HIP_LIBRARY: &str = "libamdhip64.so";

// ===============================================================================================
// Status codes and enums (C enums are plain ints on this ABI)
// ===============================================================================================

pub type HipError = c_uint;

pub const HIP_SUCCESS: HipError = 0;
pub const HIP_ERROR_INVALID_VALUE: HipError = 1;
pub const HIP_ERROR_OUT_OF_MEMORY: HipError = 2;

pub type HipMemcpyKind = c_uint;

pub const MEMCPY_HOST_TO_HOST: HipMemcpyKind = 0;
pub const MEMCPY_HOST_TO_DEVICE: HipMemcpyKind = 1;
pub const MEMCPY_DEVICE_TO_HOST: HipMemcpyKind = 2;
pub const MEMCPY_DEVICE_TO_DEVICE: HipMemcpyKind = 3;
pub const MEMCPY_DEFAULT: HipMemcpyKind = 4;

pub type HipMemoryAdvise = c_uint;

pub const MEM_ADVISE_SET_READ_MOSTLY: HipMemoryAdvise = 1;
pub const MEM_ADVISE_SET_PREFERRED_LOCATION: HipMemoryAdvise = 3;
pub const MEM_ADVISE_SET_ACCESSED_BY: HipMemoryAdvise = 5;

// ===============================================================================================
// Opaque handles and records
// ===============================================================================================

pub type HipStream = *mut c_void;
pub type HipModule = *mut c_void;
pub type HipFunction = *mut c_void;
pub type HipJitOption = c_uint;

/// Kernel launch geometry, passed by value over the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Result record of `hipPointerGetAttributes`.
#[repr(C)]
#[derive(Debug)]
pub struct HipPointerAttribute {
    pub memory_type: c_uint,
    pub device: c_int,
    pub device_pointer: *mut c_void,
    pub host_pointer: *mut c_void,
    pub is_managed: c_int,
    pub allocation_flags: c_uint,
}

// ===============================================================================================
// Resolved entry point signatures
// ===============================================================================================

pub type MallocManagedFn = unsafe extern "C" fn(*mut *mut c_void, usize, c_uint) -> HipError;
pub type MallocFn = unsafe extern "C" fn(*mut *mut c_void, usize) -> HipError;
pub type MemcpyFn = unsafe extern "C" fn(*mut c_void, *const c_void, usize, HipMemcpyKind) -> HipError;
pub type MemsetFn = unsafe extern "C" fn(*mut c_void, c_int, usize) -> HipError;
pub type FreeFn = unsafe extern "C" fn(*mut c_void) -> HipError;
pub type PointerGetAttributesFn =
    unsafe extern "C" fn(*mut HipPointerAttribute, *const c_void) -> HipError;
pub type MemAdviseFn = unsafe extern "C" fn(*const c_void, usize, HipMemoryAdvise, c_int) -> HipError;
pub type MemPrefetchAsyncFn = unsafe extern "C" fn(*const c_void, usize, c_int, HipStream) -> HipError;
pub type GetDeviceFn = unsafe extern "C" fn(*mut c_int) -> HipError;
pub type LaunchKernelFn =
    unsafe extern "C" fn(*const c_void, Dim3, Dim3, *mut *mut c_void, usize, HipStream) -> HipError;
#[allow(clippy::type_complexity)]
pub type ModuleLaunchKernelFn = unsafe extern "C" fn(
    HipFunction,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    HipStream,
    *mut *mut c_void,
    *mut *mut c_void,
) -> HipError;
pub type ModuleLoadDataExFn = unsafe extern "C" fn(
    *mut HipModule,
    *const c_void,
    c_uint,
    *mut HipJitOption,
    *mut *mut c_void,
) -> HipError;
#[allow(clippy::type_complexity)]
pub type RegisterFunctionFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_void,
    *mut c_char,
    *const c_char,
    c_uint,
    *mut c_uint,
    *mut c_uint,
    *mut Dim3,
    *mut Dim3,
    *mut c_int,
);

// ===============================================================================================
// DeviceFunc peek
// ===============================================================================================

/// Partial layout of the runtime's internal `hip::DeviceFunc`, which is what
/// a `hipFunction_t` actually points at. The leading blob is the runtime's
/// monitor (two atomic words, a 64-byte name buffer, two list pointers, a
/// lock count and a flag, padded to 8); the member after it is a
/// `std::string` whose first word is the character-data pointer, valid for
/// both the heap and the small-string representation.
#[repr(C)]
struct DeviceFunc {
    _monitor: [u8; 104],
    name: *const c_char,
}

/// Recover the kernel name from a `hipFunction_t` handle.
///
/// # Safety
/// `func` must be a live function handle obtained from the runtime; the
/// layout peek is only valid against the runtime build this ABI tracks.
pub unsafe fn device_func_name(func: HipFunction) -> Option<String> {
    if func.is_null() {
        return None;
    }
    let record = unsafe { &*(func as *const DeviceFunc) };
    if record.name.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(record.name) }.to_string_lossy().into_owned())
}
