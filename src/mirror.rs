//! The mirror registry: host allocations paired with device allocations.
//!
//! Each managed allocation the facade hands out is tracked here, keyed by
//! its host base address. The device side is created lazily the first time
//! a kernel (or a copy targeting the range) needs it. The registry is owned
//! by the process-wide runtime behind a reader-writer lock; mutation — and
//! the lazy-creation paths, which transition observable state and call back
//! into the underlying runtime — require the write lock.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::ptr;

use tracing::trace;

use crate::error::fatal;
use crate::hip::{self, dispatch};

/// One mirrored allocation: a device pointer (null until created) paired
/// with the host range's size. Once set, the device pointer never changes
/// and is released exactly once, when the owning entry is removed.
///
/// The pointer lives in a `Box` so its cell has a stable address for the
/// whole life of the entry: the kernel-argument rewriter publishes the
/// cell's address into launch argument buffers.
#[derive(Debug)]
pub struct Mirror {
    device: Box<*mut c_void>,
    size: usize,
}

// Safety: the device pointer is an opaque GPU address, never dereferenced on
// the host; entries are only reached through the registry lock.
unsafe impl Send for Mirror {}
unsafe impl Sync for Mirror {}

impl Mirror {
    fn new(size: usize) -> Self {
        Self { device: Box::new(ptr::null_mut()), size }
    }

    fn with_device(device: *mut c_void, size: usize) -> Self {
        Self { device: Box::new(device), size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn has_device(&self) -> bool {
        !self.device.is_null()
    }

    pub fn device_ptr(&self) -> *mut c_void {
        *self.device
    }

    /// Address of the device-pointer cell itself, suitable for use as a
    /// pointer-to-pointer kernel argument. Stable until the entry is
    /// removed.
    pub fn device_slot(&self) -> *mut c_void {
        &raw const *self.device as *mut c_void
    }

    /// Allocate the device side if it does not exist yet. Does not touch
    /// the host side. Idempotent. Failure of the underlying allocator on
    /// this internally synthesized operation is unrecoverable.
    pub fn ensure_device(&mut self) {
        if self.has_device() {
            return;
        }
        let mut device: *mut c_void = ptr::null_mut();
        let status = unsafe { dispatch::malloc()(&mut device, self.size) };
        if status != hip::HIP_SUCCESS {
            fatal!("device mirror allocation of {} bytes failed: {status}", self.size);
        }
        if device.is_null() {
            fatal!("device mirror allocation of {} bytes produced null", self.size);
        }
        trace!(device = ?device, size = self.size, "created device mirror");
        *self.device = device;
    }

    /// Ensure the device side exists and copy the current host contents to
    /// it.
    pub fn mirror_from_host(&mut self, host_base: usize) {
        self.ensure_device();
        let status = unsafe {
            dispatch::memcpy()(
                *self.device,
                host_base as *const c_void,
                self.size,
                hip::MEMCPY_HOST_TO_DEVICE,
            )
        };
        if status != hip::HIP_SUCCESS {
            fatal!(
                "mirroring {:#x}+{} to device {:?} failed: {status}",
                host_base,
                self.size,
                *self.device
            );
        }
    }
}

/// Ordered map from host base address to mirror, with exact and containment
/// lookup. Expected population is small (tens to low hundreds), so
/// containment lookup is a linear scan.
#[derive(Debug, Default)]
pub struct MirrorRegistry {
    entries: BTreeMap<usize, Mirror>,
}

impl MirrorRegistry {
    pub const fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Track a new host allocation with no device side yet.
    pub fn insert(&mut self, host_base: usize, size: usize) {
        self.entries.insert(host_base, Mirror::new(size));
    }

    /// Track an allocation whose device side coincides with its base (the
    /// pure device-allocation mode).
    pub fn insert_with_device(&mut self, host_base: usize, size: usize, device: *mut c_void) {
        self.entries.insert(host_base, Mirror::with_device(device, size));
    }

    pub fn get(&self, host_base: usize) -> Option<&Mirror> {
        self.entries.get(&host_base)
    }

    pub fn get_mut(&mut self, host_base: usize) -> Option<&mut Mirror> {
        self.entries.get_mut(&host_base)
    }

    /// Find the entry whose host range contains `addr`.
    pub fn lookup_containing(&self, addr: usize) -> Option<(usize, &Mirror)> {
        self.entries
            .iter()
            .find(|&(&base, mirror)| addr >= base && addr < base + mirror.size)
            .map(|(&base, mirror)| (base, mirror))
    }

    /// Remove and return the entry at `host_base`. The caller owns the
    /// release of both sides.
    pub fn remove(&mut self, host_base: usize) -> Option<Mirror> {
        self.entries.remove(&host_base)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_containment_lookup() {
        let mut registry = MirrorRegistry::new();
        registry.insert(0x10000, 0x2000);
        registry.insert(0x20000, 0x1000);

        assert!(registry.get(0x10000).is_some());
        assert!(registry.get(0x10008).is_none());

        let (base, mirror) = registry.lookup_containing(0x11fff).unwrap();
        assert_eq!(base, 0x10000);
        assert_eq!(mirror.size(), 0x2000);
        assert!(registry.lookup_containing(0x12000).is_none());
        assert!(registry.lookup_containing(0xffff).is_none());

        let (base, _) = registry.lookup_containing(0x20000).unwrap();
        assert_eq!(base, 0x20000);
    }

    #[test]
    fn insert_and_remove_restore_size() {
        let mut registry = MirrorRegistry::new();
        assert!(registry.is_empty());
        registry.insert(0x40000, 0x1000);
        assert_eq!(registry.len(), 1);
        let removed = registry.remove(0x40000).unwrap();
        assert_eq!(removed.size(), 0x1000);
        assert!(!removed.has_device());
        assert!(registry.is_empty());
        assert!(registry.remove(0x40000).is_none());
    }

    #[test]
    fn device_slot_holds_the_device_pointer() {
        let mut registry = MirrorRegistry::new();
        let device = 0x7f00_0000_0000usize as *mut std::ffi::c_void;
        registry.insert_with_device(0x50000, 0x1000, device);

        let mirror = registry.get(0x50000).unwrap();
        assert!(mirror.has_device());
        assert_eq!(mirror.device_ptr(), device);
        // the slot is a pointer to the cell holding the device pointer
        let slot = mirror.device_slot() as *const *mut std::ffi::c_void;
        assert_eq!(unsafe { *slot }, device);
    }

    #[test]
    fn device_slot_is_stable_across_map_growth() {
        let mut registry = MirrorRegistry::new();
        registry.insert(0x100000, 0x1000);
        let slot = registry.get(0x100000).unwrap().device_slot();
        for i in 0..64 {
            registry.insert(0x200000 + i * 0x1000, 0x1000);
        }
        assert_eq!(registry.get(0x100000).unwrap().device_slot(), slot);
    }
}
