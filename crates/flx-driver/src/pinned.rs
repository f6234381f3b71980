// SPDX-License-Identifier: AGPL-3.0-only

//! Pinned host memory for the DMA ring.
//!
//! The vendor stack allocates the ring from a NUMA-aware contiguous memory
//! driver and hands back a physical and a virtual base address. The
//! [`PinnedAllocator`] trait captures that boundary. [`HostPinnedAllocator`]
//! is the in-process implementation: page-aligned zeroed memory, locked
//! with `mlock`, whose "physical" address is its virtual address. It is
//! what the emulated card targets.

use crate::error::{FlxError, Result};
use rustix::mm::{mlock, munlock};
use std::alloc::Layout;
use std::fmt::Debug;
use std::ptr::NonNull;

/// Alignment of host-pinned regions.
pub const PAGE_SIZE: usize = 4096;

/// A contiguous region the card can DMA into.
pub trait PinnedMemory: Debug + Send + Sync + 'static {
    /// Base address in this process.
    fn virt_base(&self) -> usize;

    /// Base address as the card sees it.
    fn phys_base(&self) -> u64;

    /// Region size in bytes.
    fn size(&self) -> usize;
}

/// Source of pinned DMA memory.
pub trait PinnedAllocator: Debug + Send + 'static {
    /// Region type handed out. Dropping it releases the memory.
    type Region: PinnedMemory;

    /// Allocate `size` bytes on NUMA node `numa_id`. `tag` names the owner
    /// in driver bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::Allocation`] if the memory cannot be provided.
    fn allocate(&mut self, numa_id: u32, size: usize, tag: &str) -> Result<Self::Region>;
}

/// Allocates page-aligned, locked host memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPinnedAllocator {
    strict: bool,
}

impl HostPinnedAllocator {
    /// Allocator that falls back to unlocked memory when `mlock` is refused
    /// (for example under a small `RLIMIT_MEMLOCK`).
    pub const fn new() -> Self {
        Self { strict: false }
    }

    /// Allocator that fails when the memory cannot be locked.
    pub const fn strict() -> Self {
        Self { strict: true }
    }
}

impl PinnedAllocator for HostPinnedAllocator {
    type Region = HostRegion;

    fn allocate(&mut self, numa_id: u32, size: usize, tag: &str) -> Result<HostRegion> {
        if size == 0 {
            return Err(FlxError::allocation(size, "zero-sized region"));
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| FlxError::allocation(size, format!("invalid layout: {e}")))?;

        // SAFETY: layout has non-zero size (checked above) and a power-of-two
        // alignment; the pointer is released in Drop with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| FlxError::allocation(size, "out of memory"))?;

        // SAFETY: ptr is valid for size bytes, freshly allocated above.
        let locked = match unsafe { mlock(ptr.as_ptr().cast(), size) } {
            Ok(()) => true,
            Err(e) if self.strict => {
                // SAFETY: ptr was allocated above with layout and is not shared.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                return Err(FlxError::allocation(size, format!("mlock failed: {e}")));
            }
            Err(e) => {
                tracing::warn!("{tag}: mlock of {size} bytes refused ({e}), using unlocked memory");
                false
            }
        };

        tracing::debug!(
            "{tag}: allocated {size:#x} bytes at {ptr:p} (numa {numa_id} ignored, locked={locked})"
        );
        Ok(HostRegion {
            ptr,
            layout,
            locked,
        })
    }
}

/// Host memory region from [`HostPinnedAllocator`].
#[derive(Debug)]
pub struct HostRegion {
    ptr: NonNull<u8>,
    layout: Layout,
    locked: bool,
}

impl HostRegion {
    /// Whether the pages are locked in RAM.
    pub const fn is_locked(&self) -> bool {
        self.locked
    }
}

impl PinnedMemory for HostRegion {
    fn virt_base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn phys_base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: the range was locked in allocate() and is still mapped.
            if let Err(e) = unsafe { munlock(self.ptr.as_ptr().cast(), self.layout.size()) } {
                tracing::warn!("munlock of pinned region at {:p} failed: {e}", self.ptr);
            }
        }
        // SAFETY: ptr came from alloc_zeroed with this layout; no views
        // outlive the region (readers are stopped before it is dropped).
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        tracing::debug!("Freed pinned region at {:p}", self.ptr);
    }
}

// SAFETY: HostRegion owns its allocation; the card writes into it and readers
// only read through BlockAddress views.
unsafe impl Send for HostRegion {}

// SAFETY: no interior mutation through &HostRegion.
unsafe impl Sync for HostRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_page_aligned_and_zeroed() {
        let mut alloc = HostPinnedAllocator::new();
        let region = alloc.allocate(0, 64 * 1024, "test").unwrap();
        assert_eq!(region.virt_base() % PAGE_SIZE, 0);
        assert_eq!(region.phys_base(), region.virt_base() as u64);
        assert_eq!(region.size(), 64 * 1024);
        // SAFETY: region is alive and sized as read.
        let bytes =
            unsafe { std::slice::from_raw_parts(region.virt_base() as *const u8, region.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut alloc = HostPinnedAllocator::new();
        assert!(matches!(
            alloc.allocate(0, 0, "test"),
            Err(FlxError::Allocation { size: 0, .. })
        ));
    }
}
