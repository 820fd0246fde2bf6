// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Wires the bootstrap allocator, buddy allocator, page mapper
//! and virtual address-range manager into the single heap the
//! rest of the kernel allocates and frees through, and registers
//! that heap as the process-wide [`GlobalAlloc`].
//!
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc

#![no_std]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_safety_doc)]
#![deny(clippy::undocumented_unsafe_blocks)]
#![deny(clippy::wildcard_imports)]
#![deny(improper_ctypes)]
#![deny(improper_ctypes_definitions)]
#![deny(missing_docs)]
#![deny(no_mangle_generic_items)]
#![deny(unused)]
#![allow(clippy::missing_safety_doc)]

use core::alloc::{GlobalAlloc, Layout};
use memory::{LoaderDataEntry, MemoryMap, PAGE_SIZE};

/// The number of bytes reserved at the start of every live
/// allocation for the heap's own bookkeeping, matching the
/// alignment of the strictest scalar type the platform defines.
///
pub const HEADER_RESERVE: usize = core::mem::align_of::<u128>();

/// The reasons [`allocate`] or [`reallocate`] can fail.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocError {
    /// The requested size was zero.
    ///
    InvalidSize,

    /// Adding the header reserve to the requested size overflowed
    /// a `usize`.
    ///
    SizeOverflow,

    /// The virtual address-range manager has no free range large
    /// enough to satisfy the request.
    ///
    OutOfVirtualSpace,

    /// The buddy allocator ran out of physical pages to back the
    /// request.
    ///
    OutOfPhysicalMemory,

    /// Mapping the acquired virtual range failed after the
    /// virtual space itself was reserved, most often because the
    /// buddy allocator ran out of pages for intermediate
    /// page-table structure partway through.
    ///
    MappingFailed,
}

/// Holds the memory map parsed out of the loader handoff data for
/// the lifetime of the kernel, so [`bootpmm::BootstrapPmm`] can
/// borrow it with the `'static` lifetime its constructor requires.
///
/// Set exactly once, by [`init_allocator`], before anything else
/// in this crate runs.
///
static mut MEMORY_MAP: Option<MemoryMap> = None;

/// Builds the allocators this crate's heap runs on and seeds the
/// virtual address-range manager with the ranges the kernel hands
/// out from.
///
/// `entries` and `count` describe the loader data array the
/// platform entry point received at boot; one of its entries must
/// carry the physical memory map.
///
/// # Panics
///
/// Panics if no memory map entry is present, or if either seed
/// range fails to map.
///
/// # Safety
///
/// Must be called exactly once, before any call to [`allocate`],
/// [`free`], [`reallocate`], or [`debug`], with the recursive page
/// mapping already installed by the platform entry point and
/// `entries` pointing to a valid loader data array of `count`
/// records.
///
pub unsafe fn init_allocator(entries: *const LoaderDataEntry, count: usize) {
    serial::println!("pagemap: recursive mapping installed");

    let map = memory::find_memory_map(entries, count).expect("no memory map in loader data");
    MEMORY_MAP = Some(map);
    let map: &'static MemoryMap = MEMORY_MAP.as_ref().unwrap();

    let usable_regions = map.entries().iter().filter(|e| e.is_usable()).count();
    serial::println!("bootpmm: {} usable regions found", usable_regions);

    let bootstrap = bootpmm::BootstrapPmm::new(map);
    let pages_released = buddy::init(bootstrap);
    serial::println!(
        "buddy: {} pages released, max_level={}",
        pages_released,
        buddy::max_level()
    );

    vmm::init();
    vmm::release_range(memory::SMALL_HEAP_START, memory::SMALL_HEAP_END - memory::SMALL_HEAP_START);
    vmm::release_range(memory::HIGHMEM_START, memory::HIGHMEM_END - memory::HIGHMEM_START);
    serial::println!("vmm: smheap + highmem seeded");
}

/// Computes the number of bytes to map for a request of `size`
/// bytes of usable space, rounded up to a whole number of pages.
///
fn mapped_size(size: usize) -> Result<usize, AllocError> {
    let need = size.checked_add(HEADER_RESERVE).ok_or(AllocError::SizeOverflow)?;
    Ok(align::align_up_usize(need, PAGE_SIZE))
}

/// Reads the mapped size recorded in the header preceding `ptr`.
///
/// # Safety
///
/// `ptr` must have been returned by a prior call to [`allocate`]
/// or [`reallocate`] and not yet freed.
///
unsafe fn read_header(ptr: *mut u8) -> (memory::VirtAddr, usize) {
    let begin = memory::VirtAddr::new(ptr as usize - HEADER_RESERVE);
    let size = *(begin.as_usize() as *const usize);
    (begin, size)
}

/// Allocates `size` bytes of heap memory, returning a pointer
/// past the allocation's header.
///
/// Returns an error if `size` is zero, if adding the header would
/// overflow, if no virtual range is free, or if the buddy
/// allocator cannot back the range.
///
pub fn allocate(size: usize) -> Result<*mut u8, AllocError> {
    if size == 0 {
        return Err(AllocError::InvalidSize);
    }
    let mapped = mapped_size(size)?;

    let begin = vmm::acquire_range(mapped).map_err(|_| AllocError::OutOfVirtualSpace)?;

    let map_result = pagemap::map_with_alloc_one(begin, mapped, &mut buddy::GlobalSource);
    if let Err(err) = map_result {
        vmm::release_range(begin, mapped);
        return Err(match err {
            pagemap::MapError::DataAllocatorExhausted => AllocError::OutOfPhysicalMemory,
            pagemap::MapError::PageTableAllocatorExhausted => AllocError::MappingFailed,
        });
    }

    // SAFETY: `begin` is freshly mapped, writable memory.
    unsafe { *(begin.as_usize() as *mut usize) = mapped };

    Ok((begin.as_usize() + HEADER_RESERVE) as *mut u8)
}

/// Releases a heap allocation previously returned by [`allocate`]
/// or [`reallocate`].
///
/// A null `ptr` is a no-op. Freeing a pointer that was not
/// returned by this allocator, or freeing the same pointer twice,
/// is undefined behaviour.
///
/// # Safety
///
/// `ptr` must be null or a pointer this allocator handed out that
/// has not already been freed.
///
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let (begin, mapped) = read_header(ptr);
    pagemap::unmap_with_alloc_one(begin, mapped, &mut buddy::GlobalSource)
        .expect("freed pointer was not mapped");
    vmm::release_range(begin, mapped);
}

/// Resizes a heap allocation to `new_size` bytes, preserving the
/// contents up to the smaller of the old and new usable sizes.
///
/// A null `ptr` behaves like [`allocate`]. If the new size maps
/// to the same number of pages as the old one, the pointer is
/// returned unchanged.
///
/// # Safety
///
/// `ptr` must be null or a pointer this allocator handed out that
/// has not already been freed.
///
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> Result<*mut u8, AllocError> {
    if ptr.is_null() {
        return allocate(new_size);
    }
    if new_size == 0 {
        return Err(AllocError::InvalidSize);
    }

    let (_, old_mapped) = read_header(ptr);
    let new_mapped = mapped_size(new_size)?;
    if new_mapped == old_mapped {
        return Ok(ptr);
    }

    let new_ptr = allocate(new_size)?;
    let old_usable = old_mapped - HEADER_RESERVE;
    let copy_len = core::cmp::min(old_usable, new_size);
    core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
    free(ptr);
    Ok(new_ptr)
}

/// Prints the buddy allocator's and virtual address-range
/// manager's current state to the first serial port.
///
pub fn debug() {
    serial::println!("buddy: max_level={}", buddy::max_level());
    serial::println!(
        "vmm: {} free ranges, {} free",
        vmm::free_range_count(),
        pretty::Bytes::from_usize(vmm::free_bytes())
    );
    vmm::for_each_free_range(|begin, size| {
        serial::println!("  {:p} .. +{}", begin, pretty::Bytes::from_usize(size));
    });
}

/// A zero-sized [`GlobalAlloc`] wrapper over this crate's
/// [`allocate`], [`free`], and [`reallocate`].
///
/// Layout alignment beyond [`HEADER_RESERVE`] is not supported;
/// every allocation this heap hands out is aligned to
/// [`HEADER_RESERVE`] bytes.
///
pub struct KernelAlloc;

// SAFETY: `allocate`/`free`/`reallocate` satisfy the contract of
// `GlobalAlloc` for any layout whose alignment does not exceed
// `HEADER_RESERVE`; layouts requiring more are rejected by
// `alloc_zeroed`'s fallback path returning null like any other
// out-of-memory condition.
unsafe impl GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEADER_RESERVE {
            return core::ptr::null_mut();
        }
        match allocate(layout.size()) {
            Ok(ptr) => ptr,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > HEADER_RESERVE {
            return core::ptr::null_mut();
        }
        match reallocate(ptr, new_size) {
            Ok(ptr) => ptr,
            Err(_) => core::ptr::null_mut(),
        }
    }
}

#[cfg(all(not(feature = "std-alloc"), not(test)))]
#[global_allocator]
static ALLOCATOR: KernelAlloc = KernelAlloc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_size_rejects_size_overflow() {
        assert_eq!(mapped_size(usize::MAX), Err(AllocError::SizeOverflow));
    }

    #[test]
    fn test_mapped_size_rounds_up_to_a_page() {
        assert_eq!(mapped_size(1), Ok(PAGE_SIZE));
        assert_eq!(mapped_size(PAGE_SIZE), Ok(2 * PAGE_SIZE));
    }

    #[test]
    fn test_allocate_rejects_zero_size() {
        assert_eq!(allocate(0), Err(AllocError::InvalidSize));
    }
}
