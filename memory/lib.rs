// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Defines the address and page types shared by every other
//! crate in the memory management core, plus the loader handoff
//! format and the fixed virtual memory layout.
//!
//! Nothing in this crate allocates; it only describes the
//! vocabulary that the allocators built on top of it share.

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

mod constants;
mod loader_data;
mod phys_addr;
mod phys_page;
mod virt_addr;

pub use constants::{
    BUDDY_METADATA_END, BUDDY_METADATA_START, HIGHMEM_END, HIGHMEM_START, MAPPING_WINDOW,
    RECURSIVE_ENTRY, RECURSIVE_MAPPING_END, RECURSIVE_MAPPING_START, SMALL_HEAP_END,
    SMALL_HEAP_START,
};
pub use loader_data::{
    find_memory_map, LoaderDataEntry, LoaderDataType, MemoryMap, MemoryMapEntry,
    MemoryMapHeader, MemoryRegionKind,
};
pub use phys_addr::{InvalidPhysAddr, PhysAddr};
pub use phys_page::{PhysPage, INVALID_PAGE, PAGE_SIZE};
pub use virt_addr::{InvalidVirtAddr, VirtAddr};

/// A source of single physical pages, shared by the bootstrap
/// allocator, the buddy allocator, and the page mapper so that
/// each can be handed whichever backs the others without
/// depending on their concrete types.
///
/// An allocator implementing `SinglePageSource` need not track
/// more than one free page at a time; callers that need runs
/// of contiguous pages build them out of repeated calls.
///
/// Allocation failure is signalled with [`PhysPage::invalid`]
/// rather than `Option`, matching the sentinel style the rest
/// of the bootstrap and buddy allocators are written against;
/// typed errors only appear once a result crosses out to a
/// crate that isn't itself a page source.
///
pub trait SinglePageSource {
    /// Allocates a single physical page, or returns
    /// [`PhysPage::invalid`] if none is available.
    ///
    fn alloc(&mut self) -> PhysPage;

    /// Returns a single physical page to the source.
    ///
    /// # Safety
    ///
    /// `page` must have come from this source's
    /// [`alloc`](SinglePageSource::alloc) and must not still be
    /// in use.
    ///
    unsafe fn free(&mut self, page: PhysPage);
}
