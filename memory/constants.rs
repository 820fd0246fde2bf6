// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Defines the fixed points in the virtual address space that
//! the kernel's own bookkeeping relies on.
//!
//! | Region              | Start                 | End                   |
//! |----------------------|-----------------------|-----------------------|
//! | Recursive mapping    | `0xffff_8000_0000_0000` | `0xffff_8100_0000_0000` |
//! | Mapping window       | `0xffff_8100_0000_0000` | `0xffff_8100_0000_1000` |
//! | Buddy bookkeeping    | `0xffff_8100_0000_1000` | `0xffff_8100_0100_0000` |
//! | Small heap           | `0xffff_9000_0000_0000` | `0xffff_9000_4000_0000` |
//! | High memory          | `0xffff_ff00_0000_0000` | `0xffff_ffff_ffff_f000` |
//!
//! None of these regions overlap; this is checked in
//! [`test_regions_dont_overlap`].

use crate::VirtAddr;

/// The page table index used to recursively map the active
/// set of page tables into themselves.
///
/// With `RECURSIVE_ENTRY` set in the PML4, the PML4 itself can
/// be reached as though it were a page table, which in turn
/// allows every page table in the active mapping to be
/// addressed as ordinary memory.
///
pub const RECURSIVE_ENTRY: usize = 0o400; // 256.

/// The start of the virtual address region produced by
/// recursively mapping the PML4 at [`RECURSIVE_ENTRY`].
///
pub const RECURSIVE_MAPPING_START: VirtAddr = VirtAddr::new(0xffff_8000_0000_0000);

/// The address one past the end of the recursive mapping
/// region.
///
pub const RECURSIVE_MAPPING_END: VirtAddr = VirtAddr::new(0xffff_8100_0000_0000);

/// A single virtual page, reserved for the exclusive use of
/// the buddy allocator, which uses it to read and write the
/// free-list pointers threaded through whichever physical page
/// it next needs to inspect.
///
/// Access to the page described by `MAPPING_WINDOW` must always
/// be serialised by the lock that guards the allocator using
/// it.
///
pub const MAPPING_WINDOW: VirtAddr = VirtAddr::new(0xffff_8100_0000_0000);

/// The start of the region reserved for the buddy allocator's
/// own bitmap and per-level free-list head array, mapped once at
/// construction and never moved.
///
pub const BUDDY_METADATA_START: VirtAddr = VirtAddr::new(0xffff_8100_0000_1000);

/// The address one past the end of the buddy bookkeeping region.
///
/// 16 MiB is far more than any realistic pair-bitmap and head
/// array will need; construction fails loudly rather than
/// silently overrunning this region if it ever doesn't fit.
///
pub const BUDDY_METADATA_END: VirtAddr = VirtAddr::new(0xffff_8100_0100_0000);

/// The start of the region set aside for the small, bootstrap
/// heap used before the virtual memory manager is ready to
/// service larger allocations.
///
pub const SMALL_HEAP_START: VirtAddr = VirtAddr::new(0xffff_9000_0000_0000);

/// The address one past the end of the small heap region.
///
pub const SMALL_HEAP_END: VirtAddr = VirtAddr::new(0xffff_9000_4000_0000);

/// The start of the region reserved for the general-purpose
/// virtual memory manager to hand out to callers.
///
pub const HIGHMEM_START: VirtAddr = VirtAddr::new(0xffff_ff00_0000_0000);

/// The address one past the end of the highmem region.
///
/// This stops short of the very top of the canonical address
/// space, leaving the final page unused, as the full canonical
/// address `0xffff_ffff_ffff_ffff` cannot be expressed as the
/// exclusive end of a page-aligned range without overflow.
///
pub const HIGHMEM_END: VirtAddr = VirtAddr::new(0xffff_ffff_ffff_f000);

#[cfg(test)]
mod tests {
    use super::*;

    fn regions() -> [(&'static str, VirtAddr, VirtAddr); 5] {
        [
            (
                "recursive mapping",
                RECURSIVE_MAPPING_START,
                RECURSIVE_MAPPING_END,
            ),
            ("mapping window", MAPPING_WINDOW, MAPPING_WINDOW + 0x1000),
            (
                "buddy bookkeeping",
                BUDDY_METADATA_START,
                BUDDY_METADATA_END,
            ),
            ("small heap", SMALL_HEAP_START, SMALL_HEAP_END),
            ("highmem", HIGHMEM_START, HIGHMEM_END),
        ]
    }

    #[test]
    fn test_regions_dont_overlap() {
        let regions = regions();
        for (i, (name1, start1, end1)) in regions.iter().enumerate() {
            assert!(start1.as_usize() < end1.as_usize(), "{} is empty", name1);
            for (name2, start2, end2) in regions.iter().skip(i + 1) {
                let disjoint =
                    end1.as_usize() <= start2.as_usize() || end2.as_usize() <= start1.as_usize();
                assert!(disjoint, "{} overlaps with {}", name1, name2);
            }
        }
    }
}
