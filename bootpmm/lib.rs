// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Hands out individual physical pages straight from the
//! bootloader's memory map, before the buddy allocator exists to
//! take over. Pages are read and written through the mapping
//! window, since nothing maps physical memory directly yet.

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

#[cfg(test)]
extern crate alloc;

use memory::{MemoryMap, MemoryMapEntry, PhysAddr, PhysPage, SinglePageSource, MAPPING_WINDOW, PAGE_SIZE};

/// Finds the index of the usable region that contains or follows
/// `boundary`, and the boundary to resume from within it.
///
/// Returns `(entries.len(), boundary)` if no such region exists.
///
fn find_boundary_entry(entries: &[MemoryMapEntry], boundary: PhysAddr) -> (usize, PhysAddr) {
    for (i, entry) in entries.iter().enumerate() {
        if !entry.is_usable() {
            continue;
        }
        if boundary.as_usize() < entry.end().as_usize() {
            let start = if boundary.as_usize() < entry.start().as_usize() {
                entry.start()
            } else {
                boundary
            };
            return (i, start);
        }
    }
    (entries.len(), boundary)
}

/// Reads the 8-byte next-pointer stored at the base of a freed
/// page, through the mapping window.
///
/// # Safety
///
/// `page` must currently hold a valid next-pointer at its base
/// (i.e. it must have been pushed by [`push_free`]).
///
unsafe fn read_next(page: PhysPage) -> PhysPage {
    let window = pagemap::map_unsafe(MAPPING_WINDOW, page);
    let next = *(window.as_usize() as *const u64);
    pagemap::unmap_unsafe(window);
    if next == memory::INVALID_PAGE as u64 {
        PhysPage::invalid()
    } else {
        PhysPage::from_start_address_unchecked(PhysAddr::new(next as usize))
    }
}

/// Writes `next`'s page number as the 8-byte next-pointer at the
/// base of `page`, through the mapping window.
///
/// # Safety
///
/// `page` must not currently be reachable by any other mapping.
///
unsafe fn push_free(page: PhysPage, next: PhysPage) {
    let window = pagemap::map_unsafe(MAPPING_WINDOW, page);
    let encoded = if next.is_invalid() {
        memory::INVALID_PAGE as u64
    } else {
        next.start_address().as_usize() as u64
    };
    *(window.as_usize() as *mut u64) = encoded;
    pagemap::unmap_unsafe(window);
}

/// Zeroes a freshly handed-out page through the mapping window.
///
/// # Safety
///
/// `page` must not currently be reachable by any other mapping.
///
unsafe fn zero_page(page: PhysPage) {
    let window = pagemap::map_unsafe(MAPPING_WINDOW, page);
    core::ptr::write_bytes(window.as_usize() as *mut u8, 0, PAGE_SIZE);
    pagemap::unmap_unsafe(window);
}

/// A linear allocator over the bootloader's memory map, used to
/// supply the page-table pages and buddy bookkeeping pages needed
/// before the buddy allocator itself exists.
///
/// Pages are handed out in ascending physical address order
/// within each usable region; once all regions are exhausted,
/// `alloc` falls back to a LIFO stack of pages that were
/// explicitly freed.
///
pub struct BootstrapPmm {
    entries: &'static [MemoryMapEntry],
    current: usize,
    boundary: PhysAddr,
    last_free: PhysPage,
    pages_handed_out: usize,
}

impl BootstrapPmm {
    /// Builds a bootstrap allocator over `map`.
    ///
    /// # Safety
    ///
    /// `map`'s entries must still be mapped and every byte in
    /// every region it marks usable, from `map.allocated_boundary`
    /// onward, must genuinely be unused RAM.
    ///
    pub unsafe fn new(map: &'static MemoryMap) -> Self {
        let entries = map.entries();
        let (current, boundary) = find_boundary_entry(entries, map.allocated_boundary);
        BootstrapPmm {
            entries,
            current,
            boundary,
            last_free: PhysPage::invalid(),
            pages_handed_out: 0,
        }
    }

    /// Returns the number of pages this allocator has handed out
    /// net of any it has taken back via `free`.
    ///
    pub fn pages_handed_out(&self) -> usize {
        self.pages_handed_out
    }

    /// Returns an iterator over every byte range of RAM this
    /// allocator has not yet handed out: the rest of its current
    /// region, then every subsequent usable region in full.
    ///
    /// Pages sitting on the free-list stack are not included,
    /// since they are already individually accounted for by
    /// whichever caller freed them. This is cheap to call
    /// repeatedly and does not consume the allocator, since the
    /// buddy constructor needs one snapshot to size its own
    /// bookkeeping before handing out the pages that back it, and
    /// a second snapshot afterward to release what is genuinely
    /// left over.
    ///
    pub fn remaining(&self) -> RemainingRanges {
        RemainingRanges {
            entries: self.entries,
            current: self.current,
            boundary: self.boundary,
        }
    }
}

impl SinglePageSource for BootstrapPmm {
    fn alloc(&mut self) -> PhysPage {
        if !self.last_free.is_invalid() {
            let page = self.last_free;
            // SAFETY: `page` was pushed by a prior call to `free`
            // and is reachable by nothing else.
            self.last_free = unsafe { read_next(page) };
            // SAFETY: `page` is no longer reachable through
            // `last_free` and has not yet been handed to the
            // caller.
            unsafe { zero_page(page) };
            self.pages_handed_out += 1;
            return page;
        }

        loop {
            if self.current >= self.entries.len() {
                return PhysPage::invalid();
            }
            let entry = self.entries[self.current];
            if !entry.is_usable() || self.boundary.as_usize() >= entry.end().as_usize() {
                self.current += 1;
                if self.current < self.entries.len() {
                    self.boundary = self.entries[self.current].start();
                }
                continue;
            }
            break;
        }

        let page = match PhysPage::from_start_address(self.boundary) {
            Ok(page) => page,
            Err(_) => return PhysPage::invalid(),
        };
        self.boundary += PAGE_SIZE;
        // SAFETY: `page` lies within a usable region at or past
        // `allocated_boundary` and has not yet been handed out.
        unsafe { zero_page(page) };
        self.pages_handed_out += 1;
        page
    }

    unsafe fn free(&mut self, page: PhysPage) {
        push_free(page, self.last_free);
        self.last_free = page;
        self.pages_handed_out -= 1;
    }
}

/// Iterates the byte ranges a [`BootstrapPmm`] had not yet handed
/// out as of a call to [`BootstrapPmm::remaining`].
///
/// `Clone` lets a consumer walk the ranges twice — once to size
/// whatever it is building, once to actually release them — as
/// the buddy allocator's constructor does.
///
#[derive(Clone, Copy)]
pub struct RemainingRanges {
    entries: &'static [MemoryMapEntry],
    current: usize,
    boundary: PhysAddr,
}

impl Iterator for RemainingRanges {
    type Item = (PhysAddr, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while self.current < self.entries.len() {
            let entry = self.entries[self.current];
            if !entry.is_usable() || self.boundary.as_usize() >= entry.end().as_usize() {
                self.current += 1;
                if self.current < self.entries.len() {
                    self.boundary = self.entries[self.current].start();
                }
                continue;
            }

            let begin = self.boundary;
            let size = entry.end().as_usize() - begin.as_usize();
            self.current += 1;
            if self.current < self.entries.len() {
                self.boundary = self.entries[self.current].start();
            }
            return Some((begin, size));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    #[test]
    fn test_find_boundary_entry_skips_exhausted_and_reserved_regions() {
        let entries = [
            MemoryMapEntry { begin: 0x1000, size: 0x1000, kind: 0, flags: 1 },
            MemoryMapEntry { begin: 0x2000, size: 0x1000, kind: 1, flags: 0 },
            MemoryMapEntry { begin: 0x3000, size: 0x2000, kind: 0, flags: 1 },
        ];
        let (i, boundary) = find_boundary_entry(&entries, PhysAddr::new(0x2000));
        assert_eq!(i, 2);
        assert_eq!(boundary, PhysAddr::new(0x3000));
    }

    #[test]
    fn test_remaining_ranges_covers_tail_of_current_and_later_regions() {
        let entries: &'static [MemoryMapEntry] = Box::leak(Box::new([
            MemoryMapEntry { begin: 0x1000, size: 0x2000, kind: 0, flags: 1 },
            MemoryMapEntry { begin: 0x4000, size: 0x1000, kind: 0, flags: 1 },
        ]));
        let remaining = RemainingRanges { entries, current: 0, boundary: PhysAddr::new(0x2000) };
        let ranges: alloc::vec::Vec<_> = remaining.collect();
        assert_eq!(
            ranges,
            alloc::vec![(PhysAddr::new(0x2000), 0x1000), (PhysAddr::new(0x4000), 0x1000)]
        );
    }
}
