// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A power-of-two buddy allocator over physical memory.
//!
//! Free blocks at each level are threaded into a doubly-linked
//! list whose `{prev, next}` record lives in the block's own
//! first sixteen bytes, read and written through the mapping
//! window exactly as the bootstrap allocator does. A single bit
//! per buddy pair, packed into a bitmap mapped once at
//! construction, records whether exactly one block of the pair
//! is currently free; that bit is what lets `insert` decide
//! whether to merge a pair back into its parent level instead of
//! pushing the block onto its own level's list.

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

use align::align_up_usize;
use memory::{PhysAddr, PhysPage, SinglePageSource, BUDDY_METADATA_START, INVALID_PAGE, MAPPING_WINDOW, PAGE_SIZE};

/// The `{prev, next}` record threaded through a free block's own
/// first sixteen bytes.
///
#[derive(Clone, Copy)]
struct Link {
    prev: PhysPage,
    next: PhysPage,
}

fn encode(page: PhysPage) -> u64 {
    if page.is_invalid() {
        INVALID_PAGE as u64
    } else {
        page.start_address().as_usize() as u64
    }
}

fn decode(raw: u64) -> PhysPage {
    if raw == INVALID_PAGE as u64 {
        PhysPage::invalid()
    } else {
        // SAFETY: every value written by `encode` is either the
        // sentinel or a page-aligned address taken from a real
        // `PhysPage`.
        unsafe { PhysPage::from_start_address_unchecked(PhysAddr::new(raw as usize)) }
    }
}

/// Reads the link record stored at the base of `block`.
///
/// # Safety
///
/// `block` must currently hold a valid link record, i.e. it must
/// be on a buddy free list.
///
unsafe fn read_link(block: PhysPage) -> Link {
    let window = pagemap::map_unsafe(MAPPING_WINDOW, block);
    let ptr = window.as_usize() as *const u64;
    let link = Link {
        prev: decode(*ptr),
        next: decode(*ptr.add(1)),
    };
    pagemap::unmap_unsafe(window);
    link
}

/// Writes `link` to the base of `block`.
///
/// # Safety
///
/// `block` must not currently be reachable by any other mapping.
///
unsafe fn write_link(block: PhysPage, link: Link) {
    let window = pagemap::map_unsafe(MAPPING_WINDOW, block);
    let ptr = window.as_usize() as *mut u64;
    *ptr = encode(link.prev);
    *ptr.add(1) = encode(link.next);
    pagemap::unmap_unsafe(window);
}

/// The index into the pair bitmap for the buddy pair containing
/// `block` at `level`, given that the allocator manages
/// `1 << max_level` pages starting at `range_begin`.
///
fn pair_bit_index(max_level: u8, range_begin: PhysAddr, level: u8, block: PhysPage) -> usize {
    let page_offset = (block.start_address().as_usize() - range_begin.as_usize()) / PAGE_SIZE;
    let block_index = page_offset >> level;
    let pair_number = block_index >> 1;
    let total_pages = 1usize << max_level;
    let level_offset = total_pages - (total_pages >> level);
    level_offset + pair_number
}

/// The other block in `block`'s buddy pair at `level`.
///
fn buddy_of(range_begin: PhysAddr, level: u8, block: PhysPage) -> PhysPage {
    let page_offset = (block.start_address().as_usize() - range_begin.as_usize()) / PAGE_SIZE;
    let block_index = page_offset >> level;
    let buddy_index = block_index ^ 1;
    let buddy_page_offset = buddy_index << level;
    let addr = range_begin + buddy_page_offset * PAGE_SIZE;
    // SAFETY: not dereferenced; `addr` is a multiple of `PAGE_SIZE`
    // because `buddy_page_offset` is a page count.
    unsafe { PhysPage::from_start_address_unchecked(addr) }
}

/// The level at which [`Buddy::release_range`] should hand back
/// the top-aligned block of `[begin, end)`, the largest
/// power-of-two, correctly-aligned block that fits against `end`.
///
fn release_level(end: usize, span: usize) -> u32 {
    let ctz_end = if end == 0 { usize::BITS } else { end.trailing_zeros() };
    let log2_span = usize::BITS - 1 - span.leading_zeros();
    core::cmp::min(ctz_end, log2_span)
}

/// A power-of-two buddy allocator managing a contiguous window
/// of `1 << max_level` physical pages.
///
/// Every byte of bookkeeping this allocator needs — the pair
/// bitmap and the per-level free-list heads — lives in a region
/// mapped once at construction, starting at
/// [`memory::BUDDY_METADATA_START`]; nothing about an `alloc` or
/// `free` call needs to map or unmap that region again.
///
pub struct Buddy {
    range_begin: PhysAddr,
    max_level: u8,
    bitmap: *mut u8,
    heads: *mut u64,
}

// SAFETY: `Buddy` has no thread-local state; every caller across
// this core serialises access to an allocator singleton with its
// own lock before touching it.
unsafe impl Send for Buddy {}

impl Buddy {
    /// Builds a buddy allocator spanning `bootstrap`'s remaining
    /// inventory, then releases whatever of that inventory is
    /// still unclaimed once the allocator's own bookkeeping has
    /// been carved out of it.
    ///
    /// `bootstrap` supplies both the leaf and intermediate pages
    /// the bookkeeping mapping needs; the span is sized from a
    /// snapshot taken before that mapping, and the pages it
    /// consumes are excluded from what gets released by taking a
    /// second snapshot afterward, so no page is ever both backing
    /// the bookkeeping and sitting free on a buddy list.
    ///
    /// # Panics
    ///
    /// Panics if `bootstrap` has nothing left to give, or if the
    /// bookkeeping region does not fit within
    /// `[BUDDY_METADATA_START, BUDDY_METADATA_END)`.
    ///
    /// # Safety
    ///
    /// Every range `bootstrap` yields must describe physical
    /// memory that is genuinely free.
    ///
    /// Returns the allocator alongside the number of pages it
    /// released into its own free lists, for callers that want
    /// to report it.
    ///
    pub unsafe fn new(mut bootstrap: bootpmm::BootstrapPmm) -> (Self, usize) {
        let mut min_begin: Option<PhysAddr> = None;
        let mut max_end: Option<PhysAddr> = None;
        for (begin, size) in bootstrap.remaining() {
            let end = begin + size;
            min_begin = Some(match min_begin {
                Some(m) if m.as_usize() <= begin.as_usize() => m,
                _ => begin,
            });
            max_end = Some(match max_end {
                Some(m) if m.as_usize() >= end.as_usize() => m,
                _ => end,
            });
        }
        let (min_begin, max_end) = match (min_begin, max_end) {
            (Some(a), Some(b)) => (a, b),
            _ => panic!("buddy allocator constructed with no available memory"),
        };

        let range_begin = min_begin.align_down(PAGE_SIZE);
        let pages_needed = (max_end.as_usize() - range_begin.as_usize() + PAGE_SIZE - 1) / PAGE_SIZE;
        let mut max_level = 0u8;
        while (1usize << max_level) < pages_needed {
            max_level += 1;
        }

        let total_bits = (1usize << max_level) - 1;
        let bitmap_bytes = (total_bits + 7) / 8;
        let heads_offset = align_up_usize(bitmap_bytes, 8);
        let heads_bytes = (max_level as usize + 1) * 8;
        let metadata_bytes = align_up_usize(heads_offset + heads_bytes, PAGE_SIZE);

        pagemap::map_with_alloc_one(BUDDY_METADATA_START, metadata_bytes, &mut bootstrap)
            .expect("buddy bookkeeping region failed to map");

        let bitmap = BUDDY_METADATA_START.as_usize() as *mut u8;
        let heads = (BUDDY_METADATA_START.as_usize() + heads_offset) as *mut u64;
        for level in 0..=max_level as usize {
            *heads.add(level) = INVALID_PAGE as u64;
        }

        let mut buddy = Buddy {
            range_begin,
            max_level,
            bitmap,
            heads,
        };
        let mut pages_released = 0usize;
        for (begin, size) in bootstrap.remaining() {
            buddy.release_range(begin, begin + size);
            pages_released += size / PAGE_SIZE;
        }
        (buddy, pages_released)
    }

    /// Returns the highest level this allocator can satisfy a
    /// request at, i.e. `log2` of the number of pages it manages.
    ///
    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    fn get_bit(&self, index: usize) -> bool {
        // SAFETY: `index` is always derived from `pair_bit_index`,
        // which stays within the bitmap this allocator mapped.
        unsafe { (*self.bitmap.add(index / 8) >> (index % 8)) & 1 != 0 }
    }

    /// Flips the bit at `index` and returns its new value.
    ///
    fn toggle_bit(&mut self, index: usize) -> bool {
        // SAFETY: see `get_bit`.
        unsafe {
            let byte = self.bitmap.add(index / 8);
            *byte ^= 1 << (index % 8);
            (*byte >> (index % 8)) & 1 != 0
        }
    }

    fn head(&self, level: u8) -> PhysPage {
        // SAFETY: `level` is always `<= self.max_level`, within
        // the heads array this allocator mapped.
        decode(unsafe { *self.heads.add(level as usize) })
    }

    fn set_head(&mut self, level: u8, page: PhysPage) {
        // SAFETY: see `head`.
        unsafe { *self.heads.add(level as usize) = encode(page) };
    }

    /// Splices `page` out of `level`'s free list, wherever in the
    /// list it currently sits.
    ///
    /// # Safety
    ///
    /// `page` must currently be linked into `level`'s free list.
    ///
    unsafe fn unlink(&mut self, level: u8, page: PhysPage) {
        let link = read_link(page);
        if link.prev.is_invalid() {
            self.set_head(level, link.next);
        } else {
            let mut prev_link = read_link(link.prev);
            prev_link.next = link.next;
            write_link(link.prev, prev_link);
        }
        if !link.next.is_invalid() {
            let mut next_link = read_link(link.next);
            next_link.prev = link.prev;
            write_link(link.next, next_link);
        }
    }

    /// Pushes `block` onto `level`'s free list, merging it with
    /// its buddy into `level + 1` first if the buddy is already
    /// free.
    ///
    /// # Safety
    ///
    /// `block` must not already be free at `level` or any level
    /// below it, and must not currently be in use.
    ///
    unsafe fn insert(&mut self, level: u8, block: PhysPage) {
        if level < self.max_level {
            let index = pair_bit_index(self.max_level, self.range_begin, level, block);
            if self.toggle_bit(index) {
                // The buddy was not free; push `block` here.
            } else {
                // The bit went 1 -> 0: the buddy was free. Pull it
                // out and promote the pair's lower-addressed block
                // up a level instead of keeping either here.
                let buddy = buddy_of(self.range_begin, level, block);
                self.unlink(level, buddy);
                let lower = if buddy.start_address().as_usize() < block.start_address().as_usize() {
                    buddy
                } else {
                    block
                };
                self.insert(level + 1, lower);
                return;
            }
        }

        let old_head = self.head(level);
        write_link(
            block,
            Link {
                prev: PhysPage::invalid(),
                next: old_head,
            },
        );
        if !old_head.is_invalid() {
            let mut old_link = read_link(old_head);
            old_link.prev = block;
            write_link(old_head, old_link);
        }
        self.set_head(level, block);
    }

    /// Pops the head of `level`'s free list, or returns
    /// [`PhysPage::invalid`] if it is empty.
    ///
    fn extract(&mut self, level: u8) -> PhysPage {
        let head = self.head(level);
        if head.is_invalid() {
            return head;
        }
        // SAFETY: `head` was just read off `level`'s own list.
        let link = unsafe { read_link(head) };
        self.set_head(level, link.next);
        if !link.next.is_invalid() {
            // SAFETY: `link.next` is still linked into the list.
            let mut next_link = unsafe { read_link(link.next) };
            next_link.prev = PhysPage::invalid();
            // SAFETY: `link.next` is still exclusively tracked by
            // this free list.
            unsafe { write_link(link.next, next_link) };
        }

        if level < self.max_level {
            let index = pair_bit_index(self.max_level, self.range_begin, level, head);
            assert!(
                self.get_bit(index),
                "buddy pair bit inconsistent with free-list contents"
            );
            self.toggle_bit(index);
        }

        head
    }

    /// Allocates a single page at `level`, splitting a larger
    /// free block if no block of exactly `level` is free.
    ///
    /// Returns [`PhysPage::invalid`] if no block of `level` or
    /// above is available.
    ///
    pub fn alloc_level(&mut self, level: u8) -> PhysPage {
        let mut current = level;
        while current <= self.max_level {
            let block = self.extract(current);
            if !block.is_invalid() {
                let mut cursor = current;
                while cursor > level {
                    cursor -= 1;
                    let upper = block.offset(1usize << cursor);
                    // SAFETY: `upper` is the untouched other half
                    // of the block just extracted, and has not
                    // been inserted anywhere yet.
                    unsafe { self.insert(cursor, upper) };
                }
                return block;
            }
            current += 1;
        }
        PhysPage::invalid()
    }

    /// Releases `page`, previously returned by `alloc_level(level)`,
    /// back to the allocator.
    ///
    /// # Safety
    ///
    /// `page` must have come from a matching `alloc_level(level)`
    /// call and must not still be in use.
    ///
    pub unsafe fn free_level(&mut self, level: u8, page: PhysPage) {
        self.insert(level, page);
    }

    /// Releases every page in `[begin, end)` back to the
    /// allocator, peeling off the largest aligned power-of-two
    /// block against `end` on each pass.
    ///
    fn release_range(&mut self, begin: PhysAddr, mut end: PhysAddr) {
        while end.as_usize() > begin.as_usize() {
            let span = end.as_usize() - begin.as_usize();
            let level = release_level(end.as_usize(), span).saturating_sub(12);
            let level = (level as u8).min(self.max_level);
            let block_pages = 1usize << level;
            let new_end = end - block_pages * PAGE_SIZE;
            let block = PhysPage::from_start_address(new_end).expect("misaligned release boundary");
            // SAFETY: `block` lies within a range the constructor's
            // caller promised is genuinely free.
            unsafe { self.insert(level, block) };
            end = new_end;
        }
    }
}

impl SinglePageSource for Buddy {
    fn alloc(&mut self) -> PhysPage {
        self.alloc_level(0)
    }

    unsafe fn free(&mut self, page: PhysPage) {
        self.free_level(0, page);
    }
}

/// The kernel's single physical-page buddy allocator.
///
/// Stays `None` until [`init`] builds it from whatever the bootstrap
/// allocator has left over; every allocation in the kernel after
/// that point goes through this lock, directly or via
/// [`GlobalSource`].
///
pub static ALLOCATOR: spin::Mutex<Option<Buddy>> = spin::Mutex::new(None);

/// Builds the singleton allocator from `bootstrap`'s remaining
/// inventory, returning the number of pages it released into its
/// own free lists.
///
/// # Safety
///
/// See [`Buddy::new`].
///
pub unsafe fn init(bootstrap: bootpmm::BootstrapPmm) -> usize {
    let (buddy, pages_released) = Buddy::new(bootstrap);
    *ALLOCATOR.lock() = Some(buddy);
    pages_released
}

/// The highest level the singleton allocator can satisfy a request
/// at.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn max_level() -> u8 {
    ALLOCATOR.lock().as_ref().expect("buddy allocator used before init").max_level()
}

/// Allocates a `2^level`-page block from the singleton allocator.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn alloc_level(level: u8) -> PhysPage {
    ALLOCATOR.lock().as_mut().expect("buddy allocator used before init").alloc_level(level)
}

/// Releases a `2^level`-page block, previously returned by
/// [`alloc_level`], back to the singleton allocator.
///
/// # Safety
///
/// See [`Buddy::free_level`].
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub unsafe fn free_level(level: u8, page: PhysPage) {
    ALLOCATOR
        .lock()
        .as_mut()
        .expect("buddy allocator used before init")
        .free_level(level, page);
}

/// A [`SinglePageSource`] that forwards to the singleton allocator
/// in [`ALLOCATOR`], for callers that need an `impl SinglePageSource`
/// but have no `Buddy` of their own to hand one.
///
#[derive(Clone, Copy, Default)]
pub struct GlobalSource;

impl SinglePageSource for GlobalSource {
    fn alloc(&mut self) -> PhysPage {
        alloc_level(0)
    }

    unsafe fn free(&mut self, page: PhysPage) {
        free_level(0, page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_bit_index_groups_adjacent_blocks() {
        let begin = PhysAddr::new(0x10_0000);
        let max_level = 4;
        let a = PhysPage::from_start_address(begin).unwrap();
        let b = PhysPage::from_start_address(begin + PAGE_SIZE).unwrap();
        assert_eq!(
            pair_bit_index(max_level, begin, 0, a),
            pair_bit_index(max_level, begin, 0, b)
        );

        let c = PhysPage::from_start_address(begin + 2 * PAGE_SIZE).unwrap();
        assert_ne!(
            pair_bit_index(max_level, begin, 0, a),
            pair_bit_index(max_level, begin, 0, c)
        );
    }

    #[test]
    fn test_pair_bit_index_levels_dont_collide() {
        let begin = PhysAddr::new(0);
        let max_level = 3;
        let a = PhysPage::from_start_address(begin).unwrap();
        let b = PhysPage::from_start_address(begin + 2 * PAGE_SIZE).unwrap();
        assert_ne!(
            pair_bit_index(max_level, begin, 0, a),
            pair_bit_index(max_level, begin, 1, b)
        );
    }

    #[test]
    fn test_buddy_of_is_its_own_inverse() {
        let begin = PhysAddr::new(0x20_0000);
        let a = PhysPage::from_start_address(begin).unwrap();
        let buddy = buddy_of(begin, 0, a);
        assert_eq!(buddy_of(begin, 0, buddy), a);
        assert_ne!(buddy, a);
    }

    #[test]
    fn test_buddy_of_respects_level_granularity() {
        let begin = PhysAddr::new(0);
        let a = PhysPage::from_start_address(begin).unwrap();
        let buddy = buddy_of(begin, 2, a);
        assert_eq!(buddy.start_address(), begin + 4 * PAGE_SIZE);
    }

    #[test]
    fn test_release_level_picks_the_largest_fitting_aligned_block() {
        // A 16-page range ending on a 16-page boundary can be
        // released as one block: ctz(end) and log2(span) agree.
        let end = 16 * PAGE_SIZE;
        let span = 16 * PAGE_SIZE;
        assert_eq!(release_level(end, span), end.trailing_zeros());

        // A 3-page range can only be released one page at a time,
        // since 3 isn't a power of two.
        let end = 3 * PAGE_SIZE;
        let span = 3 * PAGE_SIZE;
        assert_eq!(release_level(end, span), (PAGE_SIZE).trailing_zeros());
    }

    #[test]
    fn test_total_pair_bits_matches_bitmap_sizing() {
        // The number of pair bits a `max_level`-deep allocator
        // needs is `2^max_level - 1`: one bit per node of the
        // implicit binary tree over blocks, excluding the root.
        for max_level in 0u8..8 {
            let total_pages = 1usize << max_level;
            let mut total_bits = 0;
            for level in 0..max_level {
                let level_offset = total_pages - (total_pages >> level);
                let next_offset = total_pages - (total_pages >> (level + 1));
                total_bits += next_offset - level_offset;
            }
            assert_eq!(total_bits, total_pages - 1);
        }
    }
}
