// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tracks free virtual address ranges and hands them out on
//! request.
//!
//! Free ranges are kept in two intrusive AVL trees that share the
//! same set of nodes: one ordered by address, to find and merge
//! neighbours on release, and one ordered by size, to find a
//! best-fit range on acquisition. Both trees draw their nodes from
//! a small pool that carves them out of mapped pages rather than
//! the heap, since the virtual memory manager exists before any
//! heap does.

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

use align::align_up_usize;
use core::cmp::Ordering;
use core::ptr::NonNull;
use intrusive::avl::{Adapter, AvlTree, Comparator, Link};
use memory::{SinglePageSource, VirtAddr, PAGE_SIZE};

/// A free virtual address range, linked into both the address-
/// ordered and size-ordered trees at once.
///
struct FreeRange {
    address_link: Link<FreeRange>,
    size_link: Link<FreeRange>,
    /// Valid only while this node sits on the node pool's free
    /// list, unlinked from both trees.
    pool_next: Option<NonNull<FreeRange>>,
    begin: VirtAddr,
    size: usize,
}

impl FreeRange {
    const fn unlinked() -> Self {
        FreeRange {
            address_link: Link::new(),
            size_link: Link::new(),
            pool_next: None,
            begin: VirtAddr::zero(),
            size: 0,
        }
    }

    fn end(&self) -> VirtAddr {
        self.begin + self.size
    }
}

struct ByAddressAdapter;

// SAFETY: always borrows `address_link`, never `size_link`.
unsafe impl Adapter<FreeRange> for ByAddressAdapter {
    fn link(node: NonNull<FreeRange>) -> NonNull<Link<FreeRange>> {
        // SAFETY: `node` points to a live `FreeRange`.
        unsafe { NonNull::new_unchecked(core::ptr::addr_of_mut!((*node.as_ptr()).address_link)) }
    }
}

struct ByAddress;

impl Comparator<FreeRange> for ByAddress {
    type Key = VirtAddr;

    fn key(node: &FreeRange) -> &VirtAddr {
        &node.begin
    }

    fn compare(a: &VirtAddr, b: &VirtAddr) -> Ordering {
        a.cmp(b)
    }
}

struct BySizeAdapter;

// SAFETY: always borrows `size_link`, never `address_link`.
unsafe impl Adapter<FreeRange> for BySizeAdapter {
    fn link(node: NonNull<FreeRange>) -> NonNull<Link<FreeRange>> {
        // SAFETY: `node` points to a live `FreeRange`.
        unsafe { NonNull::new_unchecked(core::ptr::addr_of_mut!((*node.as_ptr()).size_link)) }
    }
}

struct BySize;

impl Comparator<FreeRange> for BySize {
    type Key = usize;

    fn key(node: &FreeRange) -> &usize {
        &node.size
    }

    fn compare(a: &usize, b: &usize) -> Ordering {
        a.cmp(b)
    }
}

type AddressTree = AvlTree<FreeRange, ByAddressAdapter, ByAddress>;
type SizeTree = AvlTree<FreeRange, BySizeAdapter, BySize>;

/// A pool of [`FreeRange`] nodes carved out of whole pages, so the
/// virtual memory manager never needs a heap of its own.
///
struct NodePool {
    free: Option<NonNull<FreeRange>>,
}

impl NodePool {
    const fn new() -> Self {
        NodePool { free: None }
    }

    fn pop(&mut self) -> Option<NonNull<FreeRange>> {
        let node = self.free?;
        // SAFETY: every node on this list was linked by `push` or
        // `grow` and is live until it is popped.
        self.free = unsafe { node.as_ref().pool_next };
        Some(node)
    }

    /// Returns `node` to the pool. `node` must not be linked into
    /// either tree.
    fn push(&mut self, mut node: NonNull<FreeRange>) {
        // SAFETY: the caller just unlinked `node` from both trees.
        unsafe { node.as_mut().pool_next = self.free };
        self.free = Some(node);
    }

    /// Carves `page`, a single mapped and otherwise-unused page, into
    /// `FreeRange` slots and pushes every one onto the free list.
    ///
    /// # Safety
    ///
    /// `page` must point to `PAGE_SIZE` bytes that this pool owns
    /// exclusively, mapped and writable.
    ///
    unsafe fn grow(&mut self, page: VirtAddr) {
        let slot_size = core::mem::size_of::<FreeRange>();
        let slots = PAGE_SIZE / slot_size;
        let base = page.as_usize();
        for i in 0..slots {
            let slot = (base + i * slot_size) as *mut FreeRange;
            slot.write(FreeRange::unlinked());
            self.push(NonNull::new_unchecked(slot));
        }
    }
}

/// No range in the address space is large enough to satisfy a
/// request.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireError {
    /// No free range is at least as large as the request.
    OutOfVirtualSpace,
}

/// Tracks the free ranges of a single virtual address space and
/// hands out contiguous ranges of virtual addresses on request.
///
/// `P` supplies the physical pages this manager needs to grow its
/// own node pool; in practice it is the same page source that the
/// rest of the kernel draws physical memory from.
///
pub struct Vmm<P> {
    by_address: AddressTree,
    by_size: SizeTree,
    pool: NodePool,
    page_alloc: P,
}

// SAFETY: a `Vmm` holds no thread-local state of its own; callers
// serialise access with a lock before touching it, same as every
// other allocator in this core.
unsafe impl<P: Send> Send for Vmm<P> {}

impl<P: SinglePageSource> Vmm<P> {
    /// Returns a new, empty virtual memory manager.
    ///
    /// No range is available to hand out until [`release_range`] has
    /// been called at least once to seed it, typically with the span
    /// of address space the caller has set aside for dynamic use.
    ///
    /// [`release_range`]: Vmm::release_range
    ///
    pub fn new(page_alloc: P) -> Self {
        Vmm {
            by_address: AddressTree::new(),
            by_size: SizeTree::new(),
            pool: NodePool::new(),
            page_alloc,
        }
    }

    /// Returns the number of free ranges currently tracked.
    ///
    pub fn free_range_count(&self) -> usize {
        self.by_address.len()
    }

    /// Returns the sum of every free range's size, in bytes.
    ///
    pub fn free_bytes(&self) -> usize {
        self.by_address
            .iter()
            // SAFETY: every node reachable from the tree is live.
            .map(|n| unsafe { n.as_ref().size })
            .sum()
    }

    /// Finds the node with the largest `begin` that is still `<=`
    /// `target`, i.e. the one whose range could extend up to
    /// `target` from the left.
    ///
    fn floor(&self, target: VirtAddr) -> Option<NonNull<FreeRange>> {
        match self.by_address.lower_bound(&target) {
            // SAFETY: `n` is linked into the address tree.
            Some(n) if unsafe { n.as_ref().begin } == target => Some(n),
            Some(n) => AddressTree::predecessor(n),
            None => self.by_address.last(),
        }
    }

    /// Removes `node` from both trees.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into both trees.
    ///
    unsafe fn unlink(&mut self, node: NonNull<FreeRange>) {
        self.by_address.remove(node);
        self.by_size.remove(node);
    }

    /// Links `node`, already carrying its final `begin`/`size`, into
    /// both trees.
    ///
    /// # Safety
    ///
    /// `node` must not already be linked into either tree.
    ///
    unsafe fn link(&mut self, node: NonNull<FreeRange>) {
        self.by_address.insert(node);
        self.by_size.insert(node);
    }

    /// Reserves `size` bytes of virtual address space and returns
    /// its base address.
    ///
    /// `size` is rounded up to a whole number of pages; a request
    /// for zero bytes always succeeds with
    /// [`VirtAddr::zero`](memory::VirtAddr::zero) without consuming
    /// any range. An exact match is preferred; otherwise the
    /// smallest range that still fits is split, and the unused tail
    /// is kept free.
    ///
    pub fn acquire_range(&mut self, size: usize) -> Result<VirtAddr, AcquireError> {
        if size == 0 {
            return Ok(VirtAddr::zero());
        }
        let size = align_up_usize(size, PAGE_SIZE);
        if let Some(node) = self.by_size.find(&size) {
            // SAFETY: `node` was just found linked into both trees.
            let begin = unsafe {
                self.unlink(node);
                let begin = node.as_ref().begin;
                self.pool.push(node);
                begin
            };
            return Ok(begin);
        }

        let node = self.by_size.lower_bound(&size).ok_or(AcquireError::OutOfVirtualSpace)?;
        // SAFETY: `node` was just found linked into both trees, and
        // we immediately re-link it with its shrunk extent.
        unsafe {
            self.unlink(node);
            let begin = node.as_ref().begin;
            let mut remainder = node;
            remainder.as_mut().begin = begin + size;
            remainder.as_mut().size -= size;
            self.link(remainder);
            Ok(begin)
        }
    }

    /// Returns `size` bytes of virtual address space starting at
    /// `begin` to the pool of free ranges, merging it with
    /// neighbouring free ranges where possible.
    ///
    /// The first release after construction (or after the pool runs
    /// dry) maps the leading page of the range being released to
    /// grow the node pool, rather than requiring a pool to already
    /// exist before any range can be freed.
    ///
    /// # Panics
    ///
    /// Panics if `begin` or `size` is not page-aligned, or if the
    /// range overlaps a range already marked free (a double
    /// release).
    ///
    pub fn release_range(&mut self, mut begin: VirtAddr, mut size: usize) {
        assert!(begin.is_aligned(PAGE_SIZE), "release of a misaligned address");
        assert!(size % PAGE_SIZE == 0, "release of a non-page-aligned size");

        if self.pool.free.is_none() {
            assert!(size >= PAGE_SIZE, "not enough space to seed the node pool");
            pagemap::map_with_alloc_one(begin, PAGE_SIZE, &mut self.page_alloc)
                .expect("failed to map a page to grow the virtual memory manager's node pool");
            // SAFETY: the page was just mapped for this purpose and
            // is not reachable anywhere else yet.
            unsafe { self.pool.grow(begin) };
            begin += PAGE_SIZE;
            size -= PAGE_SIZE;
            if size == 0 {
                return;
            }
        }

        let end = begin + size;

        // The node the in-order walk would reach first whose end lies
        // past `begin`: either the floor itself, if it reaches that
        // far, or whatever comes right after it.
        let floor = self.floor(begin);
        let overlap_candidate = match floor {
            // SAFETY: `f` is linked into the address tree.
            Some(f) if unsafe { f.as_ref().end() } > begin => Some(f),
            Some(f) => AddressTree::successor(f),
            None => self.by_address.first(),
        };
        let boundary_candidate = self.by_address.lower_bound(&end);
        assert!(
            overlap_candidate == boundary_candidate,
            "double release of virtual address range"
        );

        let left = floor.filter(|&l| unsafe { l.as_ref().end() } == begin);
        let right = boundary_candidate.filter(|&r| unsafe { r.as_ref().begin } == end);

        match (left, right) {
            (Some(l), Some(r)) => {
                // SAFETY: `l` and `r` are both linked into both
                // trees, and are distinct nodes since they sit on
                // opposite sides of `[begin, end)`.
                unsafe {
                    self.unlink(l);
                    self.unlink(r);
                    let mut merged = l;
                    merged.as_mut().size += size + r.as_ref().size;
                    self.pool.push(r);
                    self.link(merged);
                }
            }
            (Some(l), None) => {
                // SAFETY: `l` is linked into both trees.
                unsafe {
                    self.unlink(l);
                    let mut merged = l;
                    merged.as_mut().size += size;
                    self.link(merged);
                }
            }
            (None, Some(r)) => {
                // SAFETY: `r` is linked into both trees.
                unsafe {
                    self.unlink(r);
                    let mut merged = r;
                    merged.as_mut().begin = begin;
                    merged.as_mut().size += size;
                    self.link(merged);
                }
            }
            (None, None) => {
                let mut node = self.pool.pop().expect("node pool exhausted during release");
                // SAFETY: `node` just came off the pool and is
                // linked nowhere.
                unsafe {
                    node.as_mut().begin = begin;
                    node.as_mut().size = size;
                    self.link(node);
                }
            }
        }
    }

    /// Walks the free ranges in address order, for diagnostic use.
    ///
    pub fn debug_ranges(&self) -> impl Iterator<Item = (VirtAddr, usize)> + '_ {
        self.by_address
            .iter()
            // SAFETY: every node reachable from the tree is live.
            .map(|n| unsafe { (n.as_ref().begin, n.as_ref().size) })
    }
}

/// The kernel's single virtual address-range manager, drawing the
/// physical pages for its own node pool from [`buddy::ALLOCATOR`].
///
/// Stays `None` until [`init`] constructs it; [`release_range`] is
/// then called once per region of address space the kernel wants to
/// hand out (the small-map heap, then high memory).
///
pub static ALLOCATOR: spin::Mutex<Option<Vmm<buddy::GlobalSource>>> = spin::Mutex::new(None);

/// Builds the singleton virtual memory manager, empty until
/// [`release_range`] seeds it.
///
pub fn init() {
    *ALLOCATOR.lock() = Some(Vmm::new(buddy::GlobalSource));
}

/// Reserves `size` bytes of virtual address space from the singleton
/// manager.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn acquire_range(size: usize) -> Result<VirtAddr, AcquireError> {
    ALLOCATOR.lock().as_mut().expect("vmm used before init").acquire_range(size)
}

/// Returns `size` bytes of virtual address space starting at `begin`
/// to the singleton manager.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn release_range(begin: VirtAddr, size: usize) {
    ALLOCATOR.lock().as_mut().expect("vmm used before init").release_range(begin, size);
}

/// Calls `f` once for every free range the singleton manager
/// currently tracks, in address order.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn for_each_free_range<F: FnMut(VirtAddr, usize)>(mut f: F) {
    let guard = ALLOCATOR.lock();
    let vmm = guard.as_ref().expect("vmm used before init");
    for (begin, size) in vmm.debug_ranges() {
        f(begin, size);
    }
}

/// Returns the number of free ranges the singleton manager
/// currently tracks.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn free_range_count() -> usize {
    ALLOCATOR.lock().as_ref().expect("vmm used before init").free_range_count()
}

/// Returns the sum of every free range the singleton manager
/// currently tracks, in bytes.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn free_bytes() -> usize {
    ALLOCATOR.lock().as_ref().expect("vmm used before init").free_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A page source that hands out pages from a small backing
    /// buffer, enough to exercise node pool growth without any real
    /// mapping hardware.
    struct FakeSource;

    impl SinglePageSource for FakeSource {
        fn alloc(&mut self) -> memory::PhysPage {
            memory::PhysPage::invalid()
        }

        unsafe fn free(&mut self, _page: memory::PhysPage) {}
    }

    /// Builds a `Vmm` and seeds it directly, bypassing
    /// `release_range`'s node-pool-growth path (which needs a real
    /// mapper) by growing the pool from a page-aligned stack buffer.
    fn vmm_with_capacity(begin: VirtAddr, size: usize) -> Vmm<FakeSource> {
        let mut vmm = Vmm::new(FakeSource);
        let storage = alloc::boxed::Box::leak(alloc::boxed::Box::new([0u8; PAGE_SIZE]));
        let page = VirtAddr::new(storage.as_mut_ptr() as usize);
        // SAFETY: `storage` is exclusively owned by this leaked box
        // and never touched again except through the pool.
        unsafe { vmm.pool.grow(page) };
        let mut node = vmm.pool.pop().unwrap();
        // SAFETY: `node` just came off the pool, linked nowhere.
        unsafe {
            node.as_mut().begin = begin;
            node.as_mut().size = size;
            vmm.link(node);
        }
        vmm
    }

    #[test]
    fn test_acquire_exact_match_consumes_the_whole_range() {
        let mut vmm = vmm_with_capacity(VirtAddr::new(0x1000), 0x1000);
        let addr = vmm.acquire_range(0x1000).unwrap();
        assert_eq!(addr, VirtAddr::new(0x1000));
        assert_eq!(vmm.free_range_count(), 0);
    }

    #[test]
    fn test_acquire_splits_a_larger_range() {
        let mut vmm = vmm_with_capacity(VirtAddr::new(0x1000), 0x4000);
        let addr = vmm.acquire_range(0x1000).unwrap();
        assert_eq!(addr, VirtAddr::new(0x1000));
        assert_eq!(vmm.free_range_count(), 1);
        assert_eq!(vmm.free_bytes(), 0x3000);
    }

    #[test]
    fn test_acquire_rounds_up_to_a_whole_page() {
        let mut vmm = vmm_with_capacity(VirtAddr::new(0x1000), 0x2000);
        let addr = vmm.acquire_range(1).unwrap();
        assert_eq!(addr, VirtAddr::new(0x1000));
        assert_eq!(vmm.free_bytes(), 0x1000);
    }

    #[test]
    fn test_acquire_fails_when_nothing_fits() {
        let mut vmm = vmm_with_capacity(VirtAddr::new(0x1000), 0x1000);
        assert_eq!(vmm.acquire_range(0x2000), Err(AcquireError::OutOfVirtualSpace));
    }

    #[test]
    fn test_release_merges_with_both_neighbours() {
        let mut vmm = vmm_with_capacity(VirtAddr::new(0x1000), 0x1000);
        vmm.release_range(VirtAddr::new(0x3000), 0x1000);
        assert_eq!(vmm.free_range_count(), 2);
        vmm.release_range(VirtAddr::new(0x2000), 0x1000);
        assert_eq!(vmm.free_range_count(), 1);
        assert_eq!(vmm.free_bytes(), 0x3000);
        let first = vmm.by_address.first().unwrap();
        // SAFETY: `first` is linked into the tree.
        assert_eq!(unsafe { first.as_ref().begin }, VirtAddr::new(0x1000));
    }

    #[test]
    fn test_release_with_no_neighbours_adds_a_new_range() {
        let mut vmm = vmm_with_capacity(VirtAddr::new(0x1000), 0x1000);
        vmm.release_range(VirtAddr::new(0x5000), 0x1000);
        assert_eq!(vmm.free_range_count(), 2);
        assert_eq!(vmm.free_bytes(), 0x2000);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_release_overlapping_range_panics() {
        let mut vmm = vmm_with_capacity(VirtAddr::new(0x1000), 0x2000);
        vmm.release_range(VirtAddr::new(0x1000), 0x1000);
    }

    #[test]
    fn test_acquire_then_release_round_trips() {
        let mut vmm = vmm_with_capacity(VirtAddr::new(0x1000), 0x3000);
        let addr = vmm.acquire_range(0x1000).unwrap();
        vmm.release_range(addr, 0x1000);
        assert_eq!(vmm.free_range_count(), 1);
        assert_eq!(vmm.free_bytes(), 0x3000);
    }
}
